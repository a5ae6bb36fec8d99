use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{Matrix3x4, Point2, Point3, Rotation3, Vector3};
use ndarray::{Array2, ArrayView1};

use crate::camera::CameraTrait;
use crate::global_types::{Frame, KeyframeId, LandmarkId, PointSlot, Pose3D, Timestamp};

/// 关键帧
///
/// `point_slots[i]` 记录第 i 个特征点对应的路标，`point_indices` 是它的反向索引，
/// 两者始终保持一致。
#[derive(Debug, Clone)]
pub struct Keyframe<C: CameraTrait> {
    pub id: KeyframeId,
    pub timestamp: Timestamp,
    /// 当前估计的位姿，BA 之后更新
    pub pose: Pose3D,
    /// 创建时的位姿，BA 中作为软约束
    pub ref_pose: Pose3D,
    keypoints: Vec<Point2<f64>>,
    descriptors: Array2<f32>,
    point_slots: Vec<PointSlot>,
    point_indices: BTreeMap<LandmarkId, usize>,
    pub camera: Arc<C>,
}

impl<C: CameraTrait> Keyframe<C> {
    pub fn new(id: KeyframeId, frame: &Frame, camera: Arc<C>) -> Self {
        let npts = frame.keypoints.len().min(frame.descriptors.nrows());
        if npts != frame.keypoints.len() || npts != frame.descriptors.nrows() {
            log::warn!(
                "frame has {} keypoints but {} descriptors, keeping {}",
                frame.keypoints.len(),
                frame.descriptors.nrows(),
                npts
            );
        }
        let descriptors = frame
            .descriptors
            .slice(ndarray::s![..npts, ..])
            .to_owned();
        log::info!("created keyframe {}. It has {} (unmatched) points", id, npts);
        Self {
            id,
            timestamp: frame.timestamp,
            pose: frame.pose,
            ref_pose: frame.pose,
            keypoints: frame.keypoints[..npts].to_vec(),
            descriptors,
            point_slots: vec![PointSlot::Unmapped; npts],
            point_indices: BTreeMap::new(),
            camera,
        }
    }

    /// setAsSeeing
    ///
    /// 返回 false 表示没有建立关联：该路标已经在这个关键帧中，或该特征点已对应其他路标
    pub fn set_as_seeing(&mut self, pt_id: LandmarkId, idx: usize) -> bool {
        if self.point_indices.contains_key(&pt_id) {
            log::debug!("keyframe {} already sees landmark {}", self.id, pt_id);
            return false;
        }
        match self.point_slots.get(idx) {
            None => {
                log::warn!("keyframe {} has no keypoint {}", self.id, idx);
                false
            }
            Some(PointSlot::Mapped(other)) => {
                log::debug!(
                    "keypoint {} of keyframe {} already maps landmark {}",
                    idx,
                    self.id,
                    other
                );
                false
            }
            Some(_) => {
                self.point_slots[idx] = PointSlot::Mapped(pt_id);
                self.point_indices.insert(pt_id, idx);
                true
            }
        }
    }

    /// 删除一个观测，返回 true 表示关键帧已经没有已建图的点
    pub fn remove_point(&mut self, pt_id: LandmarkId) -> bool {
        match self.point_indices.remove(&pt_id) {
            Some(idx) => self.point_slots[idx] = PointSlot::Removed,
            None => log::warn!(
                "tried to remove landmark {} from keyframe {} but it is not in the keyframe",
                pt_id,
                self.id
            ),
        }
        self.point_indices.is_empty()
    }

    /// 已观测的路标及其特征点下标
    pub fn points_seen(&self) -> impl Iterator<Item = (LandmarkId, usize)> + '_ {
        self.point_indices.iter().map(|(id, idx)| (*id, *idx))
    }

    pub fn sees(&self, pt_id: LandmarkId) -> bool {
        self.point_indices.contains_key(&pt_id)
    }

    pub fn index_of(&self, pt_id: LandmarkId) -> Option<usize> {
        self.point_indices.get(&pt_id).copied()
    }

    pub fn keypoint(&self, idx: usize) -> Option<Point2<f64>> {
        self.keypoints.get(idx).copied()
    }

    pub fn keypoints(&self) -> &[Point2<f64>] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &Array2<f32> {
        &self.descriptors
    }

    pub fn descriptor(&self, idx: usize) -> ArrayView1<f32> {
        self.descriptors.row(idx)
    }

    pub fn point_slots(&self) -> &[PointSlot] {
        &self.point_slots
    }

    pub fn n_mapped(&self) -> usize {
        self.point_indices.len()
    }

    /// 特征点数量
    pub fn npts(&self) -> usize {
        self.keypoints.len()
    }

    pub fn projection_matrix(&self) -> Matrix3x4<f64> {
        self.camera.projection_matrix(&self.pose)
    }

    pub fn camera_center(&self) -> Point3<f64> {
        Point3::from(self.pose.position())
    }

    pub fn cam_to_world(&self) -> Rotation3<f64> {
        self.camera.cam_to_world(&self.pose)
    }

    /// 像素点在世界坐标系下的射线方向
    pub fn bearing(&self, p: &Point2<f64>) -> Vector3<f64> {
        self.cam_to_world() * self.camera.lift_projective(p)
    }
}
