//! BA 请求/响应
//!
//! 请求发出后保存一份上下文 [PendingBundle]，响应只和这份上下文对应，
//! 不依赖地图当前的内容（请求和响应之间地图可能已经发生变化）。

use std::collections::BTreeMap;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Map;
use crate::camera::CameraTrait;
use crate::geometry::point_is_visible;
use crate::global_types::{KeyframeId, LandmarkId, Pose3D};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BundleObservation {
    pub kf_id: KeyframeId,
    pub pt_id: LandmarkId,
    pub x: f64,
    pub y: f64,
}

/// 发送给 BA 服务的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRequest {
    pub seq: u64,
    pub is_first_pass: bool,
    pub is_global: bool,
    pub num_keyframes: usize,
    pub num_points: usize,
    pub num_observations: usize,
    /// 每个关键帧三个值：相机安装角 roll, pitch, yaw
    pub cameras: Vec<f64>,
    /// 相机内参 fx, fy, cx, cy
    pub intrinsics: [f64; 4],
    pub keyframes_id: Vec<KeyframeId>,
    pub poses: Vec<Pose3D>,
    pub ref_poses: Vec<Pose3D>,
    pub fixed_cams: Vec<bool>,
    pub points_id: Vec<LandmarkId>,
    pub points: Vec<Point3<f64>>,
    pub observations: Vec<BundleObservation>,
}

/// BA 服务的响应，位姿和点的顺序与请求一致
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleResponse {
    pub seq: u64,
    pub is_first_pass: bool,
    pub converged: bool,
    pub time_taken: f64,
    pub num_iter: u32,
    pub poses: Vec<Pose3D>,
    pub points: Vec<Point3<f64>>,
    /// 每个点的平均重投影代价
    pub cost_of_point: Vec<f64>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BundleError {
    #[error("no bundle adjustment request is pending")]
    NoPendingRequest,
    #[error("expected response {expected}, got {got}")]
    SequenceMismatch { expected: u64, got: u64 },
    #[error("response {seq} has {poses} poses, {points} points and {costs} costs, expected {expected_poses} poses and {expected_points} points")]
    ShapeMismatch {
        seq: u64,
        poses: usize,
        points: usize,
        costs: usize,
        expected_poses: usize,
        expected_points: usize,
    },
}

/// 已发出请求的上下文
#[derive(Debug, Clone)]
pub(super) struct PendingBundle {
    pub seq: u64,
    pub is_first_pass: bool,
    pub is_global: bool,
    pub keyframes_id: Vec<KeyframeId>,
    pub points_id: Vec<LandmarkId>,
}

/// 应用一次响应的统计
#[derive(Debug, Default)]
pub struct BundleReport {
    pub keyframes_updated: usize,
    pub points_updated: usize,
    pub points_removed: usize,
    pub observations_dropped: usize,
    pub points_out_of_bounds: usize,
    /// 紧接着需要发送的第二遍请求
    pub chained: Option<BundleRequest>,
}

impl<C: CameraTrait> Map<C> {
    /// 最近的 `local_window` 个关键帧
    pub fn local_window(&self) -> Vec<KeyframeId> {
        let n = self.keyframes.len();
        self.keyframes
            .keys()
            .skip(n.saturating_sub(self.params.local_window.max(1)))
            .copied()
            .collect()
    }

    /// 新关键帧数量或时间达到阈值时需要全局BA
    pub fn global_ba_due(&self) -> bool {
        let by_count = self.keyframes_since_global_ba >= self.params.global_ba_every_keyframes;
        let by_time = self
            .last_global_ba
            .map_or(false, |t| self.last_frame_stamp.duration_since(&t) > self.params.global_ba_period);
        by_count || by_time
    }

    /// getPointsForBA
    ///
    /// 返回被至少两个给定关键帧观测到的点：点ID -> (关键帧ID -> 特征点下标)
    pub fn points_for_ba(&self, kf_ids: &[KeyframeId]) -> BTreeMap<LandmarkId, BTreeMap<KeyframeId, usize>> {
        let mut points: BTreeMap<LandmarkId, BTreeMap<KeyframeId, usize>> = BTreeMap::new();
        for kf in kf_ids.iter().filter_map(|id| self.keyframes.get(id)) {
            for (pt_id, idx) in kf.points_seen() {
                points.entry(pt_id).or_default().insert(kf.id, idx);
            }
        }
        points.retain(|_, seen| seen.len() >= 2);
        points
    }

    /// doBundleAdjustment
    ///
    /// 构造请求并记录上下文。没有可以优化的点时不发送请求。
    pub fn do_bundle_adjustment(
        &mut self,
        kf_ids: &[KeyframeId],
        is_first_pass: bool,
        is_global: bool,
    ) -> Option<BundleRequest> {
        if self.params.remove_coeff > 0.0 {
            let n = self.remove_unused_points();
            log::info!("removed {} landmarks with too many outlier matches", n);
        }
        let kf_ids: Vec<KeyframeId> = kf_ids
            .iter()
            .copied()
            .filter(|id| {
                self.keyframes
                    .get(id)
                    .map_or(false, |kf| kf.n_mapped() >= self.params.min_ba_mapped_points)
            })
            .collect();
        let points_for_ba = self.points_for_ba(&kf_ids);
        log::info!("{} points for BA", points_for_ba.len());
        if points_for_ba.is_empty() {
            log::warn!("there are no matching points to do bundle adjustment");
            return None;
        }

        let mut observations = Vec::new();
        let mut points_id = Vec::with_capacity(points_for_ba.len());
        let mut points = Vec::with_capacity(points_for_ba.len());
        for (pt_id, seen) in &points_for_ba {
            for (kf_id, idx) in seen {
                let Some(uv) = self.keyframes.get(kf_id).and_then(|kf| kf.keypoint(*idx)) else {
                    continue;
                };
                observations.push(BundleObservation {
                    kf_id: *kf_id,
                    pt_id: *pt_id,
                    x: uv.x,
                    y: uv.y,
                });
            }
            points_id.push(*pt_id);
            points.push(self.landmarks[pt_id].coordinates);
        }

        let mut cameras = Vec::with_capacity(3 * kf_ids.len());
        let mut poses = Vec::with_capacity(kf_ids.len());
        let mut ref_poses = Vec::with_capacity(kf_ids.len());
        for kf in kf_ids.iter().filter_map(|id| self.keyframes.get(id)) {
            cameras.extend_from_slice(&kf.camera.mount_angles());
            poses.push(kf.pose);
            ref_poses.push(kf.ref_pose);
        }
        // 第一个关键帧固定，其余的关键帧以参考位姿作为软约束
        let fixed_cams = (0..kf_ids.len()).map(|i| i == 0).collect();
        let k = self.camera.intrinsic_matrix();

        self.bundle_seq += 1;
        let request = BundleRequest {
            seq: self.bundle_seq,
            is_first_pass,
            is_global,
            num_keyframes: kf_ids.len(),
            num_points: points_id.len(),
            num_observations: observations.len(),
            cameras,
            intrinsics: [k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]],
            keyframes_id: kf_ids.clone(),
            poses,
            ref_poses,
            fixed_cams,
            points_id: points_id.clone(),
            points,
            observations,
        };
        self.pending = Some(PendingBundle {
            seq: request.seq,
            is_first_pass,
            is_global,
            keyframes_id: kf_ids,
            points_id,
        });
        self.is_adjusting_bundle = true;
        log::info!(
            "bundle adjustment request {} ({} pass{}): {} keyframes, {} points, {} observations",
            request.seq,
            if is_first_pass { "first" } else { "second" },
            if is_global { ", global" } else { "" },
            request.num_keyframes,
            request.num_points,
            request.num_observations
        );
        Some(request)
    }

    /// 当前等待响应的请求序号
    pub fn pending_seq(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.seq)
    }

    /// updateBundle
    ///
    /// 更新关键帧位姿和点坐标。代价超过阈值或在某个观测关键帧中不可见的点：
    /// 只有两个观测时删除，否则删除最早的观测。需要时返回紧接着的第二遍请求，
    /// 否则清除 BA 进行中的标志。
    pub fn update_bundle(&mut self, response: &BundleResponse) -> Result<BundleReport, BundleError> {
        let pending = self.pending.as_ref().ok_or(BundleError::NoPendingRequest)?;
        if pending.seq != response.seq {
            return Err(BundleError::SequenceMismatch {
                expected: pending.seq,
                got: response.seq,
            });
        }
        let Some(pending) = self.pending.take() else {
            return Err(BundleError::NoPendingRequest);
        };
        if response.poses.len() != pending.keyframes_id.len()
            || response.points.len() != pending.points_id.len()
            || response.cost_of_point.len() != pending.points_id.len()
        {
            // 无法对应的响应直接丢弃，否则地图会一直等待
            self.is_adjusting_bundle = false;
            return Err(BundleError::ShapeMismatch {
                seq: response.seq,
                poses: response.poses.len(),
                points: response.points.len(),
                costs: response.cost_of_point.len(),
                expected_poses: pending.keyframes_id.len(),
                expected_points: pending.points_id.len(),
            });
        }
        log::info!(
            "bundle adjustment response {}: converged = {}, {} iterations in {:.3} s",
            response.seq,
            response.converged,
            response.num_iter,
            response.time_taken
        );

        let mut report = BundleReport::default();
        for (kf_id, pose) in pending.keyframes_id.iter().zip(&response.poses) {
            match self.keyframes.get_mut(kf_id) {
                Some(kf) => {
                    kf.pose = *pose;
                    report.keyframes_updated += 1;
                }
                None => log::info!("keyframe {} was removed before its pose could be updated", kf_id),
            }
        }

        let margin = self.params.ba_visibility_margin;
        for (i, pt_id) in pending.points_id.iter().enumerate() {
            let Some(landmark) = self.landmarks.get(pt_id) else {
                log::info!("landmark {} was removed before it could be updated", pt_id);
                continue;
            };
            let coordinates = response.points[i];
            let n_observers = landmark.n_observers();
            let least_recent = landmark.least_recent_observer();
            let too_costly = self
                .params
                .outlier_cost
                .threshold(n_observers)
                .map_or(false, |t| response.cost_of_point[i] > t);
            let hidden = landmark.keyframes_seeing.iter().any(|kf_id| {
                self.keyframes
                    .get(kf_id)
                    .map_or(false, |kf| !point_is_visible(kf, &coordinates, margin))
            });
            if !(too_costly || hidden) {
                self.update_point(*pt_id, coordinates);
                report.points_updated += 1;
            } else if n_observers <= 2 {
                log::debug!("removing landmark {} (cost {})", pt_id, response.cost_of_point[i]);
                self.remove_point(*pt_id);
                report.points_removed += 1;
            } else if let Some(kf_id) = least_recent {
                log::debug!("dropping observation of landmark {} by keyframe {}", pt_id, kf_id);
                self.remove_observation(*pt_id, kf_id);
                report.observations_dropped += 1;
            }
        }
        report.points_out_of_bounds = self.clean_map();
        log::info!(
            "removed {} + {} points, dropped {} observations",
            report.points_removed,
            report.points_out_of_bounds,
            report.observations_dropped
        );

        if response.is_first_pass {
            self.timing.record_pass1(response.time_taken, response.num_iter);
        } else {
            self.timing.record_pass2(response.time_taken, response.num_iter);
        }
        if pending.is_global {
            self.keyframes_since_global_ba = 0;
            self.last_global_ba = Some(self.last_frame_stamp);
        }

        if pending.is_first_pass && !pending.is_global {
            if self.global_ba_due() {
                let all: Vec<KeyframeId> = self.keyframes.keys().copied().collect();
                report.chained = self.do_bundle_adjustment(&all, false, true);
            } else if self.params.double_ba {
                report.chained = self.do_bundle_adjustment(&pending.keyframes_id, false, false);
            }
        } else if pending.is_first_pass && self.params.double_ba {
            report.chained = self.do_bundle_adjustment(&pending.keyframes_id, false, true);
        }
        if report.chained.is_none() {
            self.is_adjusting_bundle = false;
            self.last_new_keyframe = Some(self.last_frame_stamp);
        }
        Ok(report)
    }
}
