//! 地图
//!
//! [Map] 拥有所有关键帧和路标，两者之间只通过ID互相引用。删除操作通过工作队列级联：
//! 删除路标可能让某个关键帧失去所有已建图的点，删除关键帧又可能让某些路标失去所有观测。

mod benchmark;
mod bundle;
mod keyframe;
mod keyframe_policy;
mod landmark;
mod pnp;
mod point_cloud;

pub use benchmark::{BenchmarkInfo, BundleTiming};
pub use bundle::{BundleError, BundleObservation, BundleReport, BundleRequest, BundleResponse};
pub use keyframe::Keyframe;
pub use keyframe_policy::{
    fov_uncovered_fraction, AdmitReason, KeyframeCues, KeyframeDecision, KeyframePolicy,
    KeyframeThresholds, RejectReason,
};
pub use landmark::Landmark;
pub use pnp::{PnpError, PnpEstimate};
pub use point_cloud::PointCloud;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use nalgebra::Vector3;
use ndarray::{Array1, ArrayView1};

use crate::camera::CameraTrait;
use crate::config::{MapParameters, INLIER_AVERAGE_ALPHA};
use crate::geometry::{match_descriptors, point_is_visible};
use crate::global_types::{Frame, KeyframeId, LandmarkId, PointSlot, Pose3D, Timestamp, WorldPoint};

use bundle::PendingBundle;

/// 级联删除的工作项
#[derive(Debug, Clone, Copy)]
enum Removal {
    Point(LandmarkId),
    Keyframe(KeyframeId),
}

/// 一帧处理的结果
#[derive(Debug)]
pub struct FrameReport {
    pub pnp: Result<PnpEstimate, PnpError>,
    pub decision: KeyframeDecision,
    pub new_keyframe: Option<KeyframeId>,
    /// 需要发送给 BA 服务的请求
    pub bundle: Option<BundleRequest>,
}

pub struct Map<C: CameraTrait> {
    params: MapParameters,
    policy: KeyframePolicy,
    camera: Arc<C>,

    landmarks: BTreeMap<LandmarkId, Landmark>,
    keyframes: BTreeMap<KeyframeId, Keyframe<C>>,
    cloud: PointCloud,

    // ID 生成器，reset 之后也不会复用
    next_landmark_id: u32,
    next_keyframe_id: u32,

    /// BA 进行中，禁止添加新的关键帧
    is_adjusting_bundle: bool,
    pending: Option<PendingBundle>,
    bundle_seq: u64,
    timing: BundleTiming,

    inlier_average: f64,
    keyframes_since_global_ba: usize,
    last_global_ba: Option<Timestamp>,
    last_new_keyframe: Option<Timestamp>,
    last_frame_stamp: Timestamp,

    /// 上一次 PnP 的 (rvec, tvec)，作为下一次求解的初值
    pnp_guess: Option<(Vector3<f64>, Vector3<f64>)>,
}

impl<C: CameraTrait> Map<C> {
    pub fn new(params: MapParameters, camera: Arc<C>) -> Self {
        let policy = KeyframePolicy {
            thresholds: params.keyframe,
            only_init: params.only_init,
            manual_keyframes: params.manual_keyframes,
        };
        log::info!(
            "init map: triangulation = {:?}, pose noise = {:?}, bundle adjustment = {}",
            params.triangulation,
            params.pose_noise,
            !params.no_bundle_adjustment
        );
        Self {
            params,
            policy,
            camera,
            landmarks: BTreeMap::new(),
            keyframes: BTreeMap::new(),
            cloud: PointCloud::default(),
            next_landmark_id: 0,
            next_keyframe_id: 0,
            is_adjusting_bundle: false,
            pending: None,
            bundle_seq: 0,
            timing: BundleTiming::default(),
            inlier_average: 0.0,
            keyframes_since_global_ba: 0,
            last_global_ba: None,
            last_new_keyframe: None,
            last_frame_stamp: Timestamp::default(),
            pnp_guess: None,
        }
    }

    /// 清空地图，ID 计数器保持不变
    pub fn reset(&mut self) {
        log::info!(
            "reset map with {} keyframes and {} landmarks",
            self.keyframes.len(),
            self.landmarks.len()
        );
        self.landmarks.clear();
        self.keyframes.clear();
        self.cloud.clear();
        self.is_adjusting_bundle = false;
        self.pending = None;
        self.timing = BundleTiming::default();
        self.inlier_average = 0.0;
        self.keyframes_since_global_ba = 0;
        self.last_global_ba = None;
        self.last_new_keyframe = None;
        self.pnp_guess = None;
    }

    /// 超过三个关键帧之后认为已经初始化
    pub fn is_initialized(&self) -> bool {
        self.keyframes.len() > keyframe_policy::INITIALIZED_KEYFRAMES
    }

    /// addPoint
    pub fn add_point(&mut self, coordinates: WorldPoint, descriptor: ArrayView1<f32>) -> Result<LandmarkId> {
        let id = LandmarkId(self.next_landmark_id);
        self.cloud.push(id, coordinates, descriptor)?;
        self.next_landmark_id += 1;
        self.landmarks
            .insert(id, Landmark::new(id, coordinates, descriptor.to_owned()));
        Ok(id)
    }

    /// updatePoint
    pub fn update_point(&mut self, id: LandmarkId, coordinates: WorldPoint) {
        let Some(landmark) = self.landmarks.get_mut(&id) else {
            log::info!("trying to update landmark {}, but it doesn't exist", id);
            return;
        };
        landmark.coordinates = coordinates;
        if !self.cloud.update(id, coordinates) {
            log::warn!("landmark {} is missing from the point cloud", id);
        }
    }

    /// removePoint
    pub fn remove_point(&mut self, id: LandmarkId) {
        if !self.landmarks.contains_key(&id) {
            log::info!("trying to remove landmark {}, but it doesn't exist", id);
            return;
        }
        self.cascade(Removal::Point(id));
    }

    /// removeKeyframe
    pub fn remove_keyframe(&mut self, id: KeyframeId) {
        if !self.keyframes.contains_key(&id) {
            log::info!("trying to remove keyframe {}, but it doesn't exist", id);
            return;
        }
        self.cascade(Removal::Keyframe(id));
    }

    /// 只删除一个观测，点或关键帧因此失效时继续级联
    pub fn remove_observation(&mut self, pt_id: LandmarkId, kf_id: KeyframeId) {
        let (Some(landmark), Some(keyframe)) =
            (self.landmarks.get_mut(&pt_id), self.keyframes.get_mut(&kf_id))
        else {
            log::info!(
                "trying to remove observation of landmark {} by keyframe {}, but one of them doesn't exist",
                pt_id,
                kf_id
            );
            return;
        };
        if !keyframe.sees(pt_id) {
            log::debug!("keyframe {} doesn't see landmark {}", kf_id, pt_id);
            return;
        }
        let point_dead = landmark.set_as_unseen_by(kf_id);
        let keyframe_dead = keyframe.remove_point(pt_id);
        if point_dead {
            self.cascade(Removal::Point(pt_id));
        }
        if keyframe_dead && self.keyframes.len() > 1 && self.keyframes.contains_key(&kf_id) {
            self.cascade(Removal::Keyframe(kf_id));
        }
    }

    /// 级联删除
    ///
    /// 每一步都从图中删除一个节点，所以总步数不超过节点数量。
    /// `doomed` 中的关键帧已经排队等待删除，保证最后至少留下一个关键帧。
    fn cascade(&mut self, start: Removal) {
        let bound = self.landmarks.len() + self.keyframes.len() + 1;
        let mut work = VecDeque::from([start]);
        let mut doomed = BTreeSet::new();
        let mut steps = 0usize;
        while let Some(item) = work.pop_front() {
            steps += 1;
            debug_assert!(steps <= 2 * bound, "cascade deletion does not terminate");
            match item {
                Removal::Point(id) => {
                    let Some(landmark) = self.landmarks.remove(&id) else {
                        continue;
                    };
                    if !self.cloud.remove(id) {
                        log::warn!("landmark {} is missing from the point cloud", id);
                    }
                    for kf_id in landmark.keyframes_seeing {
                        log::debug!("removing landmark {} from keyframe {}", id, kf_id);
                        let Some(keyframe) = self.keyframes.get_mut(&kf_id) else {
                            continue;
                        };
                        let dead = keyframe.remove_point(id);
                        if dead
                            && !doomed.contains(&kf_id)
                            && self.keyframes.len() - doomed.len() > 1
                        {
                            doomed.insert(kf_id);
                            work.push_back(Removal::Keyframe(kf_id));
                        }
                    }
                }
                Removal::Keyframe(id) => {
                    doomed.remove(&id);
                    let Some(keyframe) = self.keyframes.remove(&id) else {
                        continue;
                    };
                    log::info!("removing keyframe {}", id);
                    for (pt_id, _) in keyframe.points_seen() {
                        let Some(landmark) = self.landmarks.get_mut(&pt_id) else {
                            continue;
                        };
                        if landmark.set_as_unseen_by(id) {
                            work.push_back(Removal::Point(pt_id));
                        }
                    }
                }
            }
        }
    }

    /// setPointAsSeen
    pub fn set_point_as_seen(&mut self, pt_id: LandmarkId, kf_id: KeyframeId, idx: usize) -> bool {
        let (Some(landmark), Some(keyframe)) =
            (self.landmarks.get_mut(&pt_id), self.keyframes.get_mut(&kf_id))
        else {
            log::info!(
                "trying to set landmark {} as seen by keyframe {}, but one of them doesn't exist",
                pt_id,
                kf_id
            );
            return false;
        };
        log::debug!("setting landmark {} as seen by keyframe {}", pt_id, kf_id);
        if !keyframe.set_as_seeing(pt_id, idx) {
            return false;
        }
        landmark.set_as_seen_by(kf_id);
        true
    }

    /// matchKeyframes
    ///
    /// 第一遍只匹配两边都未建图的特征点，三角化出新的路标；
    /// 第二遍不过滤，把一边未建图、另一边已经对应路标的特征点关联到该路标。
    pub fn match_keyframes(&mut self, kf_a: KeyframeId, kf_b: KeyframeId) -> Result<usize> {
        let (Some(a), Some(b)) = (self.keyframes.get(&kf_a), self.keyframes.get(&kf_b)) else {
            log::info!("trying to match keyframes {} and {}, but one of them doesn't exist", kf_a, kf_b);
            return Ok(0);
        };
        if a.npts() == 0 || b.npts() == 0 {
            return Ok(0);
        }
        let threshold = self.params.threshold_kf_match;
        let max_matches = Some(self.params.max_matches);
        let margin = self.params.triangulation_margin;

        let matches = match_descriptors(
            a.descriptors().view(),
            b.descriptors().view(),
            Some((a.point_slots(), b.point_slots())),
            threshold,
            max_matches,
        );
        let mut new_points: Vec<(usize, usize, WorldPoint, Array1<f32>)> = Vec::new();
        for (i, j) in matches.iter() {
            let point = match self.params.triangulation.triangulate(a, i, b, j) {
                Ok(point) => point,
                Err(e) => {
                    log::debug!("triangulation of {} / {} failed: {}", i, j, e);
                    continue;
                }
            };
            if !point_is_visible(a, &point, margin) || !point_is_visible(b, &point, margin) {
                log::debug!("triangulated point {} is not visible, skipped", point);
                continue;
            }
            new_points.push((i, j, point, a.descriptor(i).to_owned()));
        }
        let n_new = new_points.len();
        for (i, j, point, descriptor) in new_points {
            let pt_id = self.add_point(point, descriptor.view())?;
            self.set_point_as_seen(pt_id, kf_a, i);
            self.set_point_as_seen(pt_id, kf_b, j);
        }

        // 重新观测
        let (Some(a), Some(b)) = (self.keyframes.get(&kf_a), self.keyframes.get(&kf_b)) else {
            return Ok(n_new);
        };
        let matches = match_descriptors(
            a.descriptors().view(),
            b.descriptors().view(),
            None,
            threshold,
            max_matches,
        );
        let mut links = Vec::new();
        for (i, j) in matches.iter() {
            match (a.point_slots()[i], b.point_slots()[j]) {
                (PointSlot::Unmapped, PointSlot::Mapped(pt_id)) => links.push((pt_id, kf_a, i)),
                (PointSlot::Mapped(pt_id), PointSlot::Unmapped) => links.push((pt_id, kf_b, j)),
                _ => {}
            }
        }
        let n_links = links
            .into_iter()
            .filter(|&(pt_id, kf_id, idx)| self.set_point_as_seen(pt_id, kf_id, idx))
            .count();
        log::info!(
            "finished matching keyframe {} with keyframe {}: {} matches, {} new landmarks, {} re-observations",
            kf_a,
            kf_b,
            matches.len(),
            n_new,
            n_links
        );
        Ok(n_new)
    }

    /// newKeyframe
    ///
    /// 新的关键帧与所有已有关键帧匹配。匹配后没有任何已建图点的关键帧会被删除（保留最旧的一个）。
    pub fn new_keyframe(&mut self, frame: &Frame) -> Result<Option<KeyframeId>> {
        log::info!("new keyframe start pose = {}", frame.pose);
        if frame.keypoints.len() <= self.params.min_keyframe_keypoints {
            log::info!(
                "I want to create a new keyframe, but current frame only has {} points",
                frame.keypoints.len()
            );
            return Ok(None);
        }
        let id = KeyframeId(self.next_keyframe_id);
        self.next_keyframe_id += 1;
        if self.keyframes.is_empty() {
            self.last_global_ba = Some(frame.timestamp);
        }
        self.keyframes
            .insert(id, Keyframe::new(id, frame, self.camera.clone()));
        self.last_new_keyframe = Some(frame.timestamp);
        self.keyframes_since_global_ba += 1;
        if self.keyframes.len() < 2 {
            return Ok(Some(id));
        }

        let others: Vec<KeyframeId> = self.keyframes.keys().copied().filter(|k| *k != id).collect();
        for other in others {
            log::info!("matching keyframes {} and {}", id, other);
            self.match_keyframes(id, other)?;
        }
        self.remove_dead_keyframes();
        log::info!("map now has {} points", self.cloud.len());
        Ok(self.keyframes.contains_key(&id).then_some(id))
    }

    /// 删除没有已建图点的关键帧，从最新的开始，至少保留一个
    fn remove_dead_keyframes(&mut self) {
        let dead: Vec<KeyframeId> = self
            .keyframes
            .iter()
            .rev()
            .filter(|(_, kf)| kf.n_mapped() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if self.keyframes.len() < 2 {
                break;
            }
            log::info!("keyframe {} has no mapped points", id);
            self.remove_keyframe(id);
        }
    }

    /// processFrame
    ///
    /// `manual_pose` 是外部给出的真值位姿，初始化阶段和手动关键帧模式下用于添加关键帧。
    pub fn process_frame(&mut self, frame: &Frame, manual_pose: Option<&Pose3D>) -> Result<FrameReport> {
        self.last_frame_stamp = frame.timestamp;
        let pnp = self.do_pnp(frame);
        let n_inliers = pnp.as_ref().map_or(0, |e| e.n_inliers);
        self.inlier_average =
            INLIER_AVERAGE_ALPHA * n_inliers as f64 + (1.0 - INLIER_AVERAGE_ALPHA) * self.inlier_average;

        match &pnp {
            Ok(estimate) => log::info!("({:3} inliers) PnP pose is: {}", estimate.n_inliers, estimate.pose),
            Err(e) => log::info!("PnP failed: {}", e),
        }

        let current = match &pnp {
            Ok(estimate) => estimate.pose,
            Err(_) => frame.pose,
        };
        let (distance, angle) = self
            .keyframes
            .values()
            .next_back()
            .map_or((f64::INFINITY, f64::INFINITY), |kf| {
                (current.distance_to(&kf.pose), current.angle_to(&kf.pose))
            });
        let cues = KeyframeCues {
            n_keyframes: self.keyframes.len(),
            n_inliers,
            fov_uncovered: pnp.as_ref().map_or(1.0, |e| e.fov_uncovered),
            elapsed: self
                .last_new_keyframe
                .map_or(f64::INFINITY, |t| frame.timestamp.duration_since(&t)),
            distance,
            angle,
            manual_pose: manual_pose.is_some(),
            ba_in_flight: self.is_adjusting_bundle,
        };
        let decision = self.policy.decide(&cues);
        log::debug!("keyframe decision {:?} for {:?}", decision, cues);

        let mut report = FrameReport {
            pnp,
            decision,
            new_keyframe: None,
            bundle: None,
        };
        if !decision.is_admit() {
            return Ok(report);
        }

        // 手动位姿是真值，不再用 PnP 结果替换
        let mut kf_frame = frame.clone();
        if let Some(pose) = manual_pose {
            kf_frame.pose = *pose;
        }
        let n_keyframes = self.keyframes.len();
        if self.params.pose_noise.is_active() && n_keyframes != 0 {
            self.params.pose_noise.apply(&mut kf_frame.pose, n_keyframes);
        } else if let (Ok(estimate), false, None) = (&report.pnp, self.params.benchmark, manual_pose) {
            log::info!("new keyframe with pnp");
            kf_frame.pose.x = estimate.pose.x;
            kf_frame.pose.y = estimate.pose.y;
            kf_frame.pose.rot_z = estimate.pose.rot_z;
        }

        report.new_keyframe = self.new_keyframe(&kf_frame)?;
        if report.new_keyframe.is_some() && !self.params.no_bundle_adjustment && self.keyframes.len() > 1 {
            if self.is_adjusting_bundle {
                log::info!("bundle adjustment in flight, keyframe {:?} waits", report.new_keyframe);
            } else {
                let window = self.local_window();
                let is_global = window.len() == self.keyframes.len();
                report.bundle = self.do_bundle_adjustment(&window, true, is_global);
            }
        }
        Ok(report)
    }

    /// removeUnusedPoints: 按 PnP 内外点计数删除路标
    pub fn remove_unused_points(&mut self) -> usize {
        let (cst, coeff) = (self.params.remove_cst, self.params.remove_coeff);
        let outliers: Vec<LandmarkId> = self
            .landmarks
            .values()
            .filter(|lm| lm.is_outlier(cst, coeff))
            .map(|lm| lm.id)
            .collect();
        for id in &outliers {
            self.remove_point(*id);
        }
        outliers.len()
    }

    /// cleanMap: 删除超出地图边界的路标
    pub fn clean_map(&mut self) -> usize {
        let bound = self.params.map_bounds;
        let outside: Vec<LandmarkId> = self
            .landmarks
            .values()
            .filter(|lm| lm.is_out_of_bounds(bound))
            .map(|lm| lm.id)
            .collect();
        for id in &outside {
            self.remove_point(*id);
        }
        outside.len()
    }

    pub fn params(&self) -> &MapParameters {
        &self.params
    }

    pub fn camera(&self) -> &Arc<C> {
        &self.camera
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn keyframe(&self, id: KeyframeId) -> Option<&Keyframe<C>> {
        self.keyframes.get(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &Keyframe<C>> {
        self.keyframes.values()
    }

    /// 与扁平表行顺序一致的路标ID
    pub fn landmark_ids(&self) -> &[LandmarkId] {
        self.cloud.ids()
    }

    pub fn cloud(&self) -> &PointCloud {
        &self.cloud
    }

    pub fn n_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn n_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_adjusting_bundle(&self) -> bool {
        self.is_adjusting_bundle
    }

    pub fn inlier_average(&self) -> f64 {
        self.inlier_average
    }

    /// 检查所有不变量，测试中使用
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for lm in self.landmarks.values() {
            assert!(lm.n_observers() > 0, "landmark {} has no observers", lm.id);
            for kf_id in &lm.keyframes_seeing {
                let kf = &self.keyframes[kf_id];
                assert!(kf.sees(lm.id));
            }
        }
        for kf in self.keyframes.values() {
            if self.keyframes.len() > 1 {
                assert!(kf.n_mapped() > 0, "keyframe {} has no mapped points", kf.id);
            }
            for (pt_id, idx) in kf.points_seen() {
                assert_eq!(kf.point_slots()[idx], PointSlot::Mapped(pt_id));
                assert!(self.landmarks[&pt_id].keyframes_seeing.contains(&kf.id));
            }
            let n_slots = kf.point_slots().iter().filter(|s| s.landmark().is_some()).count();
            assert_eq!(n_slots, kf.n_mapped());
        }
        assert_eq!(self.cloud.len(), self.landmarks.len());
        for (idx, (id, lm)) in self.landmarks.iter().enumerate() {
            assert_eq!(self.cloud.ids()[idx], *id);
            assert!(self.cloud.matches_row(idx, &lm.coordinates, &lm.descriptor));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use crate::geometry::scene;

    pub fn new_map(params: MapParameters) -> Map<PinholeCamera> {
        Map::new(params, scene::camera())
    }

    /// 两个关键帧看到同样的 `n` 个点
    pub fn two_view_map(n: usize) -> Map<PinholeCamera> {
        let params = MapParameters {
            no_bundle_adjustment: true,
            ..Default::default()
        };
        two_view_map_with(n, params)
    }

    pub fn two_view_map_with(n: usize, params: MapParameters) -> Map<PinholeCamera> {
        let mut map = new_map(params);
        let (pose1, pose2) = scene::two_poses();
        let points = scene::grid_points(n);
        map.new_keyframe(&scene::frame(&pose1, &points, Timestamp::from_sec(0.0)))
            .unwrap();
        map.new_keyframe(&scene::frame(&pose2, &points, Timestamp::from_sec(1.0)))
            .unwrap();
        map
    }

    #[test]
    fn test_add_point_roundtrip() {
        let mut map = new_map(MapParameters::default());
        let d = Array1::from(scene::descriptor(3));
        let p = WorldPoint::new(1.5, -2.0, 0.25);
        let id = map.add_point(p, d.view()).unwrap();
        let lm = map.landmark(id).unwrap();
        assert_eq!(lm.coordinates, p);
        assert_eq!(lm.descriptor, d);
        assert_eq!(map.landmark_ids(), &[id]);
        let (row_id, row_p, row_d) = map.cloud().get(0).unwrap();
        assert_eq!((row_id, *row_p), (id, p));
        assert_eq!(row_d, d.view());

        map.update_point(id, WorldPoint::new(0.0, 0.0, 1.0));
        assert_eq!(map.cloud().points()[0], WorldPoint::new(0.0, 0.0, 1.0));
        map.update_point(LandmarkId(99), WorldPoint::origin());

        // 描述子宽度不一致
        assert!(map.add_point(p, Array1::<f32>::zeros(3).view()).is_err());
        assert_eq!(map.n_landmarks(), 1);
        let id2 = map.add_point(p, d.view()).unwrap();
        assert!(id2 > id);
    }

    #[test]
    fn test_two_view_triangulation() {
        let mut map = two_view_map(50);
        map.check_invariants();
        assert_eq!(map.n_keyframes(), 2);
        assert_eq!(map.n_landmarks(), 50);
        assert_eq!(map.cloud().len(), 50);
        let points = scene::grid_points(50);
        for lm in map.landmarks() {
            assert_eq!(
                lm.keyframes_seeing.iter().copied().collect::<Vec<_>>(),
                vec![KeyframeId(0), KeyframeId(1)]
            );
            let truth = points
                .iter()
                .map(|p| (p - lm.coordinates).norm())
                .fold(f64::INFINITY, f64::min);
            assert!(truth < 1e-6);
        }
        for kf in map.keyframes() {
            assert_eq!(kf.n_mapped(), 50);
        }

        // 再匹配一次不会产生新的路标
        assert_eq!(map.match_keyframes(KeyframeId(1), KeyframeId(0)).unwrap(), 0);
        assert_eq!(map.n_landmarks(), 50);
        map.check_invariants();
    }

    #[test]
    fn test_reobservation_links_third_keyframe() {
        let mut map = two_view_map(20);
        let pose3 = Pose3D::new(0.3, 0.4, 1.0, 0.0, 0.0, -0.05);
        let frame = scene::frame(&pose3, &scene::grid_points(20), Timestamp::from_sec(2.0));
        let id = map.new_keyframe(&frame).unwrap().unwrap();
        assert_eq!(map.n_landmarks(), 20);
        assert_eq!(map.keyframe(id).unwrap().n_mapped(), 20);
        for lm in map.landmarks() {
            assert_eq!(lm.n_observers(), 3);
        }
        map.check_invariants();
    }

    #[test]
    fn test_remove_point_is_idempotent() {
        let mut map = two_view_map(12);
        let id = map.landmark_ids()[5];
        map.remove_point(id);
        assert!(map.landmark(id).is_none());
        assert_eq!(map.n_landmarks(), 11);
        map.remove_point(id);
        assert_eq!(map.n_landmarks(), 11);
        assert_eq!(map.n_keyframes(), 2);
        for kf in map.keyframes() {
            assert_eq!(kf.n_mapped(), 11);
            assert!(kf.point_slots().contains(&PointSlot::Removed));
        }
        map.check_invariants();
    }

    #[test]
    fn test_cascade_keeps_last_keyframe() {
        let mut map = two_view_map(12);
        let ids = map.landmark_ids().to_vec();
        for id in ids {
            map.remove_point(id);
            map.check_invariants();
        }
        assert_eq!(map.n_landmarks(), 0);
        assert_eq!(map.n_keyframes(), 1);
        // 级联删除最先失效的关键帧
        assert!(map.keyframe(KeyframeId(1)).is_some());
    }

    #[test]
    fn test_remove_keyframe_cascades_to_points() {
        let mut map = two_view_map(12);
        let pose3 = Pose3D::new(0.3, 0.4, 1.0, 0.0, 0.0, -0.05);
        let points = scene::grid_points(12);
        map.new_keyframe(&scene::frame(&pose3, &points, Timestamp::from_sec(2.0)))
            .unwrap();
        map.remove_keyframe(KeyframeId(0));
        assert_eq!(map.n_landmarks(), 12);
        map.remove_keyframe(KeyframeId(1));
        // 只剩一个观测的点仍然保留
        assert_eq!(map.n_landmarks(), 12);
        map.remove_keyframe(KeyframeId(2));
        assert_eq!(map.n_landmarks(), 0);
        assert_eq!(map.n_keyframes(), 0);
        map.remove_keyframe(KeyframeId(2));
        map.check_invariants();
    }

    #[test]
    fn test_remove_observation() {
        let mut map = two_view_map(12);
        let id = map.landmark_ids()[0];
        map.remove_observation(id, KeyframeId(0));
        assert_eq!(map.landmark(id).unwrap().n_observers(), 1);
        assert_eq!(map.keyframe(KeyframeId(0)).unwrap().n_mapped(), 11);
        // 重复删除没有影响
        map.remove_observation(id, KeyframeId(0));
        assert_eq!(map.landmark(id).unwrap().n_observers(), 1);
        // 最后一个观测被删除时路标也被删除
        map.remove_observation(id, KeyframeId(1));
        assert!(map.landmark(id).is_none());
        assert_eq!(map.keyframe(KeyframeId(1)).unwrap().n_mapped(), 11);
        map.check_invariants();
    }

    #[test]
    fn test_small_frame_is_not_a_keyframe() {
        let mut map = new_map(MapParameters::default());
        let (pose, _) = scene::two_poses();
        let frame = scene::frame(&pose, &scene::grid_points(10), Timestamp::default());
        assert_eq!(map.new_keyframe(&frame).unwrap(), None);
        let frame = scene::frame(&pose, &scene::grid_points(11), Timestamp::default());
        assert_eq!(map.new_keyframe(&frame).unwrap(), Some(KeyframeId(0)));
    }

    #[test]
    fn test_unmatched_keyframe_is_dropped() {
        let mut map = new_map(MapParameters::default());
        let (pose1, pose2) = scene::two_poses();
        let points = scene::grid_points(20);
        map.new_keyframe(&scene::frame(&pose1, &points, Timestamp::default()))
            .unwrap();
        // 描述子都不一样
        let mut frame = scene::frame(&pose2, &points, Timestamp::from_sec(1.0));
        frame.descriptors.mapv_inplace(|v| v + 5.0);
        assert_eq!(map.new_keyframe(&frame).unwrap(), None);
        assert_eq!(map.n_keyframes(), 1);
        assert!(map.keyframe(KeyframeId(0)).is_some());
        // 后面的关键帧仍然使用新的ID
        let frame = scene::frame(&pose2, &points, Timestamp::from_sec(2.0));
        assert_eq!(map.new_keyframe(&frame).unwrap(), Some(KeyframeId(2)));
        map.check_invariants();
    }

    #[test]
    fn test_process_frame_bootstrap() {
        let mut map = new_map(MapParameters::default());
        let (pose1, pose2) = scene::two_poses();
        let points = scene::grid_points(30);

        let report = map
            .process_frame(&scene::frame(&pose1, &points, Timestamp::from_sec(0.0)), None)
            .unwrap();
        assert_eq!(report.pnp.unwrap_err(), PnpError::EmptyMap);
        assert_eq!(report.decision, KeyframeDecision::Admit(AdmitReason::Bootstrap));
        assert_eq!(report.new_keyframe, Some(KeyframeId(0)));
        assert!(report.bundle.is_none());

        // 未初始化时没有手动位姿不添加关键帧
        let frame2 = scene::frame(&pose2, &points, Timestamp::from_sec(1.0));
        let report = map.process_frame(&frame2, None).unwrap();
        assert_eq!(report.decision, KeyframeDecision::Reject(RejectReason::Uninitialized));
        assert_eq!(map.n_keyframes(), 1);

        let report = map.process_frame(&frame2, Some(&pose2)).unwrap();
        assert_eq!(report.new_keyframe, Some(KeyframeId(1)));
        assert_eq!(map.n_landmarks(), 30);
        let request = report.bundle.unwrap();
        assert_eq!(request.num_points, 30);
        assert!(map.is_adjusting_bundle());
        map.check_invariants();
    }

    /// 四个已有关键帧的地图，路标直接加入，当前帧可以通过 PnP 定位
    fn initialized_map(params: MapParameters) -> Map<PinholeCamera> {
        let mut map = new_map(MapParameters {
            no_bundle_adjustment: true,
            keyframe: KeyframeThresholds {
                min_fov_uncovered: 0.0,
                ..Default::default()
            },
            ..params
        });
        let points = scene::scattered_points(40);
        for (i, p) in points.iter().enumerate() {
            map.add_point(*p, Array1::from(scene::descriptor(i)).view())
                .unwrap();
        }
        for i in 0..4u32 {
            let pose = Pose3D::new(-1.5, -0.3 + 0.2 * i as f64, 1.05, 0.0, 0.0, 0.0);
            let frame = scene::frame(&pose, &points, Timestamp::from_sec(i as f64));
            map.keyframes
                .insert(KeyframeId(i), Keyframe::new(KeyframeId(i), &frame, map.camera.clone()));
        }
        map.next_keyframe_id = 4;
        assert!(map.is_initialized());
        map
    }

    #[test]
    fn test_process_frame_adopts_pnp_pose() {
        let truth = Pose3D::new(0.2, -0.1, 1.05, 0.0, 0.03, 0.1);
        let mut frame = scene::frame(&truth, &scene::scattered_points(40), Timestamp::from_sec(10.0));
        // 先验位姿的 x, y, yaw 有误差
        frame.pose = Pose3D::new(0.25, -0.05, 1.05, 0.0, 0.03, 0.12);

        let mut map = initialized_map(MapParameters::default());
        let report = map.process_frame(&frame, None).unwrap();
        assert!(report.pnp.is_ok());
        assert!(report.decision.is_admit());
        let kf = map.keyframe(report.new_keyframe.unwrap()).unwrap();
        assert!((kf.pose.x - truth.x).abs() < 1e-3);
        assert!((kf.pose.y - truth.y).abs() < 1e-3);
        assert!((kf.pose.rot_z - truth.rot_z).abs() < 1e-3);
        assert_eq!(kf.pose.z, frame.pose.z);
        assert_eq!(kf.pose.rot_x, frame.pose.rot_x);

        // benchmark 模式保留先验位姿
        let mut map = initialized_map(MapParameters {
            benchmark: true,
            ..Default::default()
        });
        let report = map.process_frame(&frame, None).unwrap();
        assert!(report.pnp.is_ok());
        let kf = map.keyframe(report.new_keyframe.unwrap()).unwrap();
        assert_eq!(kf.pose, frame.pose);
    }

    #[test]
    fn test_manual_pose_is_not_replaced_by_pnp() {
        let truth = Pose3D::new(0.2, -0.1, 1.05, 0.0, 0.03, 0.1);
        let frame = scene::frame(&truth, &scene::scattered_points(40), Timestamp::from_sec(10.0));
        let manual = Pose3D::new(0.17, -0.14, 1.05, 0.0, 0.03, 0.08);

        let mut map = initialized_map(MapParameters::default());
        let report = map.process_frame(&frame, Some(&manual)).unwrap();
        assert!(report.pnp.is_ok());
        let kf = map.keyframe(report.new_keyframe.unwrap()).unwrap();
        assert_eq!(kf.pose, manual);
    }

    #[test]
    fn test_reset_keeps_counters() {
        let mut map = two_view_map(12);
        map.reset();
        assert_eq!(map.n_keyframes(), 0);
        assert_eq!(map.n_landmarks(), 0);
        assert!(map.cloud().is_empty());
        let (pose1, _) = scene::two_poses();
        let frame = scene::frame(&pose1, &scene::grid_points(12), Timestamp::default());
        assert_eq!(map.new_keyframe(&frame).unwrap(), Some(KeyframeId(2)));
        let id = map
            .add_point(WorldPoint::origin(), Array1::from(scene::descriptor(0)).view())
            .unwrap();
        assert_eq!(id, LandmarkId(12));
    }
}
