use std::collections::BTreeSet;

use ndarray::Array1;

use crate::global_types::{KeyframeId, LandmarkId, WorldPoint};

/// 路标点
#[derive(Debug, Clone)]
pub struct Landmark {
    pub id: LandmarkId,
    /// 世界坐标
    pub coordinates: WorldPoint,
    pub descriptor: Array1<f32>,
    /// 观测到该点的关键帧
    pub keyframes_seeing: BTreeSet<KeyframeId>,
    /// PnP 中作为内点/外点的次数
    pub times_inlier: u32,
    pub times_outlier: u32,
}

impl Landmark {
    pub fn new(id: LandmarkId, coordinates: WorldPoint, descriptor: Array1<f32>) -> Self {
        Self {
            id,
            coordinates,
            descriptor,
            keyframes_seeing: BTreeSet::new(),
            times_inlier: 0,
            times_outlier: 0,
        }
    }

    pub fn set_as_seen_by(&mut self, kf_id: KeyframeId) {
        self.keyframes_seeing.insert(kf_id);
    }

    /// 返回 true 表示已经没有关键帧观测该点
    pub fn set_as_unseen_by(&mut self, kf_id: KeyframeId) -> bool {
        if !self.keyframes_seeing.remove(&kf_id) {
            log::debug!("landmark {} was not seen by keyframe {}", self.id, kf_id);
        }
        self.keyframes_seeing.is_empty()
    }

    pub fn n_observers(&self) -> usize {
        self.keyframes_seeing.len()
    }

    /// 最早的观测（ID 最小的关键帧）
    pub fn least_recent_observer(&self) -> Option<KeyframeId> {
        self.keyframes_seeing.first().copied()
    }

    pub fn is_outlier(&self, remove_cst: f64, remove_coeff: f64) -> bool {
        self.times_outlier as f64 > remove_cst + remove_coeff * self.times_inlier as f64
    }

    pub fn is_out_of_bounds(&self, bound: f64) -> bool {
        self.coordinates.iter().any(|c| c.abs() > bound)
    }
}
