use serde::{Deserialize, Serialize};

use super::Map;
use crate::camera::CameraTrait;
use crate::global_types::{KeyframeId, Pose3D};

/// BA 耗时和迭代次数的历史
#[derive(Debug, Clone, Default)]
pub struct BundleTiming {
    pass1: Vec<(f64, u32)>,
    pass2: Vec<(f64, u32)>,
}

impl BundleTiming {
    pub fn record_pass1(&mut self, time_taken: f64, num_iter: u32) {
        self.pass1.push((time_taken, num_iter));
    }

    pub fn record_pass2(&mut self, time_taken: f64, num_iter: u32) {
        self.pass2.push((time_taken, num_iter));
    }

    pub fn last_pass1(&self) -> Option<(f64, u32)> {
        self.pass1.last().copied()
    }

    pub fn last_pass2(&self) -> Option<(f64, u32)> {
        self.pass2.last().copied()
    }

    /// 所有 BA 的总耗时
    pub fn total_time(&self) -> f64 {
        self.pass1.iter().chain(&self.pass2).map(|(t, _)| t).sum()
    }
}

/// 地图状态的只读快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkInfo {
    pub pts_map: usize,
    pub keyframes_id: Vec<KeyframeId>,
    pub keyframes_pose: Vec<Pose3D>,
    pub n_pts_keyframe: Vec<usize>,
    pub n_mapped_pts_keyframe: Vec<usize>,
    pub time_ba_pass1: Option<f64>,
    pub num_iter_pass1: Option<u32>,
    pub time_ba_pass2: Option<f64>,
    pub num_iter_pass2: Option<u32>,
    pub total_ba_time: f64,
    pub inlier_average: f64,
}

impl<C: CameraTrait> Map<C> {
    /// publishBenchmarkInfo
    pub fn benchmark_info(&self) -> BenchmarkInfo {
        let pass1 = self.timing.last_pass1();
        let pass2 = self.timing.last_pass2();
        BenchmarkInfo {
            pts_map: self.landmarks.len(),
            keyframes_id: self.keyframes.keys().copied().collect(),
            keyframes_pose: self.keyframes.values().map(|kf| kf.pose).collect(),
            n_pts_keyframe: self.keyframes.values().map(|kf| kf.npts()).collect(),
            n_mapped_pts_keyframe: self.keyframes.values().map(|kf| kf.n_mapped()).collect(),
            time_ba_pass1: pass1.map(|p| p.0),
            num_iter_pass1: pass1.map(|p| p.1),
            time_ba_pass2: pass2.map(|p| p.0),
            num_iter_pass2: pass2.map(|p| p.1),
            total_ba_time: self.timing.total_time(),
            inlier_average: self.inlier_average,
        }
    }
}
