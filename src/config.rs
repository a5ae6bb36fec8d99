use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::TriangulationMethod;
use crate::map::KeyframeThresholds;

/// 关键帧之间描述子匹配的距离阈值
pub const THRESHOLD_KF_MATCH: f32 = 0.2;
/// 帧与地图之间描述子匹配的距离阈值
pub const THRESHOLD_PNP_MATCH: f32 = 0.25;
/// 关键帧匹配时考虑的候选数量上限
pub const MAX_MATCHES: usize = 500;

/// PnP 最少匹配数量，低于该值认为跟踪丢失
pub const MIN_PNP_MATCHES: usize = 10;
/// PnP 最少内点数量
pub const MIN_PNP_INLIERS: usize = 10;
pub const PNP_ITERATIONS: i32 = 2500;
/// 重投影误差阈值 (像素)
pub const PNP_REPROJECTION_ERROR: f64 = 4.0;
pub const PNP_CONFIDENCE: f64 = 0.99;
/// PnP 估计高度与先验高度之差的上限 (m)
pub const MAX_HEIGHT_JUMP: f64 = 0.8;
/// 旋转矩阵行列式与 1 的容差
pub const ROTATION_TOLERANCE: f64 = 1e-7;

/// 局部BA窗口中关键帧的数量
pub const LOCAL_WINDOW: usize = 5;
/// 累计多少个关键帧后进行一次全局BA
pub const GLOBAL_BA_EVERY_KEYFRAMES: usize = 5;
/// 距离上一次全局BA的最长时间 (s)
pub const GLOBAL_BA_PERIOD: f64 = 30.0;
/// 参与BA的关键帧最少已建图点数
pub const MIN_BA_MAPPED_POINTS: usize = 4;

/// 被 2/3/>=4 个关键帧观测的点的代价阈值，负数表示不剔除
pub const RPT2: f64 = 4.0;
pub const RPT3: f64 = 8.0;
pub const RPT4: f64 = 16.0;

pub const BA_VISIBILITY_MARGIN: f64 = 0.0;
pub const TRIANGULATION_MARGIN: f64 = 0.0;

/// 内外点计数剔除：times_outlier > REMOVE_CST + REMOVE_COEFF * times_inlier
pub const REMOVE_CST: f64 = 5.0;
pub const REMOVE_COEFF: f64 = 0.0;

/// 地图边界 (m)，超出的路标会被删除
pub const MAP_BOUNDS: f64 = 10.0;
/// 关键帧所需的最少特征点数量（不含）
pub const MIN_KEYFRAME_KEYPOINTS: usize = 10;

/// 内点数量滑动平均系数
pub const INLIER_AVERAGE_ALPHA: f64 = 0.3;
/// 视场覆盖率网格大小
pub const FOV_GRID: usize = 4;

/// Kanatani 最优校正
pub const KANATANI_MAX_ITERATIONS: usize = 100;
pub const KANATANI_TOLERANCE: f64 = 1e-3;
/// 等效焦距 f0
pub const KANATANI_F0: f64 = 600.0;
pub const DENOMINATOR_EPSILON: f64 = 1e-12;

/// 位姿噪声注入，用于初始化实验
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseNoise {
    #[default]
    None,
    /// x, y, yaw
    Planar,
    /// z, roll, pitch
    Spatial,
    Full,
}

impl PoseNoise {
    /// 对第 `n_keyframes + 1` 个关键帧的位姿加入固定扰动
    pub fn apply(&self, pose: &mut crate::global_types::Pose3D, n_keyframes: usize) {
        use std::f64::consts::PI;
        let (planar, spatial) = match self {
            PoseNoise::None => return,
            PoseNoise::Planar => (1.0, 0.0),
            PoseNoise::Spatial => (0.0, 1.0),
            PoseNoise::Full => (1.0, 1.0),
        };
        let n = n_keyframes;
        let flag = |c: bool| if c { 1.0 } else { 0.0 };
        pose.x += 0.300 * flag(n == 1 || n == 2) * planar;
        pose.y += 0.300 * flag(n == 2 || n == 3) * planar;
        pose.rot_z += (PI / 10.0) * flag(n == 3 || n == 1) * planar;
        pose.z += 0.050 * flag(n == 1) * spatial;
        pose.rot_x += (PI / 30.0) * flag(n == 2) * spatial;
        pose.rot_y += (PI / 30.0) * flag(n == 3) * spatial;
        pose.rot_z = crate::utility::Utility::wrap_angle(pose.rot_z);
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, PoseNoise::None)
    }
}

/// BA 后按观测数量剔除点的代价阈值
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierCost {
    pub rpt2: f64,
    pub rpt3: f64,
    pub rpt4: f64,
}

impl Default for OutlierCost {
    fn default() -> Self {
        Self {
            rpt2: RPT2,
            rpt3: RPT3,
            rpt4: RPT4,
        }
    }
}

impl OutlierCost {
    /// 观测数量对应的阈值，`None` 表示不按代价剔除
    pub fn threshold(&self, n_observers: usize) -> Option<f64> {
        let t = match n_observers {
            0 | 1 => return None,
            2 => self.rpt2,
            3 => self.rpt3,
            _ => self.rpt4,
        };
        if t < 0.0 {
            None
        } else {
            Some(t)
        }
    }
}

/// 地图参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapParameters {
    pub threshold_kf_match: f32,
    pub threshold_pnp_match: f32,
    pub max_matches: usize,

    pub min_pnp_matches: usize,
    pub min_pnp_inliers: usize,
    pub pnp_iterations: i32,
    pub pnp_reprojection_error: f64,
    pub max_height_jump: f64,
    pub rotation_tolerance: f64,

    /// 不进行BA
    pub no_bundle_adjustment: bool,
    /// 局部BA之后总是再进行第二遍
    pub double_ba: bool,
    pub local_window: usize,
    pub global_ba_every_keyframes: usize,
    pub global_ba_period: f64,
    pub min_ba_mapped_points: usize,
    pub outlier_cost: OutlierCost,
    pub ba_visibility_margin: f64,

    pub triangulation: TriangulationMethod,
    pub triangulation_margin: f64,

    /// 只测试初始化：初始化完成后不再添加关键帧
    pub only_init: bool,
    /// 只在收到手动位姿时添加关键帧
    pub manual_keyframes: bool,
    /// benchmark 模式下不使用PnP位姿替换关键帧位姿
    pub benchmark: bool,

    pub remove_cst: f64,
    pub remove_coeff: f64,
    pub map_bounds: f64,
    pub min_keyframe_keypoints: usize,
    pub pose_noise: PoseNoise,

    #[serde(flatten)]
    pub keyframe: KeyframeThresholds,
}

impl Default for MapParameters {
    fn default() -> Self {
        Self {
            threshold_kf_match: THRESHOLD_KF_MATCH,
            threshold_pnp_match: THRESHOLD_PNP_MATCH,
            max_matches: MAX_MATCHES,
            min_pnp_matches: MIN_PNP_MATCHES,
            min_pnp_inliers: MIN_PNP_INLIERS,
            pnp_iterations: PNP_ITERATIONS,
            pnp_reprojection_error: PNP_REPROJECTION_ERROR,
            max_height_jump: MAX_HEIGHT_JUMP,
            rotation_tolerance: ROTATION_TOLERANCE,
            no_bundle_adjustment: false,
            double_ba: false,
            local_window: LOCAL_WINDOW,
            global_ba_every_keyframes: GLOBAL_BA_EVERY_KEYFRAMES,
            global_ba_period: GLOBAL_BA_PERIOD,
            min_ba_mapped_points: MIN_BA_MAPPED_POINTS,
            outlier_cost: OutlierCost::default(),
            ba_visibility_margin: BA_VISIBILITY_MARGIN,
            triangulation: TriangulationMethod::default(),
            triangulation_margin: TRIANGULATION_MARGIN,
            only_init: false,
            manual_keyframes: false,
            benchmark: false,
            remove_cst: REMOVE_CST,
            remove_coeff: REMOVE_COEFF,
            map_bounds: MAP_BOUNDS,
            min_keyframe_keypoints: MIN_KEYFRAME_KEYPOINTS,
            pose_noise: PoseNoise::None,
            keyframe: KeyframeThresholds::default(),
        }
    }
}

impl MapParameters {
    /// 从 json 文件读取参数，缺省字段使用默认值
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open parameter file {}", path.display()))?;
        let params: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("failed to parse parameter file {}", path.display()))?;
        log::info!("map parameters loaded from {}", path.display());
        Ok(params)
    }
}
