//! 关键帧选择策略
//!
//! 规则按顺序判断，第一个命中的规则决定结果。前面的规则是硬性门限，后面的规则是触发条件。

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// 关键帧判断中用到的阈值
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyframeThresholds {
    /// 未被内点覆盖的视场比例低于该值时拒绝（和上一个关键帧太相似）
    pub min_fov_uncovered: f64,
    pub max_fov_uncovered: f64,
    /// 与上一个关键帧的距离 (m)
    pub min_distance: f64,
    pub max_distance: f64,
    /// 与上一个关键帧的旋转角度 (rad)
    pub min_angle: f64,
    pub max_angle: f64,
    /// 与上一个关键帧的时间间隔 (s)
    pub min_time: f64,
    pub max_time: f64,
    pub threshold_inliers_new_keyframe: usize,
}

impl Default for KeyframeThresholds {
    fn default() -> Self {
        Self {
            min_fov_uncovered: 0.1,
            max_fov_uncovered: 0.5,
            min_distance: 0.2,
            max_distance: 1.0,
            min_angle: 10f64.to_radians(),
            max_angle: 30f64.to_radians(),
            min_time: 1.0,
            max_time: 5.0,
            threshold_inliers_new_keyframe: 40,
        }
    }
}

/// 当前帧的判断依据
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KeyframeCues {
    pub n_keyframes: usize,
    pub n_inliers: usize,
    pub fov_uncovered: f64,
    /// 距离上一个关键帧
    pub elapsed: f64,
    pub distance: f64,
    pub angle: f64,
    pub manual_pose: bool,
    pub ba_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitReason {
    Bootstrap,
    ManualPose,
    FovUncovered,
    Distance,
    Rotation,
    FewInliers,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoManualPose,
    OnlyInit,
    Uninitialized,
    BundleInFlight,
    FovCovered,
    TooClose,
    TooSoon,
    NoTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeDecision {
    Admit(AdmitReason),
    Reject(RejectReason),
}

impl KeyframeDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, KeyframeDecision::Admit(_))
    }
}

/// 超过该数量的关键帧之后认为地图已经初始化
pub const INITIALIZED_KEYFRAMES: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct KeyframePolicy {
    pub thresholds: KeyframeThresholds,
    /// 初始化之后不再添加关键帧
    pub only_init: bool,
    /// 只在收到手动位姿时添加关键帧
    pub manual_keyframes: bool,
}

impl KeyframePolicy {
    pub fn decide(&self, cues: &KeyframeCues) -> KeyframeDecision {
        use AdmitReason::*;
        use KeyframeDecision::*;
        use RejectReason::*;
        let t = &self.thresholds;
        let initialized = cues.n_keyframes > INITIALIZED_KEYFRAMES;

        if cues.n_keyframes == 0 {
            return Admit(Bootstrap);
        }
        if self.manual_keyframes {
            return if cues.manual_pose {
                Admit(ManualPose)
            } else {
                Reject(NoManualPose)
            };
        }
        if self.only_init && initialized {
            return Reject(OnlyInit);
        }
        if !initialized {
            return if cues.manual_pose {
                Admit(ManualPose)
            } else {
                Reject(Uninitialized)
            };
        }
        if cues.ba_in_flight {
            return Reject(BundleInFlight);
        }
        if cues.fov_uncovered < t.min_fov_uncovered {
            return Reject(FovCovered);
        }
        if cues.distance < t.min_distance && cues.angle < t.min_angle {
            return Reject(TooClose);
        }
        if cues.elapsed < t.min_time {
            return Reject(TooSoon);
        }
        if cues.fov_uncovered > t.max_fov_uncovered {
            Admit(FovUncovered)
        } else if cues.distance > t.max_distance {
            Admit(Distance)
        } else if cues.angle > t.max_angle {
            Admit(Rotation)
        } else if cues.n_inliers < t.threshold_inliers_new_keyframe {
            Admit(FewInliers)
        } else if cues.elapsed > t.max_time {
            Admit(Timeout)
        } else {
            Reject(NoTrigger)
        }
    }
}

/// 图像划分为 `grid x grid` 个格子，返回没有任何内点的格子比例
pub fn fov_uncovered_fraction(inliers: &[Point2<f64>], width: u32, height: u32, grid: usize) -> f64 {
    if grid == 0 || width == 0 || height == 0 {
        return 1.0;
    }
    let mut covered = vec![false; grid * grid];
    for p in inliers {
        if p.x < 0.0 || p.y < 0.0 || p.x >= width as f64 || p.y >= height as f64 {
            continue;
        }
        let col = ((p.x / width as f64) * grid as f64) as usize;
        let row = ((p.y / height as f64) * grid as f64) as usize;
        covered[row.min(grid - 1) * grid + col.min(grid - 1)] = true;
    }
    let n_uncovered = covered.iter().filter(|c| !**c).count();
    n_uncovered as f64 / (grid * grid) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracking() -> KeyframeCues {
        KeyframeCues {
            n_keyframes: 6,
            n_inliers: 200,
            fov_uncovered: 0.3,
            elapsed: 2.0,
            distance: 0.5,
            angle: 0.0,
            manual_pose: false,
            ba_in_flight: false,
        }
    }

    #[test]
    fn test_bootstrap() {
        let policy = KeyframePolicy {
            manual_keyframes: true,
            ..Default::default()
        };
        let cues = KeyframeCues {
            n_keyframes: 0,
            ba_in_flight: true,
            ..Default::default()
        };
        assert_eq!(policy.decide(&cues), KeyframeDecision::Admit(AdmitReason::Bootstrap));
    }

    #[test]
    fn test_ba_in_flight_short_circuits() {
        let policy = KeyframePolicy::default();
        let cues = KeyframeCues {
            ba_in_flight: true,
            n_inliers: 1000,
            distance: 50.0,
            fov_uncovered: 1.0,
            elapsed: 100.0,
            ..tracking()
        };
        assert_eq!(
            policy.decide(&cues),
            KeyframeDecision::Reject(RejectReason::BundleInFlight)
        );
    }

    #[test]
    fn test_initialization_needs_manual_pose() {
        let policy = KeyframePolicy::default();
        let mut cues = KeyframeCues {
            n_keyframes: 2,
            ..tracking()
        };
        assert_eq!(policy.decide(&cues), KeyframeDecision::Reject(RejectReason::Uninitialized));
        cues.manual_pose = true;
        assert!(policy.decide(&cues).is_admit());

        let only_init = KeyframePolicy {
            only_init: true,
            ..Default::default()
        };
        cues.n_keyframes = 4;
        assert_eq!(only_init.decide(&cues), KeyframeDecision::Reject(RejectReason::OnlyInit));
    }

    #[test]
    fn test_manual_keyframes() {
        let policy = KeyframePolicy {
            manual_keyframes: true,
            ..Default::default()
        };
        let mut cues = KeyframeCues {
            distance: 10.0,
            ..tracking()
        };
        assert_eq!(policy.decide(&cues), KeyframeDecision::Reject(RejectReason::NoManualPose));
        cues.manual_pose = true;
        cues.ba_in_flight = true;
        assert_eq!(policy.decide(&cues), KeyframeDecision::Admit(AdmitReason::ManualPose));
    }

    #[test]
    fn test_gates_then_triggers() {
        let policy = KeyframePolicy::default();
        assert_eq!(policy.decide(&tracking()), KeyframeDecision::Reject(RejectReason::NoTrigger));

        let covered = KeyframeCues {
            fov_uncovered: 0.0,
            distance: 5.0,
            ..tracking()
        };
        assert_eq!(policy.decide(&covered), KeyframeDecision::Reject(RejectReason::FovCovered));

        let close = KeyframeCues {
            distance: 0.05,
            n_inliers: 0,
            ..tracking()
        };
        assert_eq!(policy.decide(&close), KeyframeDecision::Reject(RejectReason::TooClose));
        // 原地旋转足够大时不算太近
        let turned = KeyframeCues {
            angle: 1.0,
            ..close
        };
        assert_eq!(policy.decide(&turned), KeyframeDecision::Admit(AdmitReason::Rotation));

        let soon = KeyframeCues {
            elapsed: 0.5,
            distance: 5.0,
            ..tracking()
        };
        assert_eq!(policy.decide(&soon), KeyframeDecision::Reject(RejectReason::TooSoon));

        let far = KeyframeCues {
            distance: 2.0,
            ..tracking()
        };
        assert_eq!(policy.decide(&far), KeyframeDecision::Admit(AdmitReason::Distance));
        let few = KeyframeCues {
            n_inliers: 12,
            ..tracking()
        };
        assert_eq!(policy.decide(&few), KeyframeDecision::Admit(AdmitReason::FewInliers));
        let late = KeyframeCues {
            elapsed: 6.0,
            ..tracking()
        };
        assert_eq!(policy.decide(&late), KeyframeDecision::Admit(AdmitReason::Timeout));
        let uncovered = KeyframeCues {
            fov_uncovered: 0.8,
            ..tracking()
        };
        assert_eq!(policy.decide(&uncovered), KeyframeDecision::Admit(AdmitReason::FovUncovered));
    }

    #[test]
    fn test_fov_uncovered_fraction() {
        assert_eq!(fov_uncovered_fraction(&[], 640, 360, 4), 1.0);
        let pts = [
            Point2::new(10.0, 10.0),
            Point2::new(20.0, 20.0),
            Point2::new(630.0, 350.0),
            Point2::new(-5.0, 10.0),
        ];
        assert_eq!(fov_uncovered_fraction(&pts, 640, 360, 4), 14.0 / 16.0);
        let full: Vec<_> = (0..16)
            .map(|i| Point2::new(80.0 + 160.0 * (i % 4) as f64, 45.0 + 90.0 * (i / 4) as f64))
            .collect();
        assert_eq!(fov_uncovered_fraction(&full, 640, 360, 4), 0.0);
    }
}
