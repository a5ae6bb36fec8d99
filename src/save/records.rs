use serde::{Deserialize, Serialize};

use crate::camera::CameraTrait;
use crate::map::{Keyframe, Landmark};

/// keyframes.csv 中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyframeRecord {
    pub id: u32,
    pub timestamp: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rot_x: f64,
    pub rot_y: f64,
    pub rot_z: f64,
    pub n_keypoints: usize,
    pub n_mapped: usize,
}

impl<C: CameraTrait> From<&Keyframe<C>> for KeyframeRecord {
    fn from(kf: &Keyframe<C>) -> Self {
        Self {
            id: kf.id.0,
            timestamp: kf.timestamp.0,
            x: kf.pose.x,
            y: kf.pose.y,
            z: kf.pose.z,
            rot_x: kf.pose.rot_x,
            rot_y: kf.pose.rot_y,
            rot_z: kf.pose.rot_z,
            n_keypoints: kf.npts(),
            n_mapped: kf.n_mapped(),
        }
    }
}

/// landmarks.csv 中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkRecord {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub n_observers: usize,
    pub times_inlier: u32,
    pub times_outlier: u32,
}

impl From<&Landmark> for LandmarkRecord {
    fn from(lm: &Landmark) -> Self {
        Self {
            id: lm.id.0,
            x: lm.coordinates.x,
            y: lm.coordinates.y,
            z: lm.coordinates.z,
            n_observers: lm.n_observers(),
            times_inlier: lm.times_inlier,
            times_outlier: lm.times_outlier,
        }
    }
}
