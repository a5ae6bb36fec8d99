use std::fmt::Display;

use nalgebra::{Point2, Point3, Rotation3, Vector3};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// 纳秒时间戳
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);
impl Timestamp {
    pub fn from_sec(sec: f64) -> Self {
        Timestamp((sec * 1e9).round() as i64)
    }
    pub fn as_sec(&self) -> f64 {
        self.0 as f64 / 1e9
    }
    /// dt
    pub fn duration_since(&self, other: &Timestamp) -> f64 {
        (self.0 - other.0) as f64 / 1e9
    }
}

/// 路标点ID，进程内单调递增，不会复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LandmarkId(pub u32);

/// 关键帧ID，进程内单调递增，不会复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyframeId(pub u32);

impl Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 关键帧中某个特征点对应的路标状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PointSlot {
    /// 尚未建图
    #[default]
    Unmapped,
    /// 对应的路标已经被删除
    Removed,
    /// 对应一个有效的路标
    Mapped(LandmarkId),
}

impl PointSlot {
    pub fn is_unmapped(&self) -> bool {
        matches!(self, PointSlot::Unmapped)
    }
    pub fn landmark(&self) -> Option<LandmarkId> {
        match self {
            PointSlot::Mapped(id) => Some(*id),
            _ => None,
        }
    }
}

/// 无人机位姿（世界坐标系）
///
/// 欧拉角约定：`R = Rz(rot_z) * Ry(rot_y) * Rx(rot_x)`，即 drone -> world。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rot_x: f64,
    pub rot_y: f64,
    pub rot_z: f64,
}

impl Pose3D {
    pub fn new(x: f64, y: f64, z: f64, rot_x: f64, rot_y: f64, rot_z: f64) -> Self {
        Self {
            x,
            y,
            z,
            rot_x,
            rot_y,
            rot_z,
        }
    }

    pub fn from_parts(position: &Vector3<f64>, rotation: &Rotation3<f64>) -> Self {
        let (rot_x, rot_y, rot_z) = rotation.euler_angles();
        Self::new(position.x, position.y, position.z, rot_x, rot_y, rot_z)
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    /// drone -> world
    pub fn rotation(&self) -> Rotation3<f64> {
        Rotation3::from_euler_angles(self.rot_x, self.rot_y, self.rot_z)
    }

    /// 欧式距离
    pub fn distance_to(&self, other: &Pose3D) -> f64 {
        (self.position() - other.position()).norm()
    }

    /// 两个姿态之间的旋转角度 (rad)
    pub fn angle_to(&self, other: &Pose3D) -> f64 {
        self.rotation().rotation_to(&other.rotation()).angle()
    }
}

impl Display for Pose3D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "x = {:.2}, y = {:.2}, z = {:.2}, rotX = {:.1}, rotY = {:.1}, rotZ = {:.1}",
            self.x,
            self.y,
            self.z,
            self.rot_x.to_degrees(),
            self.rot_y.to_degrees(),
            self.rot_z.to_degrees()
        )
    }
}

/// 特征提取模块输出的一帧：先验位姿、特征点以及对应的描述子。
///
/// `descriptors` 的第 i 行对应 `keypoints[i]`。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp: Timestamp,
    pub pose: Pose3D,
    pub keypoints: Vec<Point2<f64>>,
    pub descriptors: Array2<f32>,
    pub image_width: u32,
    pub image_height: u32,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty() || self.descriptors.nrows() == 0
    }
}

/// 世界坐标系下的三维点
pub type WorldPoint = Point3<f64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp() {
        let t1 = Timestamp(1_000_000_000);
        let t2 = Timestamp::from_sec(2.5);
        assert_eq!(t2.0, 2_500_000_000);
        assert!((t2.duration_since(&t1) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_pose_rotation_roundtrip() {
        let pose = Pose3D::new(1.0, 2.0, 3.0, 0.1, -0.2, 1.3);
        let back = Pose3D::from_parts(&pose.position(), &pose.rotation());
        assert!((back.rot_x - pose.rot_x).abs() < 1e-9);
        assert!((back.rot_y - pose.rot_y).abs() < 1e-9);
        assert!((back.rot_z - pose.rot_z).abs() < 1e-9);
        // yaw 绕 z 轴
        let yaw = Pose3D::new(0.0, 0.0, 0.0, 0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let forward = yaw.rotation() * Vector3::x();
        assert!((forward - Vector3::y()).norm() < 1e-12);
    }

    #[test]
    fn test_point_slot() {
        assert!(PointSlot::default().is_unmapped());
        assert_eq!(PointSlot::Removed.landmark(), None);
        assert_eq!(PointSlot::Mapped(LandmarkId(4)).landmark(), Some(LandmarkId(4)));
    }
}
