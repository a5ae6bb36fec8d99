mod pinhole_camera;
pub use pinhole_camera::{PinholeCamera, PinholeParameters};

use nalgebra::{Matrix3, Matrix3x4, Point2, Point3, Rotation3, Vector3};

use crate::global_types::Pose3D;

/// 相机的trait
///
/// 内参和外参在构造之后只读，可以在所有关键帧之间共享。
pub trait CameraTrait {
    /// 内参矩阵 K
    fn intrinsic_matrix(&self) -> Matrix3<f64>;
    /// (width, height)
    fn image_size(&self) -> (u32, u32);
    /// camera -> drone
    fn cam_to_drone(&self) -> Rotation3<f64>;
    /// 安装角 (roll, pitch, yaw)，BA 消息中使用
    fn mount_angles(&self) -> [f64; 3];

    /// 像素坐标反投影到归一化平面 (z = 1)
    fn lift_projective(&self, p: &Point2<f64>) -> Vector3<f64> {
        let k = self.intrinsic_matrix();
        Vector3::new((p.x - k[(0, 2)]) / k[(0, 0)], (p.y - k[(1, 2)]) / k[(1, 1)], 1.0)
    }

    /// camera -> world
    fn cam_to_world(&self, pose: &Pose3D) -> Rotation3<f64> {
        pose.rotation() * self.cam_to_drone()
    }

    /// 投影矩阵 P = K * R_cw * [I | -o]
    fn projection_matrix(&self, pose: &Pose3D) -> Matrix3x4<f64> {
        let world_to_cam = self.cam_to_world(pose).inverse();
        let origin = pose.position();
        let mut extrinsic = Matrix3x4::zeros();
        extrinsic
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(world_to_cam.matrix());
        extrinsic
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&(-(world_to_cam * origin)));
        self.intrinsic_matrix() * extrinsic
    }

    /// 将世界坐标系下的点投影到像素平面，点在相机后方时返回 None
    fn project(&self, pose: &Pose3D, point: &Point3<f64>) -> Option<Point2<f64>> {
        let p = self.projection_matrix(pose) * point.to_homogeneous();
        if p.z <= 0.0 {
            return None;
        }
        Some(Point2::new(p.x / p.z, p.y / p.z))
    }
}
