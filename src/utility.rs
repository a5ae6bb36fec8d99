use std::f64::consts::PI;

pub struct Utility {}

impl Utility {
    /// 角度归一化到 (-pi, pi]
    #[inline]
    pub fn wrap_angle(angle: f64) -> f64 {
        let mut a = angle % (2.0 * PI);
        if a <= -PI {
            a += 2.0 * PI;
        } else if a > PI {
            a -= 2.0 * PI;
        }
        a
    }

    /// 由相机安装角构造 camera -> drone 的旋转。
    ///
    /// 安装角为零时相机朝前：相机 z 轴对应机体 x 轴，相机 x 轴对应机体 -y，相机 y 轴对应机体 -z。
    #[inline]
    pub fn mount_rotation(roll: f64, pitch: f64, yaw: f64) -> nalgebra::Rotation3<f64> {
        let base = nalgebra::Matrix3::new(
            0.0, 0.0, 1.0, //
            -1.0, 0.0, 0.0, //
            0.0, -1.0, 0.0,
        );
        nalgebra::Rotation3::from_euler_angles(roll, pitch, yaw)
            * nalgebra::Rotation3::from_matrix_unchecked(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_angle() {
        assert!((Utility::wrap_angle(3.0 * PI) - PI).abs() < 1e-12);
        assert!((Utility::wrap_angle(-PI / 2.0) + PI / 2.0).abs() < 1e-12);
        assert!((Utility::wrap_angle(2.0 * PI + 0.1) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_mount_rotation() {
        let r = Utility::mount_rotation(0.0, 0.0, 0.0);
        assert!((r.matrix().determinant() - 1.0).abs() < 1e-12);
        let optical_axis = r * nalgebra::Vector3::z();
        assert!((optical_axis - nalgebra::Vector3::x()).norm() < 1e-12);
    }
}
