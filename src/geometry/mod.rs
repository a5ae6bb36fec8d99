//! 几何工具
//!
//! 描述子匹配、基础矩阵、三角化以及视锥可见性检测，都是对输入无副作用的纯函数。

mod fundamental;
mod matcher;
mod triangulation;
mod visibility;

pub use fundamental::{epipolar_residual, fundamental_from_projections};
pub use matcher::{match_descriptors, DescriptorMatches};
pub use triangulation::{
    optimal_correction, triangulate_dlt, triangulate_midpoint, Correction, GeometryError,
    TriangulationMethod,
};
pub use visibility::{frustum_planes, point_is_visible, Plane};

#[cfg(test)]
pub(crate) mod scene {
    //! 测试用的合成场景
    use std::sync::Arc;

    use nalgebra::{Point2, Point3};
    use ndarray::Array2;

    use crate::camera::{CameraTrait, PinholeCamera, PinholeParameters};
    use crate::global_types::{Frame, KeyframeId, Pose3D, Timestamp};
    use crate::map::Keyframe;

    pub fn camera() -> Arc<PinholeCamera> {
        Arc::new(PinholeCamera::from_parameters(PinholeParameters::default()))
    }

    /// 两个前视位姿，基线沿 y 方向
    pub fn two_poses() -> (Pose3D, Pose3D) {
        (
            Pose3D::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.0),
            Pose3D::new(0.0, -0.5, 1.1, 0.0, 0.02, 0.05),
        )
    }

    /// 位于两个相机前方的网格点
    pub fn grid_points(n: usize) -> Vec<Point3<f64>> {
        (0..n)
            .map(|i| {
                let row = (i / 10) as f64;
                let col = (i % 10) as f64;
                Point3::new(4.0 + 0.05 * col, -0.8 + 0.15 * col, 0.6 + 0.12 * row)
            })
            .collect()
    }

    /// 深度不同的点，避免共面
    pub fn scattered_points(n: usize) -> Vec<Point3<f64>> {
        (0..n)
            .map(|i| {
                let depth = 3.5 + 0.4 * ((i * 7) % 5) as f64;
                let y = -1.0 + 0.1 * (i % 20) as f64;
                let z = 0.5 + 0.15 * ((i * 3) % 7) as f64;
                Point3::new(depth, y, z)
            })
            .collect()
    }

    /// 每个点一个不同的描述子，两两距离远大于匹配阈值
    pub fn descriptor(i: usize) -> Vec<f32> {
        let mut d = vec![0.0f32; 8];
        d[i % 8] = 1.0 + (i / 8) as f32;
        d
    }

    pub fn frame(pose: &Pose3D, points: &[Point3<f64>], timestamp: Timestamp) -> Frame {
        let camera = camera();
        let mut keypoints = Vec::new();
        let mut descriptors = Array2::<f32>::zeros((points.len(), 8));
        for (i, p) in points.iter().enumerate() {
            let uv = camera.project(pose, p).unwrap_or(Point2::new(-1.0, -1.0));
            keypoints.push(uv);
            for (j, v) in descriptor(i).into_iter().enumerate() {
                descriptors[(i, j)] = v;
            }
        }
        let (image_width, image_height) = camera.image_size();
        Frame {
            timestamp,
            pose: *pose,
            keypoints,
            descriptors,
            image_width,
            image_height,
        }
    }

    pub fn keyframe(id: u32, pose: &Pose3D, points: &[Point3<f64>]) -> Keyframe<PinholeCamera> {
        let frame = frame(pose, points, Timestamp::default());
        Keyframe::new(KeyframeId(id), &frame, camera())
    }
}
