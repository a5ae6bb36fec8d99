use nalgebra::{Point2, Point3, Vector3};

use crate::camera::CameraTrait;
use crate::global_types::Pose3D;
use crate::map::Keyframe;

/// 过 `origin`、法向量为 `normal`（单位向量）的平面，法向量指向视锥内部
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vector3<f64>,
    pub origin: Point3<f64>,
}

impl Plane {
    pub fn signed_distance(&self, point: &Point3<f64>) -> f64 {
        self.normal.dot(&(point - self.origin))
    }
}

/// 视锥的四个侧面（世界坐标系）
///
/// 由图像四个角点反投影得到的射线两两构成侧面，法向量统一翻转到光轴一侧。
pub fn frustum_planes<C: CameraTrait + ?Sized>(camera: &C, pose: &Pose3D) -> [Plane; 4] {
    let (w, h) = camera.image_size();
    let (w, h) = (w as f64, h as f64);
    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(w, 0.0),
        Point2::new(w, h),
        Point2::new(0.0, h),
    ];
    let rays = corners.map(|c| camera.lift_projective(&c));
    let cam_to_world = camera.cam_to_world(pose);
    let origin = Point3::from(pose.position());

    let mut planes = [Plane {
        normal: Vector3::zeros(),
        origin,
    }; 4];
    for (i, plane) in planes.iter_mut().enumerate() {
        let mut n = rays[i].cross(&rays[(i + 1) % 4]).normalize();
        if n.z < 0.0 {
            n = -n;
        }
        plane.normal = cam_to_world * n;
    }
    planes
}

/// 点在四个侧面内侧且距离都大于 `margin` 时可见，`margin` 可以为负
pub fn point_is_visible<C: CameraTrait>(kf: &Keyframe<C>, point: &Point3<f64>, margin: f64) -> bool {
    frustum_planes(kf.camera.as_ref(), &kf.pose)
        .iter()
        .all(|plane| plane.signed_distance(point) > margin)
}
