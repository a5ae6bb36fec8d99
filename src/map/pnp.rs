use std::collections::BTreeSet;

use nalgebra::{Point2, Rotation3};
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Vec3f, Vector, CV_64F};
use opencv::prelude::*;
use thiserror::Error;

use super::{fov_uncovered_fraction, Map};
use crate::camera::CameraTrait;
use crate::config::{FOV_GRID, PNP_CONFIDENCE};
use crate::geometry::match_descriptors;
use crate::global_cast::{Matrix3d, Vector3d};
use crate::global_types::{Frame, Pose3D};

/// PnP 失败的原因
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PnpError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("map is empty")]
    EmptyMap,
    #[error("tracking lost! not enough matching points ({0})")]
    TooFewMatches(usize),
    #[error("tracking lost! not enough inliers ({0})")]
    TooFewInliers(usize),
    #[error("tracking lost! determinant of rotation matrix is {0}")]
    BadRotation(f64),
    #[error("tracking lost! height jump of {0:.2} m")]
    BadHeightJump(f64),
    #[error("PnP solver failed: {0}")]
    Solver(String),
}

impl From<opencv::Error> for PnpError {
    fn from(e: opencv::Error) -> Self {
        PnpError::Solver(e.to_string())
    }
}

/// PnP 求解结果
#[derive(Debug, Clone, PartialEq)]
pub struct PnpEstimate {
    /// 无人机位姿
    pub pose: Pose3D,
    pub n_matches: usize,
    pub n_inliers: usize,
    /// 未被内点覆盖的视场比例
    pub fov_uncovered: f64,
}

impl<C: CameraTrait> Map<C> {
    /// doPnP
    ///
    /// 当前帧与地图中所有路标匹配，RANSAC 求解后用内点再优化一次。
    /// 成功时更新参与匹配的路标的内点/外点计数。
    pub fn do_pnp(&mut self, frame: &Frame) -> Result<PnpEstimate, PnpError> {
        if frame.is_empty() {
            return Err(PnpError::EmptyFrame);
        }
        if self.cloud.is_empty() {
            return Err(PnpError::EmptyMap);
        }
        let matches = match_descriptors(
            self.cloud.descriptors(),
            frame.descriptors.view(),
            None,
            self.params.threshold_pnp_match,
            Some(self.params.max_matches),
        );
        // 描述子多于特征点时丢弃多余的行
        let pairs: Vec<(usize, usize)> = matches
            .iter()
            .filter(|&(_, b)| b < frame.keypoints.len())
            .collect();
        if pairs.len() < self.params.min_pnp_matches {
            return Err(PnpError::TooFewMatches(pairs.len()));
        }

        let mut object_points = Vector::<Vec3f>::new();
        let mut image_points = Vector::<Point2f>::new();
        for &(a, b) in &pairs {
            let p = &self.cloud.points()[a];
            let uv = &frame.keypoints[b];
            object_points.push(Vec3f::from_array([p.x as f32, p.y as f32, p.z as f32]));
            image_points.push(Point2f::new(uv.x as f32, uv.y as f32));
        }

        let k = Mat::try_from(Matrix3d(self.camera.intrinsic_matrix()))?;
        let dist_coeffs = Mat::zeros(1, 5, CV_64F)?.to_mat()?;
        let (mut rvec, mut tvec, use_guess) = match self.pnp_guess {
            Some((r, t)) => (Mat::try_from(Vector3d(r))?, Mat::try_from(Vector3d(t))?, true),
            None => (Mat::default(), Mat::default(), false),
        };
        let mut inliers = Vector::<i32>::new();
        calib3d::solve_pnp_ransac(
            &object_points,
            &image_points,
            &k,
            &dist_coeffs,
            &mut rvec,
            &mut tvec,
            use_guess,
            self.params.pnp_iterations,
            self.params.pnp_reprojection_error as f32,
            PNP_CONFIDENCE,
            &mut inliers,
            calib3d::SOLVEPNP_P3P,
        )?;
        if inliers.len() < self.params.min_pnp_inliers {
            return Err(PnpError::TooFewInliers(inliers.len()));
        }

        let inlier_set: BTreeSet<usize> = inliers.iter().map(|i| i as usize).collect();
        let mut inlier_object = Vector::<Vec3f>::new();
        let mut inlier_image = Vector::<Point2f>::new();
        for &i in &inlier_set {
            inlier_object.push(object_points.get(i)?);
            inlier_image.push(image_points.get(i)?);
        }
        calib3d::solve_pnp(
            &inlier_object,
            &inlier_image,
            &k,
            &dist_coeffs,
            &mut rvec,
            &mut tvec,
            true,
            calib3d::SOLVEPNP_ITERATIVE,
        )?;

        let mut rmat = Mat::default();
        calib3d::rodrigues(&rvec, &mut rmat, &mut Mat::default())?;
        let world_to_cam = Matrix3d::try_from(&rmat)?.0;
        let det = world_to_cam.determinant();
        if !det.is_finite() || (det - 1.0).abs() > self.params.rotation_tolerance {
            return Err(PnpError::BadRotation(det));
        }
        let t = Vector3d::try_from(&tvec)?.0;
        let position = -(world_to_cam.transpose() * t);
        let height_jump = (position.z - frame.pose.z).abs();
        if height_jump > self.params.max_height_jump {
            return Err(PnpError::BadHeightJump(height_jump));
        }

        // drone -> world = cam -> world * drone -> cam
        let drone_to_world = world_to_cam.transpose() * self.camera.cam_to_drone().matrix().transpose();
        let pose = Pose3D::from_parts(&position, &Rotation3::from_matrix_unchecked(drone_to_world));

        for (k, &(a, _)) in pairs.iter().enumerate() {
            let id = self.cloud.ids()[a];
            if let Some(landmark) = self.landmarks.get_mut(&id) {
                if inlier_set.contains(&k) {
                    landmark.times_inlier += 1;
                } else {
                    landmark.times_outlier += 1;
                }
            }
        }

        let inlier_keypoints: Vec<Point2<f64>> =
            inlier_set.iter().map(|&i| frame.keypoints[pairs[i].1]).collect();
        let (width, height) = if frame.image_width > 0 && frame.image_height > 0 {
            (frame.image_width, frame.image_height)
        } else {
            self.camera.image_size()
        };
        let fov_uncovered = fov_uncovered_fraction(&inlier_keypoints, width, height, FOV_GRID);

        self.pnp_guess = Some((Vector3d::try_from(&rvec)?.0, t));
        Ok(PnpEstimate {
            pose,
            n_matches: pairs.len(),
            n_inliers: inlier_set.len(),
            fov_uncovered,
        })
    }
}
