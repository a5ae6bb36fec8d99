use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2, Point3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fundamental::fundamental_from_projections;
use crate::camera::CameraTrait;
use crate::config::{DENOMINATOR_EPSILON, KANATANI_F0, KANATANI_MAX_ITERATIONS, KANATANI_TOLERANCE};
use crate::map::Keyframe;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("near-zero denominator ({0:e}) in optimal correction")]
    DegenerateDenominator(f64),
    #[error("degenerate two-view geometry")]
    DegenerateProjection,
    #[error("SVD did not converge")]
    Svd,
    #[error("keypoint index {0} out of range")]
    KeypointIndex(usize),
}

/// 三角化方法，构造时选定
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriangulationMethod {
    /// 线性三角化
    Dlt,
    /// 两条射线公垂线的中点
    Midpoint,
    /// Kanatani 最优校正后再线性三角化
    #[default]
    Iterative,
}

impl TriangulationMethod {
    /// triangulate
    pub fn triangulate<C: CameraTrait>(
        &self,
        kf1: &Keyframe<C>,
        idx1: usize,
        kf2: &Keyframe<C>,
        idx2: usize,
    ) -> Result<Point3<f64>, GeometryError> {
        let x1 = kf1.keypoint(idx1).ok_or(GeometryError::KeypointIndex(idx1))?;
        let x2 = kf2.keypoint(idx2).ok_or(GeometryError::KeypointIndex(idx2))?;
        match self {
            TriangulationMethod::Dlt => {
                triangulate_dlt(&kf1.projection_matrix(), &kf2.projection_matrix(), &x1, &x2)
            }
            TriangulationMethod::Midpoint => triangulate_midpoint(
                &kf1.camera_center(),
                &kf1.bearing(&x1),
                &kf2.camera_center(),
                &kf2.bearing(&x2),
            ),
            TriangulationMethod::Iterative => {
                let p1 = kf1.projection_matrix();
                let p2 = kf2.projection_matrix();
                let f = fundamental_from_projections(&p1, &p2);
                let norm = f.norm();
                if norm < DENOMINATOR_EPSILON {
                    return Err(GeometryError::DegenerateProjection);
                }
                let correction = optimal_correction(&(f / norm), &x1, &x2)?;
                if !correction.converged {
                    log::info!(
                        "optimal correction hit {} iterations between keyframes {} and {}",
                        correction.iterations,
                        kf1.id,
                        kf2.id
                    );
                }
                triangulate_dlt(&p1, &p2, &correction.x1, &correction.x2)
            }
        }
    }
}

/// 线性三角化 (DLT)，返回去齐次后的世界坐标
pub fn triangulate_dlt(
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
    x1: &Point2<f64>,
    x2: &Point2<f64>,
) -> Result<Point3<f64>, GeometryError> {
    let row0 = x1.x * p1.row(2) - p1.row(0);
    let row1 = x1.y * p1.row(2) - p1.row(1);
    let row2 = x2.x * p2.row(2) - p2.row(0);
    let row3 = x2.y * p2.row(2) - p2.row(1);
    let design_matrix = Matrix4::<f64>::from_rows(&[row0, row1, row2, row3]);

    let svd = nalgebra::SVD::new(design_matrix, false, true);
    let v_t = svd.v_t.ok_or(GeometryError::Svd)?;
    // 最小奇异值对应的右奇异向量
    let tri_pt = v_t.row(svd.singular_values.imin());
    if tri_pt[3].abs() < DENOMINATOR_EPSILON {
        return Err(GeometryError::DegenerateProjection);
    }
    Ok(Point3::new(
        tri_pt[0] / tri_pt[3],
        tri_pt[1] / tri_pt[3],
        tri_pt[2] / tri_pt[3],
    ))
}

/// 两条射线 `o1 + s d1` 与 `o2 + t d2` 最近点连线的中点
pub fn triangulate_midpoint(
    o1: &Point3<f64>,
    d1: &Vector3<f64>,
    o2: &Point3<f64>,
    d2: &Vector3<f64>,
) -> Result<Point3<f64>, GeometryError> {
    let w0 = o1 - o2;
    let (a, b, c) = (d1.dot(d1), d1.dot(d2), d2.dot(d2));
    let (d, e) = (d1.dot(&w0), d2.dot(&w0));
    let den = a * c - b * b;
    if den.abs() < DENOMINATOR_EPSILON {
        // 平行射线
        return Err(GeometryError::DegenerateProjection);
    }
    let s = (b * e - c * d) / den;
    let t = (a * e - b * d) / den;
    let q1 = o1 + d1 * s;
    let q2 = o2 + d2 * t;
    Ok(Point3::from((q1.coords + q2.coords) / 2.0))
}

/// 最优校正的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub x1: Point2<f64>,
    pub x2: Point2<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Kanatani 最优校正
///
/// 迭代修正两个像点使其满足 `x1^T F x2 = 0`，直到修正量的变化小于
/// [KANATANI_TOLERANCE]。达到 [KANATANI_MAX_ITERATIONS] 时接受当前结果。
pub fn optimal_correction(
    f: &Matrix3<f64>,
    x1: &Point2<f64>,
    x2: &Point2<f64>,
) -> Result<Correction, GeometryError> {
    let f0 = KANATANI_F0;
    // 齐次坐标写作 (x, y, f0)
    let scale = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 1.0 / f0));
    let fs = scale * f * scale;
    // 按行展开
    let u = SVector::<f64, 9>::from_iterator(fs.transpose().iter().copied());
    let proj = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0));

    let pt1 = Vector3::new(x1.x, x1.y, f0);
    let pt2 = Vector3::new(x2.x, x2.y, f0);
    let mut x_hat = pt1;
    let mut x1_hat = pt2;
    let mut x_tilde = Vector3::zeros();
    let mut x1_tilde = Vector3::zeros();

    let (mut e, mut e0) = (1.0f64, 0.0f64);
    let mut iterations = 0;
    let mut converged = true;
    while (e - e0).abs() > KANATANI_TOLERANCE {
        if iterations >= KANATANI_MAX_ITERATIONS {
            converged = false;
            break;
        }
        iterations += 1;
        e0 = e;
        x_hat = pt1 - x_tilde;
        x1_hat = pt2 - x1_tilde;
        let (v, xi) = covariance_and_xi(&x_hat, &x1_hat, &x_tilde, &x1_tilde, f0);
        let den = u.dot(&(v * u));
        if den.abs() < DENOMINATOR_EPSILON {
            return Err(GeometryError::DegenerateDenominator(den));
        }
        let mult = u.dot(&xi) / den;
        x_tilde = proj * (fs * x1_hat) * mult;
        x1_tilde = proj * (fs.transpose() * x_hat) * mult;
        e = x_tilde.x * x_tilde.x
            + x_tilde.y * x_tilde.y
            + x1_tilde.x * x1_tilde.x
            + x1_tilde.y * x1_tilde.y;
    }

    Ok(Correction {
        x1: Point2::new(x_hat.x, x_hat.y),
        x2: Point2::new(x1_hat.x, x1_hat.y),
        iterations,
        converged,
    })
}

/// getVandEpsil: 归一化协方差矩阵 V0 和修正后的 ξ*
#[inline]
fn covariance_and_xi(
    x_hat: &Vector3<f64>,
    x1_hat: &Vector3<f64>,
    x_tilde: &Vector3<f64>,
    x1_tilde: &Vector3<f64>,
    f: f64,
) -> (SMatrix<f64, 9, 9>, SVector<f64, 9>) {
    let (x, y) = (x_hat.x, x_hat.y);
    let (x1, y1) = (x1_hat.x, x1_hat.y);
    let (xt, yt) = (x_tilde.x, x_tilde.y);
    let (x1t, y1t) = (x1_tilde.x, x1_tilde.y);
    let (x2, y2, x12, y12) = (x * x, y * y, x1 * x1, y1 * y1);

    #[rustfmt::skip]
    let v = SMatrix::<f64, 9, 9>::from_row_slice(&[
        x2 + x12, x1 * y1,  f * x1, x * y,    0.0,      0.0,    f * x, 0.0,   0.0,
        x1 * y1,  x2 + y12, f * y1, 0.0,      x * y,    0.0,    0.0,   f * x, 0.0,
        f * x1,   f * y1,   f * f,  0.0,      0.0,      0.0,    0.0,   0.0,   0.0,
        x * y,    0.0,      0.0,    y2 + x12, x1 * y1,  f * x1, f * y, 0.0,   0.0,
        0.0,      x * y,    0.0,    x1 * y1,  y2 + y12, f * y1, 0.0,   f * y, 0.0,
        0.0,      0.0,      0.0,    f * x1,   f * y1,   f * f,  0.0,   0.0,   0.0,
        f * x,    0.0,      0.0,    f * y,    0.0,      0.0,    f * f, 0.0,   0.0,
        0.0,      f * x,    0.0,    0.0,      f * y,    0.0,    0.0,   f * f, 0.0,
        0.0,      0.0,      0.0,    0.0,      0.0,      0.0,    0.0,   0.0,   0.0,
    ]);
    let xi = SVector::<f64, 9>::from_column_slice(&[
        x * x1 + x1 * xt + x * x1t,
        x * y1 + y1 * xt + x * y1t,
        (x + xt) * f,
        y * x1 + x1 * yt + y * x1t,
        y * y1 + y1 * yt + y * y1t,
        (y + yt) * f,
        (x1 + x1t) * f,
        (y1 + y1t) * f,
        f * f,
    ]);
    (v, xi)
}
