use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2};

/// getFundamentalMatrix
///
/// 由两个投影矩阵直接构造基础矩阵（子式行列式），满足 `x1^T F x2 = 0`：
/// `F[i][j] = (-1)^(i+j) det([P1 去掉第 i 行; P2 去掉第 j 行])`
pub fn fundamental_from_projections(p1: &Matrix3x4<f64>, p2: &Matrix3x4<f64>) -> Matrix3<f64> {
    let mut f = Matrix3::zeros();
    for i in 0..3 {
        for j in 0..3 {
            let mut m = Matrix4::zeros();
            let mut r = 0;
            for k in (0..3).filter(|&k| k != i) {
                m.set_row(r, &p1.row(k));
                r += 1;
            }
            for k in (0..3).filter(|&k| k != j) {
                m.set_row(r, &p2.row(k));
                r += 1;
            }
            let sign = if (i + j) % 2 == 0 { 1.0 } else { -1.0 };
            f[(i, j)] = sign * m.determinant();
        }
    }
    f
}

/// `x1^T F x2`
pub fn epipolar_residual(f: &Matrix3<f64>, x1: &Point2<f64>, x2: &Point2<f64>) -> f64 {
    x1.to_homogeneous().dot(&(f * x2.to_homogeneous()))
}
