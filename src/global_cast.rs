//! 全局类型转换
//!
//! nalgebra 与 opencv [Mat] 之间的转换，PnP 求解时使用。
//!

use nalgebra::*;
use opencv::core::{Mat, CV_64F};
use opencv::prelude::*;
use std::fmt::Display;

/// 实现 Display trait 用于打印
pub struct MatPrinter<'a>(pub &'a Mat);

impl Display for MatPrinter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = self.0.rows();
        let cols = self.0.cols();
        writeln!(f)?;
        for i in 0..rows {
            for j in 0..cols {
                match self.0.at_2d::<f64>(i, j) {
                    Ok(v) => write!(f, "{}, ", v)?,
                    Err(_) => write!(f, "?, ")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Matrix3d(pub Matrix3<f64>);

/// 将 [Mat] 转换为 [Matrix3]
impl TryFrom<&Mat> for Matrix3d {
    type Error = opencv::Error;
    fn try_from(mat: &Mat) -> Result<Self, Self::Error> {
        if mat.rows() != 3 || mat.cols() != 3 {
            return Err(opencv::Error::new(
                opencv::core::StsBadSize,
                format!("expected 3x3 matrix, got {}x{}", mat.rows(), mat.cols()),
            ));
        }
        let mut matrix = Matrix3::<f64>::zeros();
        for i in 0..3 {
            for j in 0..3 {
                matrix[(i, j)] = *mat.at_2d::<f64>(i as i32, j as i32)?;
            }
        }
        Ok(Matrix3d(matrix))
    }
}

/// 将 [Matrix3] 转换为 [Mat]
impl TryFrom<Matrix3d> for Mat {
    type Error = opencv::Error;
    fn try_from(matrix: Matrix3d) -> Result<Self, Self::Error> {
        let mut mat = Mat::zeros_nd(&[3, 3], CV_64F)?.to_mat()?;
        for i in 0..3 {
            for j in 0..3 {
                *mat.at_2d_mut::<f64>(i as i32, j as i32)? = matrix.0[(i, j)];
            }
        }
        Ok(mat)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Vector3d(pub Vector3<f64>);

impl TryFrom<&Mat> for Vector3d {
    type Error = opencv::Error;
    fn try_from(mat: &Mat) -> Result<Self, Self::Error> {
        if mat.rows() * mat.cols() != 3 {
            return Err(opencv::Error::new(
                opencv::core::StsBadSize,
                format!("expected 3 elements, got {}x{}", mat.rows(), mat.cols()),
            ));
        }
        let mut vector = Vector3::<f64>::zeros();
        for i in 0..3 {
            vector[i] = *mat.at::<f64>(i as i32)?;
        }
        Ok(Vector3d(vector))
    }
}

impl TryFrom<Vector3d> for Mat {
    type Error = opencv::Error;
    fn try_from(vector: Vector3d) -> Result<Self, Self::Error> {
        let mut mat = Mat::zeros_nd(&[3, 1], CV_64F)?.to_mat()?;
        for i in 0..3 {
            *mat.at_2d_mut::<f64>(i as i32, 0)? = vector.0[i];
        }
        Ok(mat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mat_to_matrix() {
        let mat = Mat::from_slice_2d(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]).unwrap();
        let matrix = Matrix3d::try_from(&mat).unwrap();
        assert_eq!(matrix.0[(1, 2)], 6.0);

        let back: Mat = Matrix3d(matrix.0.transpose()).try_into().unwrap();
        assert_eq!(*back.at_2d::<f64>(2, 1).unwrap(), 6.0);
        println!("mat: {}", MatPrinter(&back));
    }

    #[test]
    fn test_mat_to_vector() {
        let vector = Vector3d(Vector3::new(1.0, -2.0, 0.5));
        let mat: Mat = vector.try_into().unwrap();
        let back = Vector3d::try_from(&mat).unwrap();
        assert_eq!(back.0, Vector3::new(1.0, -2.0, 0.5));

        let wrong = Mat::from_slice_2d(&[[1.0, 0.0], [0.0, 1.0]]).unwrap();
        assert!(Vector3d::try_from(&wrong).is_err());
    }
}
