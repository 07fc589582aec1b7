//! Implements the four-coefficient Radial-Tangential (radtan4) distortion model.
//!
//! The coefficients are `[k1, k2, p1, p2]`: two radial terms and two tangential
//! terms. For a normalized point `(x, y)` with `r² = x² + y²`:
//!
//! ```text
//! x' = x (1 + k1 r² + k2 r⁴) + 2 p1 x y + p2 (r² + 2 x²)
//! y' = y (1 + k1 r² + k2 r⁴) + p1 (r² + 2 y²) + 2 p2 x y
//! ```

use crate::camera::{CameraModelError, DistortionModel};
use nalgebra::{Matrix2, Matrix2x4, Vector2, Vector4};

/// Maximum Gauss-Newton iterations used by [`RadTan4::undistort`](DistortionModel::undistort).
const UNDISTORT_MAX_ITER: usize = 20;

/// Radial-tangential distortion with coefficients `[k1, k2, p1, p2]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RadTan4;

impl DistortionModel for RadTan4 {
    fn distort(&self, dist: &Vector4<f64>, p: &Vector2<f64>) -> Vector2<f64> {
        let (k1, k2, p1, p2) = (dist[0], dist[1], dist[2], dist[3]);
        let (x, y) = (p.x, p.y);

        let x2 = x * x;
        let y2 = y * y;
        let xy = x * y;
        let r2 = x2 + y2;
        let r4 = r2 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4;

        Vector2::new(
            x * radial + 2.0 * p1 * xy + p2 * (r2 + 2.0 * x2),
            y * radial + p1 * (r2 + 2.0 * y2) + 2.0 * p2 * xy,
        )
    }

    fn point_jacobian(&self, dist: &Vector4<f64>, p: &Vector2<f64>) -> Matrix2<f64> {
        let (k1, k2, p1, p2) = (dist[0], dist[1], dist[2], dist[3]);
        let (x, y) = (p.x, p.y);

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let radial = k1 * r2 + k2 * r4;

        let j00 = radial + 2.0 * p1 * y + 6.0 * p2 * x + x * (2.0 * k1 * x + 4.0 * k2 * x * r2) + 1.0;
        let j10 = 2.0 * p1 * x + 2.0 * p2 * y + y * (2.0 * k1 * x + 4.0 * k2 * x * r2);
        let j11 = radial + 6.0 * p1 * y + 2.0 * p2 * x + y * (2.0 * k1 * y + 4.0 * k2 * y * r2) + 1.0;

        // The cross terms are symmetric.
        Matrix2::new(j00, j10, j10, j11)
    }

    fn params_jacobian(&self, _dist: &Vector4<f64>, p: &Vector2<f64>) -> Matrix2x4<f64> {
        let (x, y) = (p.x, p.y);
        let x2 = x * x;
        let y2 = y * y;
        let xy = x * y;
        let r2 = x2 + y2;
        let r4 = r2 * r2;

        Matrix2x4::new(
            x * r2,
            x * r4,
            2.0 * xy,
            3.0 * x2 + y2,
            y * r2,
            y * r4,
            x2 + 3.0 * y2,
            2.0 * xy,
        )
    }

    /// Inverts the distortion with Gauss-Newton iterations seeded at the distorted point.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::NumericalError`] if the distortion Jacobian becomes singular.
    fn undistort(
        &self,
        dist: &Vector4<f64>,
        p: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        let mut undistorted = *p;
        for _ in 0..UNDISTORT_MAX_ITER {
            let error = p - self.distort(dist, &undistorted);
            if error.norm_squared() < 1e-15 {
                break;
            }
            let jacobian = self.point_jacobian(dist, &undistorted);
            let inv_jacobian = jacobian.try_inverse().ok_or_else(|| {
                CameraModelError::NumericalError("Jacobian is singular".to_string())
            })?;
            undistorted += inv_jacobian * error;
        }
        Ok(undistorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn coefficients() -> Vector4<f64> {
        Vector4::new(-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05)
    }

    /// Zero coefficients leave the point untouched.
    #[test]
    fn test_radtan4_identity() {
        let p = Vector2::new(0.3, -0.2);
        assert_relative_eq!(RadTan4.distort(&Vector4::zeros(), &p), p);
        assert_relative_eq!(
            RadTan4.point_jacobian(&Vector4::zeros(), &p),
            Matrix2::identity()
        );
    }

    #[test]
    fn test_radtan4_point_jacobian() {
        let dist = coefficients();
        let p = Vector2::new(0.3, -0.2);
        let step = 1e-7;
        let mut numerical = Matrix2::zeros();
        for i in 0..2 {
            let mut plus = p;
            let mut minus = p;
            plus[i] += step;
            minus[i] -= step;
            numerical.set_column(
                i,
                &((RadTan4.distort(&dist, &plus) - RadTan4.distort(&dist, &minus)) / (2.0 * step)),
            );
        }
        assert_relative_eq!(RadTan4.point_jacobian(&dist, &p), numerical, epsilon = 1e-6);
    }

    #[test]
    fn test_radtan4_undistort() {
        let dist = coefficients();
        let p = Vector2::new(0.25, 0.1);
        let distorted = RadTan4.distort(&dist, &p);
        let undistorted = RadTan4.undistort(&dist, &distorted).unwrap();
        assert_relative_eq!(undistorted, p, epsilon = 1e-7);
    }
}
