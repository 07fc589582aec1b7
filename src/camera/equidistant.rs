//! Implements the four-coefficient equidistant (equi4, Kannala-Brandt) distortion model.
//!
//! For a normalized point with radius `r`, the incidence angle is `θ = atan(r)`
//! and the distorted angle
//!
//! ```text
//! θd = θ (1 + k1 θ² + k2 θ⁴ + k3 θ⁶ + k4 θ⁸)
//! ```
//!
//! The distorted point is the input scaled by `θd / r`.

use crate::camera::{CameraModelError, DistortionModel};
use nalgebra::{Matrix2, Matrix2x4, Vector2, Vector4};

/// Fixed-point iterations used to invert the angle polynomial.
const UNDISTORT_MAX_ITER: usize = 20;

/// Below this radius the model is treated as the identity.
const MIN_RADIUS: f64 = 1e-10;

/// Equidistant distortion with coefficients `[k1, k2, k3, k4]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Equi4;

fn distorted_angle(dist: &Vector4<f64>, theta: f64) -> f64 {
    let th2 = theta * theta;
    let th4 = th2 * th2;
    let th6 = th4 * th2;
    let th8 = th4 * th4;
    theta * (1.0 + dist[0] * th2 + dist[1] * th4 + dist[2] * th6 + dist[3] * th8)
}

impl DistortionModel for Equi4 {
    fn distort(&self, dist: &Vector4<f64>, p: &Vector2<f64>) -> Vector2<f64> {
        let r = p.norm();
        if r < MIN_RADIUS {
            return *p;
        }
        let thd = distorted_angle(dist, r.atan());
        p * (thd / r)
    }

    fn point_jacobian(&self, dist: &Vector4<f64>, p: &Vector2<f64>) -> Matrix2<f64> {
        let r = p.norm();
        if r < MIN_RADIUS {
            return Matrix2::identity();
        }
        let (k1, k2, k3, k4) = (dist[0], dist[1], dist[2], dist[3]);
        let (x, y) = (p.x, p.y);

        let th = r.atan();
        let th2 = th * th;
        let th4 = th2 * th2;
        let th6 = th4 * th2;
        let th8 = th4 * th4;
        let thd = distorted_angle(dist, th);

        let th_r = 1.0 / (r * r + 1.0);
        let thd_th = 1.0 + 3.0 * k1 * th2 + 5.0 * k2 * th4 + 7.0 * k3 * th6 + 9.0 * k4 * th8;
        let s = thd / r;
        let s_r = thd_th * th_r / r - thd / (r * r);
        let r_x = x / r;
        let r_y = y / r;

        Matrix2::new(
            s + x * s_r * r_x,
            x * s_r * r_y,
            y * s_r * r_x,
            s + y * s_r * r_y,
        )
    }

    fn params_jacobian(&self, _dist: &Vector4<f64>, p: &Vector2<f64>) -> Matrix2x4<f64> {
        let r = p.norm();
        if r < MIN_RADIUS {
            return Matrix2x4::zeros();
        }
        let th = r.atan();
        let th3 = th * th * th;
        let th5 = th3 * th * th;
        let th7 = th5 * th * th;
        let th9 = th7 * th * th;
        let x_r = p.x / r;
        let y_r = p.y / r;

        Matrix2x4::new(
            x_r * th3,
            x_r * th5,
            x_r * th7,
            x_r * th9,
            y_r * th3,
            y_r * th5,
            y_r * th7,
            y_r * th9,
        )
    }

    /// Inverts the angle polynomial by fixed-point iteration, then maps the
    /// undistorted angle back through `tan`.
    fn undistort(
        &self,
        dist: &Vector4<f64>,
        p: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        let thd = p.norm();
        if thd < MIN_RADIUS {
            return Ok(*p);
        }

        let mut th = thd;
        for _ in 0..UNDISTORT_MAX_ITER {
            let th2 = th * th;
            let th4 = th2 * th2;
            let th6 = th4 * th2;
            let th8 = th4 * th4;
            th = thd / (1.0 + dist[0] * th2 + dist[1] * th4 + dist[2] * th6 + dist[3] * th8);
        }
        if !th.is_finite() || th >= std::f64::consts::FRAC_PI_2 {
            return Err(CameraModelError::NumericalError(format!(
                "undistorted angle {th} is out of range"
            )));
        }

        Ok(p * (th.tan() / thd))
    }
}
