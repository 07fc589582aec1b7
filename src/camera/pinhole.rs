//! Pinhole projection composed with a lens distortion model.
//!
//! A camera-frame point `p_C = (X, Y, Z)` is mapped to normalized coordinates
//! `(X/Z, Y/Z)`, distorted by a [`DistortionModel`] and finally scaled and
//! shifted by the intrinsics: `u = fx * x_d + cx`, `v = fy * y_d + cy`.
//!
//! The parameter vector is `[fx, fy, cx, cy, d0, d1, d2, d3]`.

use crate::camera::{
    CameraModelError, DistortionModel, Intrinsics, Projection, Resolution, CAMERA_PARAMS_SIZE,
};
use nalgebra::{DVector, Matrix2, Matrix2x3, Matrix2x4, SMatrix, Vector2, Vector3, Vector4};

/// Distortion coefficients of a camera parameter vector.
pub fn distortion(params: &DVector<f64>) -> Vector4<f64> {
    Vector4::new(params[4], params[5], params[6], params[7])
}

/// Jacobian of the pixel w.r.t. the distorted normalized point.
fn point_scale(intrinsics: &Intrinsics) -> Matrix2<f64> {
    Matrix2::new(intrinsics.fx, 0.0, 0.0, intrinsics.fy)
}

/// Projects a camera-frame point to pixel coordinates.
///
/// # Errors
///
/// * [`CameraModelError::PointAtCameraCenter`]: if `Z` is below `sqrt(f64::EPSILON)`.
/// * [`CameraModelError::ProjectionOutSideImage`]: if the pixel falls outside `resolution`.
pub fn project<D: DistortionModel>(
    model: &D,
    params: &DVector<f64>,
    resolution: &Resolution,
    point_3d: &Vector3<f64>,
) -> Result<Projection, CameraModelError> {
    if point_3d.z < f64::EPSILON.sqrt() {
        return Err(CameraModelError::PointAtCameraCenter);
    }

    let intrinsics = Intrinsics::from_params(params);
    let dist = distortion(params);
    let x = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
    let x_dist = model.distort(&dist, &x);
    let pixel = Vector2::new(
        intrinsics.fx * x_dist.x + intrinsics.cx,
        intrinsics.fy * x_dist.y + intrinsics.cy,
    );
    if !resolution.contains(&pixel) {
        return Err(CameraModelError::ProjectionOutSideImage);
    }

    let z = point_3d.z;
    let z2 = z * z;
    let j_normalize = Matrix2x3::new(
        1.0 / z,
        0.0,
        -point_3d.x / z2,
        0.0,
        1.0 / z,
        -point_3d.y / z2,
    );
    let point_jacobian = point_scale(&intrinsics) * model.point_jacobian(&dist, &x) * j_normalize;

    Ok(Projection {
        pixel,
        point_jacobian,
    })
}

/// Jacobian of the projected pixel w.r.t. `[fx, fy, cx, cy, d0, d1, d2, d3]`.
pub fn params_jacobian<D: DistortionModel>(
    model: &D,
    params: &DVector<f64>,
    point_3d: &Vector3<f64>,
) -> SMatrix<f64, 2, CAMERA_PARAMS_SIZE> {
    let intrinsics = Intrinsics::from_params(params);
    let dist = distortion(params);
    let x = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
    let x_dist = model.distort(&dist, &x);

    let j_proj = Matrix2x4::new(x_dist.x, 0.0, 1.0, 0.0, 0.0, x_dist.y, 0.0, 1.0);
    let j_dist = point_scale(&intrinsics) * model.params_jacobian(&dist, &x);

    let mut jacobian = SMatrix::<f64, 2, CAMERA_PARAMS_SIZE>::zeros();
    jacobian.fixed_view_mut::<2, 4>(0, 0).copy_from(&j_proj);
    jacobian.fixed_view_mut::<2, 4>(0, 4).copy_from(&j_dist);
    jacobian
}

/// Back-projects a pixel to the ray `[x, y, 1]` through the undistorted point.
pub fn back_project<D: DistortionModel>(
    model: &D,
    params: &DVector<f64>,
    pixel: &Vector2<f64>,
) -> Result<Vector3<f64>, CameraModelError> {
    let intrinsics = Intrinsics::from_params(params);
    let x_dist = Vector2::new(
        (pixel.x - intrinsics.cx) / intrinsics.fx,
        (pixel.y - intrinsics.cy) / intrinsics.fy,
    );
    let x = model.undistort(&distortion(params), &x_dist)?;
    Ok(Vector3::new(x.x, x.y, 1.0))
}
