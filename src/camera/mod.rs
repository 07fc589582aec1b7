//! Camera projection models used by the reprojection factors.
//!
//! A camera is described by a [`CameraGeometry`] (camera index, image
//! [`Resolution`] and [`ProjectionKind`]) plus an 8-element parameter vector
//! `[fx, fy, cx, cy, d0, d1, d2, d3]` that lives in the factor graph as an
//! optimizable block. The projection itself is pinhole followed by one of the
//! lens distortion models in [`rad_tan`] or [`equidistant`].

use nalgebra::{DVector, Matrix2, Matrix2x3, Matrix2x4, SMatrix, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};

pub mod equidistant;
pub mod pinhole;
pub mod rad_tan;

pub use equidistant::Equi4;
pub use rad_tan::RadTan4;

/// Number of camera parameters: 4 projection + 4 distortion.
pub const CAMERA_PARAMS_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Reads the projection part of a camera parameter vector.
    pub fn from_params(params: &DVector<f64>) -> Self {
        Intrinsics {
            fx: params[0],
            fy: params[1],
            cx: params[2],
            cy: params[3],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether a pixel lies inside `[0, width) x [0, height)`.
    pub fn contains(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.x < self.width as f64
            && pixel.y >= 0.0
            && pixel.y < self.height as f64
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraModelError {
    #[error("Projection is outside the image")]
    ProjectionOutSideImage,
    #[error("z is close to zero, point is at or behind the camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Unknown camera model: {0}")]
    UnknownModel(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
}

/// Pixel prediction together with its Jacobian w.r.t. the camera-frame point.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub pixel: Vector2<f64>,
    pub point_jacobian: Matrix2x3<f64>,
}

/// Lens distortion acting on normalized image coordinates.
pub trait DistortionModel {
    /// Distorts a normalized point.
    fn distort(&self, dist: &Vector4<f64>, p: &Vector2<f64>) -> Vector2<f64>;

    /// Jacobian of [`DistortionModel::distort`] w.r.t. the normalized point.
    fn point_jacobian(&self, dist: &Vector4<f64>, p: &Vector2<f64>) -> Matrix2<f64>;

    /// Jacobian of [`DistortionModel::distort`] w.r.t. the distortion coefficients.
    fn params_jacobian(&self, dist: &Vector4<f64>, p: &Vector2<f64>) -> Matrix2x4<f64>;

    /// Inverts [`DistortionModel::distort`].
    fn undistort(&self, dist: &Vector4<f64>, p: &Vector2<f64>)
        -> Result<Vector2<f64>, CameraModelError>;
}

/// Pluggable camera projection used by the reprojection factors.
pub trait ProjectionModel {
    /// Projects a camera-frame point, failing when it is behind the camera or
    /// lands outside the image.
    fn project(
        &self,
        params: &DVector<f64>,
        point_3d: &Vector3<f64>,
    ) -> Result<Projection, CameraModelError>;

    /// 2x8 Jacobian of the pixel w.r.t. the camera parameters.
    fn params_jacobian(
        &self,
        params: &DVector<f64>,
        point_3d: &Vector3<f64>,
    ) -> SMatrix<f64, 2, CAMERA_PARAMS_SIZE>;

    /// Back-projects a pixel to a ray `[x, y, 1]` in the camera frame.
    fn back_project(
        &self,
        params: &DVector<f64>,
        pixel: &Vector2<f64>,
    ) -> Result<Vector3<f64>, CameraModelError>;
}

/// Supported projection/distortion combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionKind {
    PinholeRadtan4,
    PinholeEqui4,
}

impl ProjectionKind {
    /// Resolves the `proj_model` / `dist_model` pair used in configuration files.
    pub fn from_names(proj_model: &str, dist_model: &str) -> Result<Self, CameraModelError> {
        match (proj_model, dist_model) {
            ("pinhole", "radtan4") => Ok(ProjectionKind::PinholeRadtan4),
            ("pinhole", "equi4") => Ok(ProjectionKind::PinholeEqui4),
            _ => Err(CameraModelError::UnknownModel(format!(
                "{proj_model}-{dist_model}"
            ))),
        }
    }
}

/// Static description of a camera: everything except its optimizable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraGeometry {
    pub cam_index: usize,
    pub resolution: Resolution,
    pub kind: ProjectionKind,
}

impl CameraGeometry {
    pub fn new(cam_index: usize, resolution: Resolution, kind: ProjectionKind) -> Self {
        CameraGeometry {
            cam_index,
            resolution,
            kind,
        }
    }
}

impl ProjectionModel for CameraGeometry {
    fn project(
        &self,
        params: &DVector<f64>,
        point_3d: &Vector3<f64>,
    ) -> Result<Projection, CameraModelError> {
        match self.kind {
            ProjectionKind::PinholeRadtan4 => {
                pinhole::project(&RadTan4, params, &self.resolution, point_3d)
            }
            ProjectionKind::PinholeEqui4 => {
                pinhole::project(&Equi4, params, &self.resolution, point_3d)
            }
        }
    }

    fn params_jacobian(
        &self,
        params: &DVector<f64>,
        point_3d: &Vector3<f64>,
    ) -> SMatrix<f64, 2, CAMERA_PARAMS_SIZE> {
        match self.kind {
            ProjectionKind::PinholeRadtan4 => pinhole::params_jacobian(&RadTan4, params, point_3d),
            ProjectionKind::PinholeEqui4 => pinhole::params_jacobian(&Equi4, params, point_3d),
        }
    }

    fn back_project(
        &self,
        params: &DVector<f64>,
        pixel: &Vector2<f64>,
    ) -> Result<Vector3<f64>, CameraModelError> {
        match self.kind {
            ProjectionKind::PinholeRadtan4 => pinhole::back_project(&RadTan4, params, pixel),
            ProjectionKind::PinholeEqui4 => pinhole::back_project(&Equi4, params, pixel),
        }
    }
}

/// Focal length of a pinhole camera with the given image size and field of view.
pub fn pinhole_focal(image_size: u32, fov_deg: f64) -> f64 {
    (image_size as f64 / 2.0) / (fov_deg.to_radians() / 2.0).tan()
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    /// Checks the size and projection part of a camera parameter vector.
    pub fn validate_params(params: &DVector<f64>) -> Result<(), CameraModelError> {
        if params.len() != CAMERA_PARAMS_SIZE {
            return Err(CameraModelError::InvalidParams(format!(
                "expected {} camera parameters, got {}",
                CAMERA_PARAMS_SIZE,
                params.len()
            )));
        }
        validate_intrinsics(&Intrinsics::from_params(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_kind_from_names() {
        assert_eq!(
            ProjectionKind::from_names("pinhole", "radtan4").unwrap(),
            ProjectionKind::PinholeRadtan4
        );
        assert_eq!(
            ProjectionKind::from_names("pinhole", "equi4").unwrap(),
            ProjectionKind::PinholeEqui4
        );
        assert!(matches!(
            ProjectionKind::from_names("omni", "radtan4"),
            Err(CameraModelError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_pinhole_focal() {
        // 90 degree field of view puts the image edge at one focal length.
        assert!((pinhole_focal(640, 90.0) - 320.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_params() {
        let good = DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(validation::validate_params(&good).is_ok());

        let mut bad = good.clone();
        bad[1] = -1.0;
        assert_eq!(
            validation::validate_params(&bad),
            Err(CameraModelError::FocalLengthMustBePositive)
        );

        let short = DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0]);
        assert!(matches!(
            validation::validate_params(&short),
            Err(CameraModelError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_resolution_contains() {
        let res = Resolution {
            width: 640,
            height: 480,
        };
        assert!(res.contains(&Vector2::new(0.0, 0.0)));
        assert!(res.contains(&Vector2::new(639.9, 479.9)));
        assert!(!res.contains(&Vector2::new(640.0, 10.0)));
        assert!(!res.contains(&Vector2::new(10.0, -0.1)));
    }
}
