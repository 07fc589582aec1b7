//! Measurement factors: residuals and Jacobians over ordered parameter blocks.
//!
//! Every factor evaluates `residual = sqrt_info * (measured - predicted)` and
//! one Jacobian per parameter block, taken w.r.t. that block's local
//! perturbation (see [`ParameterBlock::perturb`](crate::estimation::ParameterBlock::perturb)).
//!
//! Reprojection factors absorb projection failures: a point behind the camera
//! or outside the image yields a zero residual and zero Jacobians, so the
//! measurement stays in the graph without influencing that iteration.

use log::trace;
use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, Vector2, Vector3};

use crate::camera::{CameraGeometry, ProjectionModel, CAMERA_PARAMS_SIZE};
use crate::estimation::imu::{ImuPreintegration, IMU_RESIDUAL_SIZE};
use crate::estimation::param::SPEED_BIAS_SIZE;
use crate::estimation::{EstimationError, Id};
use crate::geometry::{pose_rotation, pose_translation, skew, POSE_SIZE};

/// The closed set of factor kinds, each carrying its measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorKind {
    /// Prior on a pose or extrinsic block: `[pose]`.
    PosePrior { pose: DVector<f64> },
    /// Prior on a landmark: `[landmark]`.
    LandmarkPrior { landmark: Vector3<f64> },
    /// Prior on camera parameters: `[camera]`.
    CameraParamsPrior { params: DVector<f64> },
    /// Prior on a speed/bias block: `[speed_bias]`.
    SpeedBiasPrior { speed_bias: DVector<f64> },
    /// Reprojection of a world landmark: `[T_WC, p_W, camera]`.
    BundleAdjustment {
        z: Vector2<f64>,
        camera: CameraGeometry,
    },
    /// Reprojection of a fixed calibration-target point `r_FFi`: `[T_WF, T_WC, camera]`.
    CalibMono {
        z: Vector2<f64>,
        target_point: Vector3<f64>,
        camera: CameraGeometry,
    },
    /// Reprojection through a body pose and a body-camera extrinsic:
    /// `[T_WS, T_SC, p_W, camera]`.
    Vision {
        z: Vector2<f64>,
        camera: CameraGeometry,
    },
    /// Preintegrated IMU constraint: `[pose_i, sb_i, pose_j, sb_j]`.
    Imu(Box<ImuPreintegration>),
}

impl FactorKind {
    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::PosePrior { .. } => 6,
            FactorKind::LandmarkPrior { .. } => 3,
            FactorKind::CameraParamsPrior { .. } => CAMERA_PARAMS_SIZE,
            FactorKind::SpeedBiasPrior { .. } => SPEED_BIAS_SIZE,
            FactorKind::BundleAdjustment { .. }
            | FactorKind::CalibMono { .. }
            | FactorKind::Vision { .. } => 2,
            FactorKind::Imu(_) => IMU_RESIDUAL_SIZE,
        }
    }

    /// Expected `(global_dim, local_dim)` of each parameter block, in order.
    pub fn param_dims(&self) -> Vec<(usize, usize)> {
        const POSE: (usize, usize) = (POSE_SIZE, 6);
        const LANDMARK: (usize, usize) = (3, 3);
        const CAMERA: (usize, usize) = (CAMERA_PARAMS_SIZE, CAMERA_PARAMS_SIZE);
        const SPEED_BIAS: (usize, usize) = (SPEED_BIAS_SIZE, SPEED_BIAS_SIZE);
        match self {
            FactorKind::PosePrior { .. } => vec![POSE],
            FactorKind::LandmarkPrior { .. } => vec![LANDMARK],
            FactorKind::CameraParamsPrior { .. } => vec![CAMERA],
            FactorKind::SpeedBiasPrior { .. } => vec![SPEED_BIAS],
            FactorKind::BundleAdjustment { .. } => vec![POSE, LANDMARK, CAMERA],
            FactorKind::CalibMono { .. } => vec![POSE, POSE, CAMERA],
            FactorKind::Vision { .. } => vec![POSE, POSE, LANDMARK, CAMERA],
            FactorKind::Imu(_) => vec![POSE, SPEED_BIAS, POSE, SPEED_BIAS],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FactorKind::PosePrior { .. } => "pose_prior",
            FactorKind::LandmarkPrior { .. } => "landmark_prior",
            FactorKind::CameraParamsPrior { .. } => "camera_params_prior",
            FactorKind::SpeedBiasPrior { .. } => "speed_bias_prior",
            FactorKind::BundleAdjustment { .. } => "ba",
            FactorKind::CalibMono { .. } => "calib_mono",
            FactorKind::Vision { .. } => "vision",
            FactorKind::Imu(_) => "imu",
        }
    }
}

/// A measurement constraint over an ordered list of parameter block ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    id: Id,
    timestamp: u64,
    kind: FactorKind,
    param_ids: Vec<Id>,
    information: DMatrix<f64>,
    sqrt_information: DMatrix<f64>,
    residual: DVector<f64>,
    jacobians: Vec<DMatrix<f64>>,
    marginalize: bool,
}

/// Unweighted `(error, jacobians)` of one evaluation.
type RawEvaluation = (DVector<f64>, Vec<DMatrix<f64>>);

impl Factor {
    /// Creates a factor with measurement covariance `covariance`.
    ///
    /// The information matrix is `covariance⁻¹` and the square-root
    /// information the transposed Cholesky factor of it.
    pub fn new(
        id: Id,
        timestamp: u64,
        kind: FactorKind,
        param_ids: Vec<Id>,
        covariance: &DMatrix<f64>,
    ) -> Result<Self, EstimationError> {
        let residual_dim = kind.residual_dim();
        let expected_params = kind.param_dims().len();
        if param_ids.len() != expected_params {
            return Err(EstimationError::DimensionMismatch {
                what: format!("{} parameter count", kind.name()),
                expected: expected_params,
                actual: param_ids.len(),
            });
        }
        if covariance.nrows() != residual_dim || covariance.ncols() != residual_dim {
            return Err(EstimationError::DimensionMismatch {
                what: format!("{} covariance", kind.name()),
                expected: residual_dim,
                actual: covariance.nrows(),
            });
        }

        let information = covariance
            .clone()
            .cholesky()
            .ok_or_else(|| EstimationError::InvalidCovariance(kind.name().to_string()))?
            .inverse();
        let sqrt_information = information
            .clone()
            .cholesky()
            .ok_or_else(|| EstimationError::InvalidCovariance(kind.name().to_string()))?
            .l()
            .transpose();

        let jacobians = kind
            .param_dims()
            .iter()
            .map(|&(_, local)| DMatrix::zeros(residual_dim, local))
            .collect();

        Ok(Factor {
            id,
            timestamp,
            kind,
            param_ids,
            information,
            sqrt_information,
            residual: DVector::zeros(residual_dim),
            jacobians,
            marginalize: false,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn kind(&self) -> &FactorKind {
        &self.kind
    }

    pub fn param_ids(&self) -> &[Id] {
        &self.param_ids
    }

    pub fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    pub fn sqrt_information(&self) -> &DMatrix<f64> {
        &self.sqrt_information
    }

    /// Residual of the last evaluation.
    pub fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    /// Jacobians of the last evaluation, one per parameter block.
    pub fn jacobians(&self) -> &[DMatrix<f64>] {
        &self.jacobians
    }

    pub fn is_marginalized(&self) -> bool {
        self.marginalize
    }

    pub fn residual_dim(&self) -> usize {
        self.kind.residual_dim()
    }

    pub(crate) fn mark_marginalize(&mut self) {
        self.marginalize = true;
    }

    /// `0.5 * |residual|²` of the last evaluation.
    pub fn cost(&self) -> f64 {
        0.5 * self.residual.norm_squared()
    }

    /// Evaluates the factor at `values` (one vector per parameter id, in order)
    /// and stores the whitened residual and Jacobians.
    pub fn eval(
        &mut self,
        values: &[&DVector<f64>],
    ) -> Result<(&DVector<f64>, &[DMatrix<f64>]), EstimationError> {
        let (residual, jacobians) = self.evaluate(values)?;
        self.residual = residual;
        self.jacobians = jacobians;
        Ok((&self.residual, &self.jacobians))
    }

    /// Whitened residual and Jacobians at `values`, leaving the factor untouched.
    pub fn evaluate(&self, values: &[&DVector<f64>]) -> Result<RawEvaluation, EstimationError> {
        self.check_values(values)?;
        let (error, jacobians) = match &self.kind {
            FactorKind::PosePrior { pose } => pose_prior(pose, values[0]),
            FactorKind::LandmarkPrior { landmark } => {
                let measured = DVector::from_column_slice(landmark.as_slice());
                vector_prior(&measured, values[0])
            }
            FactorKind::CameraParamsPrior { params } => vector_prior(params, values[0]),
            FactorKind::SpeedBiasPrior { speed_bias } => vector_prior(speed_bias, values[0]),
            FactorKind::BundleAdjustment { z, camera } => {
                bundle_adjustment(z, camera, values[0], values[1], values[2])
            }
            FactorKind::CalibMono {
                z,
                target_point,
                camera,
            } => calib_mono(z, target_point, camera, values[0], values[1], values[2]),
            FactorKind::Vision { z, camera } => {
                vision(z, camera, values[0], values[1], values[2], values[3])
            }
            FactorKind::Imu(preint) => {
                let (error, jacobians) =
                    preint.evaluate(values[0], values[1], values[2], values[3]);
                (
                    DVector::from_column_slice(error.as_slice()),
                    jacobians.to_vec(),
                )
            }
        };

        let residual = &self.sqrt_information * error;
        let jacobians = jacobians
            .iter()
            .map(|jacobian| &self.sqrt_information * jacobian)
            .collect();
        Ok((residual, jacobians))
    }

    fn check_values(&self, values: &[&DVector<f64>]) -> Result<(), EstimationError> {
        let dims = self.kind.param_dims();
        if values.len() != dims.len() {
            return Err(EstimationError::DimensionMismatch {
                what: format!("{} values", self.kind.name()),
                expected: dims.len(),
                actual: values.len(),
            });
        }
        for (value, &(global, _)) in values.iter().zip(&dims) {
            if value.len() != global {
                return Err(EstimationError::DimensionMismatch {
                    what: format!("{} parameter", self.kind.name()),
                    expected: global,
                    actual: value.len(),
                });
            }
        }
        Ok(())
    }
}

fn pose_prior(measured: &DVector<f64>, estimate: &DVector<f64>) -> RawEvaluation {
    let dq = pose_rotation(measured) * pose_rotation(estimate).inverse();
    let dr = pose_translation(measured) - pose_translation(estimate);

    let mut error = DVector::zeros(6);
    error.fixed_rows_mut::<3>(0).copy_from(&(2.0 * dq.imag()));
    error.fixed_rows_mut::<3>(3).copy_from(&dr);

    let dq_mul_xyz = Matrix3::identity() * dq.w + skew(&dq.imag());
    let mut jacobian = DMatrix::zeros(6, 6);
    jacobian.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-dq_mul_xyz));
    jacobian
        .fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(-Matrix3::identity()));
    (error, vec![jacobian])
}

fn vector_prior(measured: &DVector<f64>, estimate: &DVector<f64>) -> RawEvaluation {
    let n = estimate.len();
    (measured - estimate, vec![-DMatrix::identity(n, n)])
}

/// Zero residual and Jacobians for a failed projection.
fn projection_failure(local_dims: &[usize]) -> RawEvaluation {
    let jacobians = local_dims.iter().map(|&n| DMatrix::zeros(2, n)).collect();
    (DVector::zeros(2), jacobians)
}

fn copy_rot_trans(rotation: &Matrix2x3<f64>, translation: &Matrix2x3<f64>) -> DMatrix<f64> {
    let mut jacobian = DMatrix::zeros(2, 6);
    jacobian.fixed_view_mut::<2, 3>(0, 0).copy_from(rotation);
    jacobian.fixed_view_mut::<2, 3>(0, 3).copy_from(translation);
    jacobian
}

fn camera_jacobian(camera: &CameraGeometry, params: &DVector<f64>, p_c: &Vector3<f64>) -> DMatrix<f64> {
    let j_params = camera.params_jacobian(params, p_c);
    DMatrix::from_column_slice(2, CAMERA_PARAMS_SIZE, (-j_params).as_slice())
}

fn bundle_adjustment(
    z: &Vector2<f64>,
    camera: &CameraGeometry,
    pose: &DVector<f64>,
    landmark: &DVector<f64>,
    params: &DVector<f64>,
) -> RawEvaluation {
    let c_wc = pose_rotation(pose).to_rotation_matrix().into_inner();
    let r_wc = pose_translation(pose);
    let c_cw = c_wc.transpose();
    let p_w = Vector3::new(landmark[0], landmark[1], landmark[2]);
    let p_c = c_cw * (p_w - r_wc);

    let projection = match camera.project(params, &p_c) {
        Ok(projection) => projection,
        Err(err) => {
            trace!("ba projection failed: {err}");
            return projection_failure(&[6, 3, CAMERA_PARAMS_SIZE]);
        }
    };
    let j_h = projection.point_jacobian;

    let j_pose = copy_rot_trans(&(-j_h * c_cw * skew(&(p_w - r_wc))), &(j_h * c_cw));
    let j_landmark = -j_h * c_cw;
    let j_landmark = DMatrix::from_column_slice(2, 3, j_landmark.as_slice());

    (
        DVector::from_column_slice((z - projection.pixel).as_slice()),
        vec![j_pose, j_landmark, camera_jacobian(camera, params, &p_c)],
    )
}

fn calib_mono(
    z: &Vector2<f64>,
    target_point: &Vector3<f64>,
    camera: &CameraGeometry,
    fiducial: &DVector<f64>,
    pose: &DVector<f64>,
    params: &DVector<f64>,
) -> RawEvaluation {
    let c_wf = pose_rotation(fiducial).to_rotation_matrix().into_inner();
    let r_wf = pose_translation(fiducial);
    let c_wc = pose_rotation(pose).to_rotation_matrix().into_inner();
    let r_wc = pose_translation(pose);
    let c_cw = c_wc.transpose();

    let r_wfi = c_wf * target_point + r_wf;
    let p_c = c_cw * (r_wfi - r_wc);

    let projection = match camera.project(params, &p_c) {
        Ok(projection) => projection,
        Err(err) => {
            trace!("calib projection failed: {err}");
            return projection_failure(&[6, 6, CAMERA_PARAMS_SIZE]);
        }
    };
    let j_h = projection.point_jacobian;

    let j_fiducial = copy_rot_trans(
        &(j_h * c_cw * skew(&(c_wf * target_point))),
        &(-j_h * c_cw),
    );
    let j_pose = copy_rot_trans(&(-j_h * c_cw * skew(&(r_wfi - r_wc))), &(j_h * c_cw));

    (
        DVector::from_column_slice((z - projection.pixel).as_slice()),
        vec![j_fiducial, j_pose, camera_jacobian(camera, params, &p_c)],
    )
}

fn vision(
    z: &Vector2<f64>,
    camera: &CameraGeometry,
    body_pose: &DVector<f64>,
    extrinsic: &DVector<f64>,
    landmark: &DVector<f64>,
    params: &DVector<f64>,
) -> RawEvaluation {
    let c_ws = pose_rotation(body_pose).to_rotation_matrix().into_inner();
    let r_ws = pose_translation(body_pose);
    let c_sc = pose_rotation(extrinsic).to_rotation_matrix().into_inner();
    let r_sc = pose_translation(extrinsic);
    let c_sw = c_ws.transpose();
    let c_cs = c_sc.transpose();
    let c_cw = c_cs * c_sw;

    let p_w = Vector3::new(landmark[0], landmark[1], landmark[2]);
    let p_s = c_sw * (p_w - r_ws);
    let p_c = c_cs * (p_s - r_sc);

    let projection = match camera.project(params, &p_c) {
        Ok(projection) => projection,
        Err(err) => {
            trace!("vision projection failed: {err}");
            return projection_failure(&[6, 6, 3, CAMERA_PARAMS_SIZE]);
        }
    };
    let j_h = projection.point_jacobian;

    let j_body = copy_rot_trans(&(-j_h * c_cw * skew(&(p_w - r_ws))), &(j_h * c_cw));
    let j_extrinsic = copy_rot_trans(&(-j_h * c_cs * skew(&(p_s - r_sc))), &(j_h * c_cs));
    let j_landmark = -j_h * c_cw;
    let j_landmark = DMatrix::from_column_slice(2, 3, j_landmark.as_slice());

    (
        DVector::from_column_slice((z - projection.pixel).as_slice()),
        vec![
            j_body,
            j_extrinsic,
            j_landmark,
            camera_jacobian(camera, params, &p_c),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{ProjectionKind, Resolution};
    use crate::geometry::{pose_identity, pose_vector};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn camera() -> CameraGeometry {
        CameraGeometry::new(
            0,
            Resolution {
                width: 640,
                height: 480,
            },
            ProjectionKind::PinholeRadtan4,
        )
    }

    fn camera_params() -> DVector<f64> {
        DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0, 0.01, 0.001, 0.001, 0.001])
    }

    fn ba_factor(z: Vector2<f64>) -> Factor {
        Factor::new(
            0,
            0,
            FactorKind::BundleAdjustment { z, camera: camera() },
            vec![0, 1, 2],
            &DMatrix::identity(2, 2),
        )
        .unwrap()
    }

    /// A measurement equal to the prediction gives an exactly zero residual.
    #[test]
    fn test_ba_zero_residual() {
        let rotation = UnitQuaternion::from_euler_angles(0.1, -0.05, 0.2);
        let pose = pose_vector(&rotation, &Vector3::new(0.2, -0.1, 0.0));
        let landmark = DVector::from_vec(vec![0.3, 0.1, 4.0]);
        let params = camera_params();

        let p_c = rotation.inverse() * (Vector3::new(0.3, 0.1, 4.0) - Vector3::new(0.2, -0.1, 0.0));
        let z = camera().project(&params, &p_c).unwrap().pixel;

        let mut factor = ba_factor(z);
        let (residual, jacobians) = factor.eval(&[&pose, &landmark, &params]).unwrap();
        assert_relative_eq!(residual.norm(), 0.0, epsilon = 1e-12);
        assert_eq!(jacobians.len(), 3);
        assert!(jacobians[1].norm() > 0.0);
    }

    #[test]
    fn test_projection_failure_is_absorbed() {
        let pose = pose_identity();
        let behind = DVector::from_vec(vec![0.0, 0.0, -2.0]);
        let params = camera_params();

        let mut factor = ba_factor(Vector2::new(100.0, 100.0));
        let (residual, jacobians) = factor.eval(&[&pose, &behind, &params]).unwrap();
        assert_eq!(residual.norm(), 0.0);
        assert!(jacobians.iter().all(|j| j.norm() == 0.0));
        assert_eq!(jacobians[0].shape(), (2, 6));
        assert_eq!(jacobians[2].shape(), (2, CAMERA_PARAMS_SIZE));
    }

    #[test]
    fn test_sqrt_information_whitens() {
        let covariance = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 4.0, 4.0]));
        let mut factor = Factor::new(
            1,
            0,
            FactorKind::LandmarkPrior {
                landmark: Vector3::new(1.0, 2.0, 3.0),
            },
            vec![7],
            &covariance,
        )
        .unwrap();
        let estimate = DVector::from_vec(vec![0.0, 2.0, 3.0]);
        let (residual, jacobians) = factor.eval(&[&estimate]).unwrap();

        // sigma = 2, so a unit error whitens to 0.5.
        assert_relative_eq!(residual[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(jacobians[0][(0, 0)], -0.5, epsilon = 1e-12);
        assert_relative_eq!(
            factor.sqrt_information().transpose() * factor.sqrt_information(),
            factor.information().clone(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_pose_prior_at_measurement_is_zero() {
        let pose = pose_vector(
            &UnitQuaternion::from_euler_angles(0.3, 0.2, 0.1),
            &Vector3::new(1.0, 2.0, 3.0),
        );
        let mut factor = Factor::new(
            2,
            0,
            FactorKind::PosePrior { pose: pose.clone() },
            vec![0],
            &DMatrix::identity(6, 6),
        )
        .unwrap();
        let (residual, jacobians) = factor.eval(&[&pose]).unwrap();
        assert_relative_eq!(residual.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(jacobians[0].clone(), -DMatrix::identity(6, 6), epsilon = 1e-12);
    }

    #[test]
    fn test_factor_construction_checks() {
        let wrong_count = Factor::new(
            0,
            0,
            FactorKind::BundleAdjustment {
                z: Vector2::zeros(),
                camera: camera(),
            },
            vec![0, 1],
            &DMatrix::identity(2, 2),
        );
        assert!(matches!(
            wrong_count,
            Err(EstimationError::DimensionMismatch { expected: 3, actual: 2, .. })
        ));

        let singular = Factor::new(
            0,
            0,
            FactorKind::LandmarkPrior {
                landmark: Vector3::zeros(),
            },
            vec![0],
            &DMatrix::zeros(3, 3),
        );
        assert!(matches!(singular, Err(EstimationError::InvalidCovariance(_))));

        let factor = ba_factor(Vector2::zeros());
        let pose = pose_identity();
        let short = DVector::zeros(2);
        assert!(factor.evaluate(&[&pose, &short, &camera_params()]).is_err());
    }
}
