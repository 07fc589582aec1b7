//! Optimizable parameter blocks and their manifold-aware perturbation.

use std::collections::BTreeSet;

use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::{CameraGeometry, CAMERA_PARAMS_SIZE};
use crate::estimation::{EstimationError, Id};
use crate::geometry::{pose_rotation, pose_translation, pose_vector, quat_delta, POSE_SIZE};

/// Size of a speed/bias block: velocity, accelerometer bias, gyroscope bias.
pub const SPEED_BIAS_SIZE: usize = 9;

/// The closed set of parameter kinds.
///
/// | kind | global | local | layout |
/// |---|---|---|---|
/// | `Pose`, `Extrinsic` | 7 | 6 | `[qw qx qy qz x y z]` |
/// | `Landmark` | 3 | 3 | `[x y z]` |
/// | `CameraParams` | 8 | 8 | `[fx fy cx cy d0 d1 d2 d3]` |
/// | `SpeedBias` | 9 | 9 | `[v ba bg]` |
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamKind {
    Pose,
    Landmark,
    CameraParams(CameraGeometry),
    SpeedBias,
    Extrinsic,
}

impl ParamKind {
    pub fn global_dim(&self) -> usize {
        match self {
            ParamKind::Pose | ParamKind::Extrinsic => POSE_SIZE,
            ParamKind::Landmark => 3,
            ParamKind::CameraParams(_) => CAMERA_PARAMS_SIZE,
            ParamKind::SpeedBias => SPEED_BIAS_SIZE,
        }
    }

    pub fn local_dim(&self) -> usize {
        match self {
            ParamKind::Pose | ParamKind::Extrinsic => 6,
            other => other.global_dim(),
        }
    }

    /// Whether the block stores an SE(3) pose.
    pub fn is_pose_like(&self) -> bool {
        matches!(self, ParamKind::Pose | ParamKind::Extrinsic)
    }

    /// Column order of the kind in the normal equations.
    pub fn order(&self) -> u8 {
        match self {
            ParamKind::Pose => 0,
            ParamKind::SpeedBias => 1,
            ParamKind::CameraParams(_) => 2,
            ParamKind::Extrinsic => 3,
            ParamKind::Landmark => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParamKind::Pose => "pose",
            ParamKind::Landmark => "landmark",
            ParamKind::CameraParams(_) => "camera",
            ParamKind::SpeedBias => "speed_bias",
            ParamKind::Extrinsic => "extrinsic",
        }
    }
}

/// A typed, fixed-or-free optimization variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBlock {
    id: Id,
    kind: ParamKind,
    timestamp: u64,
    fixed: bool,
    marginalize: bool,
    value: DVector<f64>,
    factor_ids: BTreeSet<Id>,
}

fn check_dim(what: &str, expected: usize, actual: usize) -> Result<(), EstimationError> {
    if expected != actual {
        return Err(EstimationError::DimensionMismatch {
            what: what.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

impl ParameterBlock {
    /// Creates a block, checking the value size against the kind.
    ///
    /// Pose-like values get their quaternion normalized.
    pub fn new(
        id: Id,
        kind: ParamKind,
        timestamp: u64,
        value: DVector<f64>,
        fixed: bool,
    ) -> Result<Self, EstimationError> {
        check_dim(kind.name(), kind.global_dim(), value.len())?;
        let value = if kind.is_pose_like() {
            pose_vector(&pose_rotation(&value), &pose_translation(&value))
        } else {
            value
        };
        Ok(ParameterBlock {
            id,
            kind,
            timestamp,
            fixed,
            marginalize: false,
            value,
            factor_ids: BTreeSet::new(),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn is_marginalized(&self) -> bool {
        self.marginalize
    }

    pub fn local_dim(&self) -> usize {
        self.kind.local_dim()
    }

    pub fn global_dim(&self) -> usize {
        self.kind.global_dim()
    }

    pub fn value(&self) -> &DVector<f64> {
        &self.value
    }

    /// Ids of the factors that reference this block.
    pub fn factor_ids(&self) -> &BTreeSet<Id> {
        &self.factor_ids
    }

    pub fn set_value(&mut self, value: DVector<f64>) -> Result<(), EstimationError> {
        check_dim(self.kind.name(), self.global_dim(), value.len())?;
        self.value = value;
        Ok(())
    }

    pub fn fix(&mut self) {
        self.fixed = true;
    }

    pub fn unfix(&mut self) {
        self.fixed = false;
    }

    pub fn mark_marginalize(&mut self) {
        self.marginalize = true;
    }

    pub(crate) fn attach_factor(&mut self, factor_id: Id) {
        self.factor_ids.insert(factor_id);
    }

    pub(crate) fn detach_factor(&mut self, factor_id: Id) {
        self.factor_ids.remove(&factor_id);
    }

    /// Applies a local increment of size `local_dim`.
    ///
    /// Pose-like blocks left-multiply `quat_delta(delta[0..3])` onto their
    /// rotation and add `delta[3..6]` to their translation; every other kind
    /// is updated additively. Fixed blocks are left untouched.
    pub fn perturb(&mut self, delta: &[f64]) -> Result<(), EstimationError> {
        check_dim(self.kind.name(), self.local_dim(), delta.len())?;
        if self.fixed {
            return Ok(());
        }

        if self.kind.is_pose_like() {
            let dalpha = Vector3::new(delta[0], delta[1], delta[2]);
            let dr = Vector3::new(delta[3], delta[4], delta[5]);
            let rotation = quat_delta(&dalpha) * pose_rotation(&self.value);
            let translation = pose_translation(&self.value) + dr;
            self.value = pose_vector(&rotation, &translation);
        } else {
            for (v, d) in self.value.iter_mut().zip(delta) {
                *v += d;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn sample_pose() -> ParameterBlock {
        let rotation = UnitQuaternion::from_euler_angles(0.2, -0.4, 1.1);
        let value = pose_vector(&rotation, &Vector3::new(1.0, -2.0, 0.5));
        ParameterBlock::new(0, ParamKind::Pose, 10, value, false).unwrap()
    }

    #[test]
    fn test_pose_retraction_round_trip() {
        let mut pose = sample_pose();
        let original = pose.value().clone();
        let delta = [0.01, -0.02, 0.03, 0.1, 0.2, -0.3];
        let inverse: Vec<f64> = delta.iter().map(|d| -d).collect();

        pose.perturb(&delta).unwrap();
        assert!((pose.value() - &original).norm() > 1e-3);
        pose.perturb(&inverse).unwrap();

        // q and -q are the same rotation, compare on the manifold.
        let angle = pose_rotation(pose.value()).angle_to(&pose_rotation(&original));
        assert!(angle < 1e-9);
        assert_relative_eq!(
            pose_translation(pose.value()),
            pose_translation(&original),
            epsilon = 1e-9
        );
        assert_eq!(pose.value().len(), POSE_SIZE);
    }

    #[test]
    fn test_pose_perturb_is_left_multiplicative() {
        let mut pose = sample_pose();
        let before = pose_rotation(pose.value());
        pose.perturb(&[0.0, 0.0, 0.5, 0.0, 0.0, 0.0]).unwrap();
        let expected = UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, 0.5)) * before;
        assert!(pose_rotation(pose.value()).angle_to(&expected) < 1e-12);
    }

    #[test]
    fn test_additive_perturbation() {
        let value = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let mut landmark = ParameterBlock::new(1, ParamKind::Landmark, 0, value, false).unwrap();
        landmark.perturb(&[0.5, -0.5, 1.0]).unwrap();
        assert_relative_eq!(
            landmark.value().clone(),
            DVector::from_vec(vec![1.5, 1.5, 4.0])
        );
    }

    #[test]
    fn test_fixed_block_rejects_perturbation() {
        let mut pose = sample_pose();
        pose.fix();
        let before = pose.value().clone();
        pose.perturb(&[0.1; 6]).unwrap();
        assert_eq!(pose.value(), &before);
    }

    #[test]
    fn test_dimension_checks() {
        let short = DVector::from_vec(vec![0.0; 6]);
        assert!(matches!(
            ParameterBlock::new(2, ParamKind::Pose, 0, short, false),
            Err(EstimationError::DimensionMismatch { expected: 7, actual: 6, .. })
        ));

        let mut sb =
            ParameterBlock::new(3, ParamKind::SpeedBias, 0, DVector::zeros(9), false).unwrap();
        assert!(sb.perturb(&[0.0; 6]).is_err());
        assert!(sb.local_dim() <= sb.global_dim());
    }
}
