//! IMU preintegration between two keyframes and the matching 15-dimensional
//! relative-motion residual.
//!
//! The error state is ordered `[δp, δv, δθ, δba, δbg]`. Biases enter the
//! residual through a first-order correction using the bias Jacobians sliced
//! out of the accumulated transition matrix, so a bias update does not
//! require re-integrating the samples.

use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, SVector, UnitQuaternion, Vector3};

use crate::estimation::EstimationError;
use crate::geometry::{
    pose_rotation, pose_translation, pose_vector, quat_delta, quat_left, quat_right, skew,
    vector_block,
};

pub type Matrix15 = SMatrix<f64, 15, 15>;
pub type Vector15 = SVector<f64, 15>;

/// Residual dimension of the IMU factor.
pub const IMU_RESIDUAL_SIZE: usize = 15;

/// Smallest variance kept on the diagonal of the preintegrated covariance.
/// A single interval leaves the position block at exactly zero.
const MIN_VARIANCE: f64 = 1e-18;

/// Nanoseconds to seconds.
pub fn ns2sec(ns: u64) -> f64 {
    ns as f64 * 1e-9
}

/// Continuous-time IMU noise densities and world gravity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuParams {
    pub rate: f64,
    pub noise_acc: f64,
    pub noise_gyr: f64,
    pub noise_ba: f64,
    pub noise_bg: f64,
    /// Gravity expressed in the world frame.
    pub gravity: Vector3<f64>,
}

impl Default for ImuParams {
    fn default() -> Self {
        ImuParams {
            rate: 200.0,
            noise_acc: 0.08,
            noise_gyr: 0.004,
            noise_ba: 0.00004,
            noise_bg: 2.0e-6,
            gravity: Vector3::new(0.0, 0.0, -9.81),
        }
    }
}

/// Timestamped IMU samples between two keyframes.
///
/// Timestamps are in nanoseconds; accelerometer readings are specific forces in
/// the sensor frame, gyroscope readings angular rates in the sensor frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImuBuffer {
    pub timestamps: Vec<u64>,
    pub accel: Vec<Vector3<f64>>,
    pub gyro: Vec<Vector3<f64>>,
}

impl ImuBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, timestamp: u64, accel: Vector3<f64>, gyro: Vector3<f64>) {
        self.timestamps.push(timestamp);
        self.accel.push(accel);
        self.gyro.push(gyro);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<u64> {
        self.timestamps.first().copied()
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.timestamps.last().copied()
    }

    /// Checks sizes and that timestamps are strictly increasing.
    pub fn validate(&self) -> Result<(), EstimationError> {
        if self.accel.len() != self.timestamps.len() || self.gyro.len() != self.timestamps.len() {
            return Err(EstimationError::InvalidFactor(format!(
                "imu buffer has {} timestamps, {} accel and {} gyro samples",
                self.timestamps.len(),
                self.accel.len(),
                self.gyro.len()
            )));
        }
        if self.timestamps.len() < 2 {
            return Err(EstimationError::InvalidFactor(
                "imu buffer needs at least two samples".to_string(),
            ));
        }
        if self.timestamps.windows(2).any(|w| w[1] <= w[0]) {
            return Err(EstimationError::InvalidFactor(
                "imu timestamps must be strictly increasing".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval lengths in seconds paired with the sample at the start of each.
    fn intervals(&self) -> impl Iterator<Item = (f64, &Vector3<f64>, &Vector3<f64>)> + '_ {
        self.timestamps
            .windows(2)
            .zip(self.accel.iter().zip(self.gyro.iter()))
            .map(|(ts, (a, w))| (ns2sec(ts[1] - ts[0]), a, w))
    }
}

/// Relative motion accumulated from an [`ImuBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ImuPreintegration {
    dp: Vector3<f64>,
    dv: Vector3<f64>,
    dq: UnitQuaternion<f64>,
    ba: Vector3<f64>,
    bg: Vector3<f64>,
    gravity: Vector3<f64>,
    dt: f64,
    state_f: Matrix15,
    state_p: Matrix15,
}

fn speed_bias_parts(sb: &DVector<f64>) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
    (
        Vector3::new(sb[0], sb[1], sb[2]),
        Vector3::new(sb[3], sb[4], sb[5]),
        Vector3::new(sb[6], sb[7], sb[8]),
    )
}

impl ImuPreintegration {
    /// Preintegrates `buffer` around the bias estimates `ba` and `bg`.
    pub fn new(
        params: &ImuParams,
        buffer: &ImuBuffer,
        ba: Vector3<f64>,
        bg: Vector3<f64>,
    ) -> Result<Self, EstimationError> {
        buffer.validate()?;

        let mut q = SMatrix::<f64, 12, 12>::zeros();
        q.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(Matrix3::identity() * params.noise_acc.powi(2)));
        q.fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(Matrix3::identity() * params.noise_gyr.powi(2)));
        q.fixed_view_mut::<3, 3>(6, 6)
            .copy_from(&(Matrix3::identity() * params.noise_ba.powi(2)));
        q.fixed_view_mut::<3, 3>(9, 9)
            .copy_from(&(Matrix3::identity() * params.noise_bg.powi(2)));

        let mut preint = ImuPreintegration {
            dp: Vector3::zeros(),
            dv: Vector3::zeros(),
            dq: UnitQuaternion::identity(),
            ba,
            bg,
            gravity: params.gravity,
            dt: 0.0,
            state_f: Matrix15::identity(),
            state_p: Matrix15::zeros(),
        };

        for (dt, accel, gyro) in buffer.intervals() {
            let a = accel - ba;
            let w = gyro - bg;
            let dc = preint.dq.to_rotation_matrix().into_inner();

            let mut f_i = Matrix15::zeros();
            f_i.fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&Matrix3::identity());
            f_i.fixed_view_mut::<3, 3>(3, 6).copy_from(&(-dc * skew(&a)));
            f_i.fixed_view_mut::<3, 3>(3, 9).copy_from(&(-dc));
            f_i.fixed_view_mut::<3, 3>(6, 6).copy_from(&(-skew(&w)));
            f_i.fixed_view_mut::<3, 3>(6, 12)
                .copy_from(&(-Matrix3::identity()));

            let mut g_i = SMatrix::<f64, 15, 12>::zeros();
            g_i.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-dc));
            g_i.fixed_view_mut::<3, 3>(6, 3)
                .copy_from(&(-Matrix3::identity()));
            g_i.fixed_view_mut::<3, 3>(9, 6)
                .copy_from(&Matrix3::identity());
            g_i.fixed_view_mut::<3, 3>(12, 9)
                .copy_from(&Matrix3::identity());

            let phi = Matrix15::identity() + f_i * dt;
            let g_dt = g_i * dt;
            preint.state_p = phi * preint.state_p * phi.transpose() + g_dt * q * g_dt.transpose();
            preint.state_f = phi * preint.state_f;

            let acc = dc * a;
            preint.dp += preint.dv * dt + 0.5 * acc * dt * dt;
            preint.dv += acc * dt;
            preint.dq = UnitQuaternion::new_normalize(
                (preint.dq * quat_delta(&(w * dt))).into_inner(),
            );
            preint.dt += dt;
        }

        if preint.state_p.iter().any(|v| !v.is_finite()) {
            return Err(EstimationError::InvalidCovariance(
                "imu preintegration covariance is not finite".to_string(),
            ));
        }
        for i in 0..IMU_RESIDUAL_SIZE {
            preint.state_p[(i, i)] = preint.state_p[(i, i)].max(MIN_VARIANCE);
        }

        Ok(preint)
    }

    pub fn dp(&self) -> &Vector3<f64> {
        &self.dp
    }

    pub fn dv(&self) -> &Vector3<f64> {
        &self.dv
    }

    pub fn dq(&self) -> &UnitQuaternion<f64> {
        &self.dq
    }

    /// Total integration time in seconds.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn covariance(&self) -> &Matrix15 {
        &self.state_p
    }

    pub fn transition(&self) -> &Matrix15 {
        &self.state_f
    }

    fn f_block(&self, row: usize, col: usize) -> Matrix3<f64> {
        self.state_f.fixed_view::<3, 3>(row, col).into_owned()
    }

    pub fn dp_dba(&self) -> Matrix3<f64> {
        self.f_block(0, 9)
    }

    pub fn dp_dbg(&self) -> Matrix3<f64> {
        self.f_block(0, 12)
    }

    pub fn dv_dba(&self) -> Matrix3<f64> {
        self.f_block(3, 9)
    }

    pub fn dv_dbg(&self) -> Matrix3<f64> {
        self.f_block(3, 12)
    }

    pub fn dq_dbg(&self) -> Matrix3<f64> {
        self.f_block(6, 12)
    }

    /// Unweighted residual and Jacobians w.r.t. `[pose_i, sb_i, pose_j, sb_j]`.
    ///
    /// Pose Jacobians are 15x6 (rotation then translation), speed/bias
    /// Jacobians 15x9 (velocity, accelerometer bias, gyroscope bias).
    pub fn evaluate(
        &self,
        pose_i: &DVector<f64>,
        sb_i: &DVector<f64>,
        pose_j: &DVector<f64>,
        sb_j: &DVector<f64>,
    ) -> (Vector15, [DMatrix<f64>; 4]) {
        let q_i = pose_rotation(pose_i);
        let q_j = pose_rotation(pose_j);
        let r_i = pose_translation(pose_i);
        let r_j = pose_translation(pose_j);
        let (v_i, ba_i, bg_i) = speed_bias_parts(sb_i);
        let (v_j, ba_j, bg_j) = speed_bias_parts(sb_j);

        let c_i_t = q_i.to_rotation_matrix().into_inner().transpose();
        let dt = self.dt;
        let g = self.gravity;

        // First-order bias correction.
        let dba = ba_i - self.ba;
        let dbg = bg_i - self.bg;
        let dp_dba = self.dp_dba();
        let dp_dbg = self.dp_dbg();
        let dv_dba = self.dv_dba();
        let dv_dbg = self.dv_dbg();
        let dq_dbg = self.dq_dbg();
        let dp = self.dp + dp_dba * dba + dp_dbg * dbg;
        let dv = self.dv + dv_dba * dba + dv_dbg * dbg;
        let gamma = self.dq * quat_delta(&(dq_dbg * dbg));

        let dr_world = r_j - r_i - v_i * dt - 0.5 * g * dt * dt;
        let dv_world = v_j - v_i - g * dt;
        let gamma_q_i_inv = gamma.inverse() * q_i.inverse();
        let q_err = gamma_q_i_inv * q_j;

        let mut residual = Vector15::zeros();
        residual
            .fixed_rows_mut::<3>(0)
            .copy_from(&(c_i_t * dr_world - dp));
        residual
            .fixed_rows_mut::<3>(3)
            .copy_from(&(c_i_t * dv_world - dv));
        residual
            .fixed_rows_mut::<3>(6)
            .copy_from(&(2.0 * q_err.imag()));
        residual.fixed_rows_mut::<3>(9).copy_from(&(ba_j - ba_i));
        residual.fixed_rows_mut::<3>(12).copy_from(&(bg_j - bg_i));

        let identity = Matrix3::identity();
        let rot_j = vector_block(
            &(quat_left(gamma_q_i_inv.quaternion()) * quat_right(q_j.quaternion())),
        );

        let mut j_pose_i = DMatrix::zeros(IMU_RESIDUAL_SIZE, 6);
        j_pose_i
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(c_i_t * skew(&dr_world)));
        j_pose_i.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-c_i_t));
        j_pose_i
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(c_i_t * skew(&dv_world)));
        j_pose_i.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-rot_j));

        let mut j_sb_i = DMatrix::zeros(IMU_RESIDUAL_SIZE, 9);
        j_sb_i.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-c_i_t * dt));
        j_sb_i.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-dp_dba));
        j_sb_i.fixed_view_mut::<3, 3>(0, 6).copy_from(&(-dp_dbg));
        j_sb_i.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-c_i_t));
        j_sb_i.fixed_view_mut::<3, 3>(3, 3).copy_from(&(-dv_dba));
        j_sb_i.fixed_view_mut::<3, 3>(3, 6).copy_from(&(-dv_dbg));
        j_sb_i
            .fixed_view_mut::<3, 3>(6, 6)
            .copy_from(&(-vector_block(&quat_right(q_err.quaternion())) * dq_dbg));
        j_sb_i.fixed_view_mut::<3, 3>(9, 3).copy_from(&(-identity));
        j_sb_i.fixed_view_mut::<3, 3>(12, 6).copy_from(&(-identity));

        let mut j_pose_j = DMatrix::zeros(IMU_RESIDUAL_SIZE, 6);
        j_pose_j.fixed_view_mut::<3, 3>(0, 3).copy_from(&c_i_t);
        j_pose_j.fixed_view_mut::<3, 3>(6, 0).copy_from(&rot_j);

        let mut j_sb_j = DMatrix::zeros(IMU_RESIDUAL_SIZE, 9);
        j_sb_j.fixed_view_mut::<3, 3>(3, 0).copy_from(&c_i_t);
        j_sb_j.fixed_view_mut::<3, 3>(9, 3).copy_from(&identity);
        j_sb_j.fixed_view_mut::<3, 3>(12, 6).copy_from(&identity);

        (residual, [j_pose_i, j_sb_i, j_pose_j, j_sb_j])
    }
}

/// Predicts the pose and speed/bias at the end of `buffer` by integrating in
/// the world frame, starting from `pose_i` and `sb_i`. Biases are carried over.
pub fn imu_propagate(
    buffer: &ImuBuffer,
    gravity: &Vector3<f64>,
    pose_i: &DVector<f64>,
    sb_i: &DVector<f64>,
) -> Result<(DVector<f64>, DVector<f64>), EstimationError> {
    buffer.validate()?;

    let mut q = pose_rotation(pose_i);
    let mut r = pose_translation(pose_i);
    let (mut v, ba, bg) = speed_bias_parts(sb_i);

    for (dt, accel, gyro) in buffer.intervals() {
        let a_world = q * (accel - ba) + gravity;
        r += v * dt + 0.5 * a_world * dt * dt;
        v += a_world * dt;
        q = UnitQuaternion::new_normalize((q * quat_delta(&((gyro - bg) * dt))).into_inner());
    }

    let mut sb_j = sb_i.clone();
    sb_j.fixed_rows_mut::<3>(0).copy_from(&v);
    Ok((pose_vector(&q, &r), sb_j))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::param::{ParamKind, ParameterBlock};
    use approx::assert_relative_eq;

    fn motion_buffer() -> ImuBuffer {
        let mut buffer = ImuBuffer::new();
        for k in 0..20u64 {
            let t = k as f64 * 0.005;
            let accel = Vector3::new(0.3 * t.cos(), -0.2, 9.81 + 0.1 * t.sin());
            let gyro = Vector3::new(0.1, -0.05 * t, 0.2);
            buffer.add(1_000_000_000 + k * 5_000_000, accel, gyro);
        }
        buffer
    }

    fn speed_bias(v: [f64; 3], ba: [f64; 3], bg: [f64; 3]) -> DVector<f64> {
        DVector::from_iterator(9, v.into_iter().chain(ba).chain(bg))
    }

    #[test]
    fn test_imu_zero_motion() {
        let ba = Vector3::new(0.01, -0.02, 0.03);
        let bg = Vector3::new(0.001, 0.002, -0.003);
        let mut buffer = ImuBuffer::new();
        for k in 0..10u64 {
            buffer.add(k * 5_000_000, ba, bg);
        }

        let preint = ImuPreintegration::new(&ImuParams::default(), &buffer, ba, bg).unwrap();
        assert_relative_eq!(*preint.dp(), Vector3::zeros(), epsilon = 1e-15);
        assert_relative_eq!(*preint.dv(), Vector3::zeros(), epsilon = 1e-15);
        assert_relative_eq!(preint.dq().angle(), 0.0, epsilon = 1e-15);
        assert_relative_eq!(preint.dt(), 0.045, epsilon = 1e-12);
    }

    #[test]
    fn test_imu_buffer_validation() {
        let mut buffer = ImuBuffer::new();
        buffer.add(10, Vector3::zeros(), Vector3::zeros());
        assert!(buffer.validate().is_err());
        buffer.add(10, Vector3::zeros(), Vector3::zeros());
        assert!(buffer.validate().is_err());
    }

    #[test]
    fn test_covariance_is_symmetric_positive() {
        let preint = ImuPreintegration::new(
            &ImuParams::default(),
            &motion_buffer(),
            Vector3::zeros(),
            Vector3::zeros(),
        )
        .unwrap();
        let p = preint.covariance();
        assert_relative_eq!(*p, p.transpose(), epsilon = 1e-18);
        assert!(p.cholesky().is_some());
    }

    #[test]
    fn test_single_interval_covariance_is_invertible() {
        let mut buffer = ImuBuffer::new();
        buffer.add(0, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros());
        buffer.add(5_000_000, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros());

        let preint = ImuPreintegration::new(
            &ImuParams::default(),
            &buffer,
            Vector3::zeros(),
            Vector3::zeros(),
        )
        .unwrap();
        let p = preint.covariance();
        assert_relative_eq!(p[(0, 0)], MIN_VARIANCE);
        assert!(p.cholesky().is_some());

        let params = ImuParams {
            noise_acc: f64::NAN,
            ..ImuParams::default()
        };
        assert!(matches!(
            ImuPreintegration::new(&params, &buffer, Vector3::zeros(), Vector3::zeros()),
            Err(EstimationError::InvalidCovariance(_))
        ));
    }

    /// The bias Jacobians predict re-integration under a small bias change.
    #[test]
    fn test_first_order_bias_correction() {
        let params = ImuParams::default();
        let buffer = motion_buffer();
        let dba = Vector3::new(2e-3, -1e-3, 1.5e-3);
        let dbg = Vector3::new(4e-4, -2e-4, 3e-4);

        let nominal =
            ImuPreintegration::new(&params, &buffer, Vector3::zeros(), Vector3::zeros()).unwrap();
        let shifted = ImuPreintegration::new(&params, &buffer, dba, dbg).unwrap();

        let dp = nominal.dp() + nominal.dp_dba() * dba + nominal.dp_dbg() * dbg;
        let dv = nominal.dv() + nominal.dv_dba() * dba + nominal.dv_dbg() * dbg;
        let dq = nominal.dq() * quat_delta(&(nominal.dq_dbg() * dbg));

        let dp_shift = (shifted.dp() - nominal.dp()).norm();
        let dv_shift = (shifted.dv() - nominal.dv()).norm();
        let dq_shift = nominal.dq().angle_to(shifted.dq());
        assert!(dp_shift > 5e-6 && dv_shift > 1e-4 && dq_shift > 1e-5);

        let dp_miss = (dp - shifted.dp()).norm();
        let dv_miss = (dv - shifted.dv()).norm();
        let dq_miss = dq.angle_to(shifted.dq());
        assert!(dp_miss < 0.2 * dp_shift && dp_miss < 1e-5, "dp miss {dp_miss:e}");
        assert!(dv_miss < 1e-2 * dv_shift && dv_miss < 1e-6, "dv miss {dv_miss:e}");
        assert!(dq_miss < 1e-2 * dq_shift && dq_miss < 1e-6, "dq miss {dq_miss:e}");
    }

    /// Propagating the state and preintegrating the same samples agree exactly.
    #[test]
    fn test_propagate_matches_preintegration() {
        let params = ImuParams::default();
        let buffer = motion_buffer();
        let rotation = UnitQuaternion::from_euler_angles(0.1, -0.2, 0.7);
        let pose_i = pose_vector(&rotation, &Vector3::new(1.0, 2.0, 0.5));
        let sb_i = speed_bias([0.5, -0.1, 0.2], [0.02, -0.01, 0.03], [0.001, 0.0, -0.002]);

        let (pose_j, sb_j) = imu_propagate(&buffer, &params.gravity, &pose_i, &sb_i).unwrap();
        let preint = ImuPreintegration::new(
            &params,
            &buffer,
            Vector3::new(0.02, -0.01, 0.03),
            Vector3::new(0.001, 0.0, -0.002),
        )
        .unwrap();
        let (residual, _) = preint.evaluate(&pose_i, &sb_i, &pose_j, &sb_j);
        assert_relative_eq!(residual, Vector15::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn test_imu_jacobians_match_finite_differences() {
        let params = ImuParams::default();
        let buffer = motion_buffer();
        let bg = Vector3::new(0.001, 0.002, -0.001);
        let preint =
            ImuPreintegration::new(&params, &buffer, Vector3::new(0.01, 0.0, 0.0), bg).unwrap();

        // Deliberately inconsistent states so every block is exercised.
        let blocks = vec![
            ParameterBlock::new(
                0,
                ParamKind::Pose,
                0,
                pose_vector(
                    &UnitQuaternion::from_euler_angles(0.2, 0.1, -0.3),
                    &Vector3::new(0.1, 0.2, 0.3),
                ),
                false,
            )
            .unwrap(),
            ParameterBlock::new(
                1,
                ParamKind::SpeedBias,
                0,
                speed_bias([0.3, 0.1, -0.2], [0.02, -0.01, 0.01], [0.001, 0.002, -0.001]),
                false,
            )
            .unwrap(),
            ParameterBlock::new(
                2,
                ParamKind::Pose,
                0,
                pose_vector(
                    &UnitQuaternion::from_euler_angles(0.25, 0.05, -0.2),
                    &Vector3::new(0.15, 0.2, 0.35),
                ),
                false,
            )
            .unwrap(),
            ParameterBlock::new(
                3,
                ParamKind::SpeedBias,
                0,
                speed_bias([0.35, 0.1, -0.25], [0.03, -0.01, 0.0], [0.0, 0.002, 0.0]),
                false,
            )
            .unwrap(),
        ];
        let eval = |blocks: &[ParameterBlock]| {
            preint
                .evaluate(
                    blocks[0].value(),
                    blocks[1].value(),
                    blocks[2].value(),
                    blocks[3].value(),
                )
                .0
        };
        let (_, analytic) = preint.evaluate(
            blocks[0].value(),
            blocks[1].value(),
            blocks[2].value(),
            blocks[3].value(),
        );

        let step = 1e-6;
        for (b, jacobian) in analytic.iter().enumerate() {
            let local_dim = blocks[b].local_dim();
            for i in 0..local_dim {
                let mut delta = vec![0.0; local_dim];
                delta[i] = step;
                let mut plus = blocks.clone();
                plus[b].perturb(&delta).unwrap();
                delta[i] = -step;
                let mut minus = blocks.clone();
                minus[b].perturb(&delta).unwrap();

                let numerical = (eval(&plus) - eval(&minus)) / (2.0 * step);
                for row in 0..IMU_RESIDUAL_SIZE {
                    assert_relative_eq!(
                        jacobian[(row, i)],
                        numerical[row],
                        epsilon = 1e-5,
                        max_relative = 1e-4
                    );
                }
            }
        }
    }
}
