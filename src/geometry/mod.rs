//! Rotation and rigid-body helpers shared by the camera models and the estimator.
//!
//! Rigid-body poses are stored as 7-vectors `[qw, qx, qy, qz, x, y, z]`: a unit
//! quaternion (scalar first) followed by a translation. Rotation increments use
//! the left-multiplicative chart `q ← δq(δθ) ⊗ q`, so every Jacobian in the
//! crate is expressed with respect to a small rotation applied in the world
//! (or parent) frame.

use nalgebra::{
    DVector, Matrix3, Matrix4, Quaternion, Rotation3, UnitQuaternion, Vector3, Vector4,
};

/// Number of values in a stored pose vector.
pub const POSE_SIZE: usize = 7;

/// Skew-symmetric (cross-product) matrix so that `skew(a) * b == a × b`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// `sin(x) / x`, using a Taylor expansion close to zero.
pub fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-4 {
        1.0 - x * x / 6.0
    } else {
        x.sin() / x
    }
}

/// Exponential map from a rotation vector to a unit quaternion.
///
/// The scalar part is `cos(|δθ|/2)` and the vector part `sinc(|δθ|/2) · δθ / 2`,
/// which stays well defined for a zero increment.
pub fn quat_delta(dalpha: &Vector3<f64>) -> UnitQuaternion<f64> {
    let half_norm = 0.5 * dalpha.norm();
    let vector = 0.5 * sinc(half_norm) * dalpha;
    UnitQuaternion::from_quaternion(Quaternion::new(
        half_norm.cos(),
        vector.x,
        vector.y,
        vector.z,
    ))
}

/// Quaternion coefficients in `[w, x, y, z]` order.
pub fn quat_wxyz(q: &Quaternion<f64>) -> Vector4<f64> {
    Vector4::new(q.w, q.i, q.j, q.k)
}

/// Left-multiplication matrix: `p ⊗ q == quat_left(p) * q` in `[w, x, y, z]` order.
pub fn quat_left(p: &Quaternion<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (p.w, p.i, p.j, p.k);
    Matrix4::new(
        w, -x, -y, -z, //
        x, w, -z, y, //
        y, z, w, -x, //
        z, -y, x, w,
    )
}

/// Right-multiplication matrix: `p ⊗ q == quat_right(q) * p` in `[w, x, y, z]` order.
pub fn quat_right(q: &Quaternion<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix4::new(
        w, -x, -y, -z, //
        x, w, z, -y, //
        y, -z, w, x, //
        z, y, -x, w,
    )
}

/// Lower-right 3x3 block of a quaternion product matrix (the vector-vector part).
pub fn vector_block(m: &Matrix4<f64>) -> Matrix3<f64> {
    m.fixed_view::<3, 3>(1, 1).into_owned()
}

/// Packs a rotation and translation into a `[qw, qx, qy, qz, x, y, z]` vector.
pub fn pose_vector(rotation: &UnitQuaternion<f64>, translation: &Vector3<f64>) -> DVector<f64> {
    DVector::from_vec(vec![
        rotation.w,
        rotation.i,
        rotation.j,
        rotation.k,
        translation.x,
        translation.y,
        translation.z,
    ])
}

/// Identity pose vector.
pub fn pose_identity() -> DVector<f64> {
    pose_vector(&UnitQuaternion::identity(), &Vector3::zeros())
}

/// Rotation part of a pose vector (renormalized).
pub fn pose_rotation(pose: &DVector<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(pose[0], pose[1], pose[2], pose[3]))
}

/// Translation part of a pose vector.
pub fn pose_translation(pose: &DVector<f64>) -> Vector3<f64> {
    Vector3::new(pose[4], pose[5], pose[6])
}

/// Converts a homogeneous 4x4 transform into a pose vector.
pub fn pose_from_matrix(tf: &Matrix4<f64>) -> DVector<f64> {
    let rotation = Rotation3::from_matrix_unchecked(tf.fixed_view::<3, 3>(0, 0).into_owned());
    let translation: Vector3<f64> = tf.fixed_view::<3, 1>(0, 3).into_owned();
    pose_vector(&UnitQuaternion::from_rotation_matrix(&rotation), &translation)
}

/// Converts a pose vector into a homogeneous 4x4 transform.
pub fn pose_to_matrix(pose: &DVector<f64>) -> Matrix4<f64> {
    let mut tf = Matrix4::identity();
    tf.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(pose_rotation(pose).to_rotation_matrix().matrix());
    tf.fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&pose_translation(pose));
    tf
}

/// Transforms a point by the pose `T_AB`, returning `C_AB * p_B + r_AB`.
pub fn transform_point(pose: &DVector<f64>, point: &Vector3<f64>) -> Vector3<f64> {
    pose_rotation(pose) * point + pose_translation(pose)
}
