//! Quaternion algebra for the attitude state.
//!
//! The filter carries the attitude quaternion directly inside its state
//! vector, so between corrections it is only approximately unit-norm. The
//! helpers here therefore work on the raw [`nalgebra::Quaternion`] (w
//! scalar, body-to-NED rotation) instead of [`nalgebra::UnitQuaternion`],
//! and follow one rule everywhere: a quaternion whose norm has collapsed
//! below [`MIN_NORM`] degrades to the identity rotation instead of
//! producing NaNs.

use nalgebra::{Matrix3, Quaternion, Vector3};

/// Norm threshold below which a quaternion is treated as degenerate.
pub const MIN_NORM: f32 = 1e-6;

/// Normalize `q` to unit length; returns the identity quaternion when the
/// norm is below [`MIN_NORM`].
pub fn normalize(q: &Quaternion<f32>) -> Quaternion<f32> {
    let norm = q.norm();
    if norm < MIN_NORM {
        return Quaternion::identity();
    }
    let inv = 1.0 / norm;
    Quaternion::new(q.w * inv, q.i * inv, q.j * inv, q.k * inv)
}

/// Quaternion inverse `q* / |q|^2`; identity when the norm has collapsed.
pub fn inverse(q: &Quaternion<f32>) -> Quaternion<f32> {
    let norm_sq = q.norm_squared();
    if norm_sq < MIN_NORM {
        return Quaternion::identity();
    }
    let c = q.conjugate();
    let inv = 1.0 / norm_sq;
    Quaternion::new(c.w * inv, c.i * inv, c.j * inv, c.k * inv)
}

/// Quaternion rate of change for body angular velocity `omega` (rad/s):
/// `q_dot = 0.5 * q ⊗ (0, omega)`.
pub fn derivative(q: &Quaternion<f32>, omega: &Vector3<f32>) -> Quaternion<f32> {
    let rate = *q * Quaternion::from_imag(*omega);
    Quaternion::new(0.5 * rate.w, 0.5 * rate.i, 0.5 * rate.j, 0.5 * rate.k)
}

/// Direction cosine matrix (body to NED) of `q`.
///
/// Assumes `q` is unit-norm; callers normalize first.
pub fn dcm(q: &Quaternion<f32>) -> Matrix3<f32> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    )
}

/// Rotate `v` from body to NED: equivalent to `q ⊗ (0, v) ⊗ q^-1`, computed
/// through the DCM to avoid the two quaternion products.
pub fn rotate(q: &Quaternion<f32>, v: &Vector3<f32>) -> Vector3<f32> {
    dcm(q) * v
}

/// Rotate `v` from NED to body (inverse rotation).
pub fn rotate_inverse(q: &Quaternion<f32>, v: &Vector3<f32>) -> Vector3<f32> {
    rotate(&q.conjugate(), v)
}

/// Build a quaternion from aerospace ZYX Euler angles (roll about x, pitch
/// about y, yaw about z), normalized.
pub fn from_euler(roll: f32, pitch: f32, yaw: f32) -> Quaternion<f32> {
    let cr = (roll * 0.5).cos();
    let sr = (roll * 0.5).sin();
    let cp = (pitch * 0.5).cos();
    let sp = (pitch * 0.5).sin();
    let cy = (yaw * 0.5).cos();
    let sy = (yaw * 0.5).sin();

    let q = Quaternion::new(
        cr * cp * cy + sr * sp * sy,
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
    );
    normalize(&q)
}

/// Extract ZYX Euler angles `(roll, pitch, yaw)` in radians.
///
/// Pitch saturates to ±π/2 at the gimbal-lock singularity.
pub fn to_euler(q: &Quaternion<f32>) -> (f32, f32, f32) {
    let q = normalize(q);
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));

    let sinp = 2.0 * (w * y - z * x);
    let pitch = if sinp.abs() >= 1.0 {
        (std::f32::consts::PI / 2.0).copysign(sinp)
    } else {
        sinp.asin()
    };

    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

    (roll, pitch, yaw)
}
