//! 16-state strapdown navigation EKF.
//!
//! State vector layout (fixed):
//!
//! | indices | meaning                              | units |
//! |---------|--------------------------------------|-------|
//! | 0..2    | position in NED                      | m     |
//! | 3..5    | velocity in NED                      | m/s   |
//! | 6..9    | attitude quaternion (w,x,y,z), body to NED | -  |
//! | 10..12  | gyro bias, body frame                | rad/s |
//! | 13..15  | accel bias, body frame               | m/s^2 |
//!
//! IMU samples drive [`Ekf::predict`]; GPS, barometer and magnetometer
//! samples correct the state through the `update_*` methods. All fallible
//! operations leave the filter untouched when they return an error.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::magfield;
use crate::matrix::{Matrix, MatrixError};
use crate::quat;
use crate::{FilterConfig, NavError, NavResult};

/// Number of state variables.
pub const STATE_DIM: usize = 16;

/// Default gravity magnitude along +Z (down) in NED (m/s^2).
pub const GRAVITY_DEFAULT: f32 = 9.80665;

const POS: usize = 0;
const VEL: usize = 3;
const ATT: usize = 6;
const GYRO_BIAS: usize = 10;
const ACCEL_BIAS: usize = 13;

const GPS_DIM: usize = 6;

/// Default GPS measurement variances: position (m^2), then velocity
/// ((m/s)^2). Vertical channels are looser than horizontal.
const R_GPS_DEFAULT: [f32; GPS_DIM] = [25.0, 25.0, 100.0, 0.25, 0.25, 1.0];

/// Covariance diagonal applied by `set_initial_state`.
const P_INIT_DIAG: [f32; STATE_DIM] = [
    10.0, 10.0, 10.0, // position (m^2)
    1.0, 1.0, 1.0, // velocity ((m/s)^2)
    0.1, 0.1, 0.1, 0.1, // attitude quaternion
    0.01, 0.01, 0.01, // gyro bias ((rad/s)^2)
    0.1, 0.1, 0.1, // accel bias ((m/s^2)^2)
];

/// Inflated covariance diagonal applied by `reset`.
const P_RESET_DIAG: [f32; STATE_DIM] = [
    100.0, 100.0, 100.0, //
    10.0, 10.0, 10.0, //
    1.0, 1.0, 1.0, 1.0, //
    0.01, 0.01, 0.01, //
    0.1, 0.1, 0.1,
];

/// Strapdown inertial navigation Extended Kalman Filter.
///
/// The filter owns all of its matrices; getters return copies. It is a
/// single-threaded cooperative object: `&mut self` on every mutating
/// operation enforces the required exclusivity, and no call blocks or
/// suspends.
pub struct Ekf {
    /// State vector x (16x1)
    x: Matrix,

    /// State covariance P (16x16), symmetric positive semi-definite
    p: Matrix,

    /// Process noise covariance Q (16x16), diagonal per-second variances
    q: Matrix,

    /// GPS measurement noise (6x6): position then velocity variances
    r_gps: Matrix,

    /// Barometer measurement noise (1x1)
    r_baro: Matrix,

    /// Magnetometer measurement noise (3x3)
    r_mag: Matrix,

    /// Gravity magnitude along +Z (down) in NED (m/s^2)
    gravity: f32,

    /// Earth magnetic field reference in NED
    earth_mag_ned: Vector3<f32>,

    /// Set by `set_initial_state`, cleared by `reset`
    initialized: bool,

    /// True when the last renormalization had to substitute identity
    attitude_degraded: bool,
}

impl Default for Ekf {
    fn default() -> Self {
        Self::new()
    }
}

impl Ekf {
    /// Create a filter with default noise models. The filter stays inert
    /// until [`Ekf::set_initial_state`] is called.
    pub fn new() -> Self {
        let mut p = Matrix::new(STATE_DIM, STATE_DIM);
        p.fill_diagonal(1.0);

        let mut q = Matrix::new(STATE_DIM, STATE_DIM);
        q.fill_diagonal(0.01);

        let mut r_gps = Matrix::new(GPS_DIM, GPS_DIM);
        for (i, var) in R_GPS_DEFAULT.iter().enumerate() {
            r_gps[(i, i)] = *var;
        }

        let mut r_baro = Matrix::new(1, 1);
        r_baro[(0, 0)] = 1.0;

        let mut r_mag = Matrix::new(3, 3);
        r_mag.fill_diagonal(0.01);

        Self {
            x: Matrix::new(STATE_DIM, 1),
            p,
            q,
            r_gps,
            r_baro,
            r_mag,
            gravity: GRAVITY_DEFAULT,
            earth_mag_ned: magfield::default_earth_field_ned(),
            initialized: false,
            attitude_degraded: false,
        }
    }

    /// Create a filter from a [`FilterConfig`].
    pub fn with_config(config: &FilterConfig) -> Self {
        let mut ekf = Self::new();
        let pn = config.process_noise;
        ekf.set_process_noise(
            pn.pos_std,
            pn.vel_std,
            pn.att_std,
            pn.gyro_bias_std,
            pn.accel_bias_std,
        );
        let sn = config.sensor_noise;
        ekf.set_gps_noise(sn.gps_pos_std, sn.gps_vel_std);
        ekf.set_baro_noise(sn.baro_std);
        ekf.set_mag_noise(sn.mag_std);
        ekf.gravity = config.gravity;
        ekf.earth_mag_ned = config.earth_mag_ned;
        ekf
    }

    /// Write the initial navigation state and mark the filter usable.
    ///
    /// Biases start at zero and the covariance diagonal is reset to the
    /// initial-uncertainty profile.
    pub fn set_initial_state(
        &mut self,
        position: Vector3<f32>,
        velocity: Vector3<f32>,
        attitude: UnitQuaternion<f32>,
    ) {
        self.x.zero();
        self.set_state_vec3(POS, &position);
        self.set_state_vec3(VEL, &velocity);
        self.set_state_quat(attitude.quaternion());
        self.set_covariance_diag(&P_INIT_DIAG);
        self.initialized = true;
        self.attitude_degraded = false;
    }

    /// Return the filter to its uninitialized state with an inflated
    /// covariance. Tuned noise models and the earth-field reference are
    /// kept.
    pub fn reset(&mut self) {
        self.x.zero();
        self.x[(ATT, 0)] = 1.0;
        self.set_covariance_diag(&P_RESET_DIAG);
        self.initialized = false;
        self.attitude_degraded = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True when the last quaternion renormalization had to fall back to
    /// the identity rotation. Indicates an upstream numerical problem.
    pub fn attitude_degraded(&self) -> bool {
        self.attitude_degraded
    }

    /// Fill the Q diagonal from per-group standard deviations (squared to
    /// variances; the attitude value covers all four quaternion slots).
    pub fn set_process_noise(
        &mut self,
        pos_std: f32,
        vel_std: f32,
        att_std: f32,
        gyro_bias_std: f32,
        accel_bias_std: f32,
    ) {
        self.q.fill_diagonal(0.0);
        for i in 0..3 {
            self.q[(POS + i, POS + i)] = pos_std * pos_std;
            self.q[(VEL + i, VEL + i)] = vel_std * vel_std;
            self.q[(GYRO_BIAS + i, GYRO_BIAS + i)] = gyro_bias_std * gyro_bias_std;
            self.q[(ACCEL_BIAS + i, ACCEL_BIAS + i)] = accel_bias_std * accel_bias_std;
        }
        for i in 0..4 {
            self.q[(ATT + i, ATT + i)] = att_std * att_std;
        }
    }

    /// Set GPS noise from position (m) and velocity (m/s) standard
    /// deviations, applied to all three axes of each group.
    pub fn set_gps_noise(&mut self, pos_std: f32, vel_std: f32) {
        self.r_gps.fill_diagonal(0.0);
        for i in 0..3 {
            self.r_gps[(i, i)] = pos_std * pos_std;
            self.r_gps[(i + 3, i + 3)] = vel_std * vel_std;
        }
    }

    /// Set barometric altitude noise from its standard deviation (m).
    pub fn set_baro_noise(&mut self, baro_std: f32) {
        self.r_baro[(0, 0)] = baro_std * baro_std;
    }

    /// Set magnetometer noise from a per-axis standard deviation (uT).
    pub fn set_mag_noise(&mut self, mag_std: f32) {
        self.r_mag.fill_diagonal(mag_std * mag_std);
    }

    /// Replace the earth magnetic field reference (NED frame).
    pub fn set_earth_magnetic_field(&mut self, mag_ned: Vector3<f32>) {
        self.earth_mag_ned = mag_ned;
    }

    /// Estimate the earth-field direction from static magnetometer and
    /// accelerometer sample pairs and install it as the reference. Falls
    /// back to the default reference on unusable input.
    pub fn initialize_magnetic_field(
        &mut self,
        mag_samples: &[Vector3<f32>],
        accel_samples: &[Vector3<f32>],
    ) {
        self.earth_mag_ned = magfield::estimate_field_ned(mag_samples, accel_samples);
    }

    /// Install the built-in default earth-field reference.
    pub fn initialize_default_magnetic_field(&mut self) {
        self.earth_mag_ned = magfield::default_earth_field_ned();
    }

    /// Propagate state and covariance by one IMU step.
    ///
    /// `gyro` is the body angular rate (rad/s), `accel` the body specific
    /// force (m/s^2; at rest roughly (0, 0, -g) with the body level), `dt`
    /// the step in seconds. Biases are compensated here but not modified;
    /// only measurement updates move them.
    pub fn predict(&mut self, gyro: Vector3<f32>, accel: Vector3<f32>, dt: f32) -> NavResult<()> {
        if !self.initialized {
            return Err(NavError::NotInitialized);
        }
        if !dt.is_finite() || dt <= 0.0 {
            return Err(NavError::InvalidTimeStep(dt));
        }

        let q = quat::normalize(&self.state_quat());
        let omega = gyro - self.state_vec3(GYRO_BIAS);
        let specific_force = accel - self.state_vec3(ACCEL_BIAS);

        // first-order quaternion integration
        let q_dot = quat::derivative(&q, &omega);
        let q_new = quat::normalize(&Quaternion::new(
            q.w + q_dot.w * dt,
            q.i + q_dot.i * dt,
            q.j + q_dot.j * dt,
            q.k + q_dot.k * dt,
        ));

        // specific force to NED, then restore gravity: f = a - g
        let rot = quat::dcm(&q_new);
        let accel_ned = rot * specific_force + Vector3::new(0.0, 0.0, self.gravity);

        let velocity = self.state_vec3(VEL) + accel_ned * dt;
        let position = self.state_vec3(POS) + velocity * dt;

        let f = Self::transition_jacobian(&q_new, &rot, dt);
        let p_new = f.mul(&self.p)?.mul(&f.transpose())?.add(&self.q.scale(dt))?;

        self.set_state_vec3(POS, &position);
        self.set_state_vec3(VEL, &velocity);
        self.set_state_quat(&q_new);
        self.p = p_new;
        Ok(())
    }

    /// Correct the filter with a GPS fix: NED position (m) and optionally
    /// NED velocity (m/s). Position-only fixes use the reduced 3-row
    /// measurement model with the leading block of the GPS noise matrix.
    pub fn update_gps(
        &mut self,
        position: Vector3<f32>,
        velocity: Option<Vector3<f32>>,
    ) -> NavResult<()> {
        if !self.initialized {
            return Err(NavError::NotInitialized);
        }

        let pos_pred = self.state_vec3(POS);
        match velocity {
            Some(velocity) => {
                let mut h = Matrix::new(GPS_DIM, STATE_DIM);
                for i in 0..3 {
                    h[(i, POS + i)] = 1.0;
                    h[(i + 3, VEL + i)] = 1.0;
                }

                let vel_pred = self.state_vec3(VEL);
                let mut innovation = Matrix::new(GPS_DIM, 1);
                for i in 0..3 {
                    innovation[(i, 0)] = position[i] - pos_pred[i];
                    innovation[(i + 3, 0)] = velocity[i] - vel_pred[i];
                }

                let r = self.r_gps;
                self.apply_update(&h, &innovation, &r)
            }
            None => {
                let mut h = Matrix::new(3, STATE_DIM);
                for i in 0..3 {
                    h[(i, POS + i)] = 1.0;
                }

                let mut innovation = Matrix::new(3, 1);
                for i in 0..3 {
                    innovation[(i, 0)] = position[i] - pos_pred[i];
                }

                let mut r = Matrix::new(3, 3);
                for i in 0..3 {
                    for j in 0..3 {
                        r[(i, j)] = self.r_gps[(i, j)];
                    }
                }
                self.apply_update(&h, &innovation, &r)
            }
        }
    }

    /// Correct the filter with a barometric altitude sample already
    /// expressed as NED down position (m, positive below the origin).
    pub fn update_baro(&mut self, ned_z: f32) -> NavResult<()> {
        if !self.initialized {
            return Err(NavError::NotInitialized);
        }

        let mut h = Matrix::new(1, STATE_DIM);
        h[(0, POS + 2)] = 1.0;

        let mut innovation = Matrix::new(1, 1);
        innovation[(0, 0)] = ned_z - self.x[(POS + 2, 0)];

        let r = self.r_baro;
        self.apply_update(&h, &innovation, &r)
    }

    /// Correct the filter with a body-frame magnetometer sample. The
    /// predicted measurement is the earth-field reference rotated into the
    /// body frame by the current attitude.
    pub fn update_mag(&mut self, mag: Vector3<f32>) -> NavResult<()> {
        if !self.initialized {
            return Err(NavError::NotInitialized);
        }

        let q = quat::normalize(&self.state_quat());
        let mag_pred = quat::rotate_inverse(&q, &self.earth_mag_ned);

        let h = Self::mag_jacobian(&q, &self.earth_mag_ned);

        let mut innovation = Matrix::new(3, 1);
        for i in 0..3 {
            innovation[(i, 0)] = mag[i] - mag_pred[i];
        }

        let r = self.r_mag;
        self.apply_update(&h, &innovation, &r)
    }

    /// Estimated NED position (m); zeros while uninitialized.
    pub fn position(&self) -> Vector3<f32> {
        if !self.initialized {
            return Vector3::zeros();
        }
        self.state_vec3(POS)
    }

    /// Estimated NED velocity (m/s); zeros while uninitialized.
    pub fn velocity(&self) -> Vector3<f32> {
        if !self.initialized {
            return Vector3::zeros();
        }
        self.state_vec3(VEL)
    }

    /// Estimated body-to-NED attitude; identity while uninitialized.
    pub fn attitude(&self) -> UnitQuaternion<f32> {
        if !self.initialized {
            return UnitQuaternion::identity();
        }
        // normalize() guarantees unit norm (or identity)
        UnitQuaternion::new_unchecked(quat::normalize(&self.state_quat()))
    }

    /// Attitude as ZYX Euler angles `(roll, pitch, yaw)` in radians; zeros
    /// while uninitialized.
    pub fn euler_angles(&self) -> (f32, f32, f32) {
        if !self.initialized {
            return (0.0, 0.0, 0.0);
        }
        quat::to_euler(&self.state_quat())
    }

    /// Estimated gyro bias (rad/s, body frame); zeros while uninitialized.
    pub fn gyro_bias(&self) -> Vector3<f32> {
        if !self.initialized {
            return Vector3::zeros();
        }
        self.state_vec3(GYRO_BIAS)
    }

    /// Estimated accelerometer bias (m/s^2, body frame); zeros while
    /// uninitialized.
    pub fn accel_bias(&self) -> Vector3<f32> {
        if !self.initialized {
            return Vector3::zeros();
        }
        self.state_vec3(ACCEL_BIAS)
    }

    /// Copy of the state covariance matrix.
    pub fn covariance(&self) -> Matrix {
        self.p
    }

    /// Current earth magnetic field reference (NED).
    pub fn earth_magnetic_field(&self) -> Vector3<f32> {
        self.earth_mag_ned
    }

    /// Shared measurement-update skeleton: S = H*P*H' + R,
    /// K = P*H'*S^-1, x += K*y, quaternion renormalization,
    /// P = (I - K*H)*P followed by symmetrization.
    ///
    /// The filter is only mutated after every matrix step has succeeded.
    fn apply_update(&mut self, h: &Matrix, innovation: &Matrix, r: &Matrix) -> NavResult<()> {
        let ht = h.transpose();
        let s = h.mul(&self.p)?.mul(&ht)?.add(r)?;
        let s_inv = match s.inverse() {
            Ok(inv) => inv,
            Err(MatrixError::Singular) => {
                log::debug!("measurement update rejected: singular innovation covariance");
                return Err(NavError::SingularInnovation);
            }
            Err(e) => return Err(e.into()),
        };
        let k = self.p.mul(&ht)?.mul(&s_inv)?;

        let x_new = self.x.add(&k.mul(innovation)?)?;
        let i_kh = Matrix::identity(STATE_DIM).sub(&k.mul(h)?)?;
        let p_new = i_kh.mul(&self.p)?;
        // symmetrize to cancel floating-point drift
        let p_new = p_new.add(&p_new.transpose())?.scale(0.5);

        self.x = x_new;
        self.renormalize_attitude();
        self.p = p_new;
        Ok(())
    }

    /// State transition Jacobian F for one step of length `dt`, linearized
    /// about the post-integration attitude `q` with DCM `rot`.
    fn transition_jacobian(q: &Quaternion<f32>, rot: &nalgebra::Matrix3<f32>, dt: f32) -> Matrix {
        let mut f = Matrix::identity(STATE_DIM);

        // position from velocity
        for i in 0..3 {
            f[(POS + i, VEL + i)] = dt;
        }

        // quaternion from gyro bias
        let (qw, qx, qy, qz) = (q.w, q.i, q.j, q.k);
        let half_dt = 0.5 * dt;
        f[(ATT, GYRO_BIAS)] = -qx * half_dt;
        f[(ATT, GYRO_BIAS + 1)] = -qy * half_dt;
        f[(ATT, GYRO_BIAS + 2)] = -qz * half_dt;
        f[(ATT + 1, GYRO_BIAS)] = qw * half_dt;
        f[(ATT + 1, GYRO_BIAS + 1)] = -qz * half_dt;
        f[(ATT + 1, GYRO_BIAS + 2)] = qy * half_dt;
        f[(ATT + 2, GYRO_BIAS)] = qz * half_dt;
        f[(ATT + 2, GYRO_BIAS + 1)] = qw * half_dt;
        f[(ATT + 2, GYRO_BIAS + 2)] = -qx * half_dt;
        f[(ATT + 3, GYRO_BIAS)] = -qy * half_dt;
        f[(ATT + 3, GYRO_BIAS + 1)] = qx * half_dt;
        f[(ATT + 3, GYRO_BIAS + 2)] = qw * half_dt;

        // velocity from accel bias: -R(q) * dt
        for i in 0..3 {
            for j in 0..3 {
                f[(VEL + i, ACCEL_BIAS + j)] = -rot[(i, j)] * dt;
            }
        }

        f
    }

    /// Measurement Jacobian of the magnetometer model `z = R(q)^T *
    /// m_ned` with respect to the quaternion states. Verified against
    /// finite differences in the test suite.
    fn mag_jacobian(q: &Quaternion<f32>, m: &Vector3<f32>) -> Matrix {
        let (qw, qx, qy, qz) = (q.w, q.i, q.j, q.k);
        let (mx, my, mz) = (m.x, m.y, m.z);

        let mut h = Matrix::new(3, STATE_DIM);

        h[(0, ATT)] = 2.0 * (qz * my - qy * mz);
        h[(0, ATT + 1)] = 2.0 * (qy * my + qz * mz);
        h[(0, ATT + 2)] = 2.0 * (-2.0 * qy * mx + qx * my - qw * mz);
        h[(0, ATT + 3)] = 2.0 * (-2.0 * qz * mx + qw * my + qx * mz);

        h[(1, ATT)] = 2.0 * (-qz * mx + qx * mz);
        h[(1, ATT + 1)] = 2.0 * (qy * mx - 2.0 * qx * my + qw * mz);
        h[(1, ATT + 2)] = 2.0 * (qx * mx + qz * mz);
        h[(1, ATT + 3)] = 2.0 * (-qw * mx - 2.0 * qz * my + qy * mz);

        h[(2, ATT)] = 2.0 * (qy * mx - qx * my);
        h[(2, ATT + 1)] = 2.0 * (qz * mx - qw * my - 2.0 * qx * mz);
        h[(2, ATT + 2)] = 2.0 * (qw * mx + qz * my - 2.0 * qy * mz);
        h[(2, ATT + 3)] = 2.0 * (qx * mx + qy * my);

        h
    }

    /// Renormalize the quaternion sub-state after a correction. A
    /// collapsed norm degrades to identity and raises the degraded flag.
    fn renormalize_attitude(&mut self) {
        let q = self.state_quat();
        if q.norm() < quat::MIN_NORM {
            log::warn!("attitude quaternion norm collapsed; substituting identity");
            self.attitude_degraded = true;
            self.set_state_quat(&Quaternion::identity());
        } else {
            self.attitude_degraded = false;
            self.set_state_quat(&quat::normalize(&q));
        }
    }

    fn set_covariance_diag(&mut self, diag: &[f32; STATE_DIM]) {
        self.p.fill_diagonal(0.0);
        for (i, v) in diag.iter().enumerate() {
            self.p[(i, i)] = *v;
        }
    }

    fn state_vec3(&self, base: usize) -> Vector3<f32> {
        Vector3::new(
            self.x[(base, 0)],
            self.x[(base + 1, 0)],
            self.x[(base + 2, 0)],
        )
    }

    fn set_state_vec3(&mut self, base: usize, v: &Vector3<f32>) {
        self.x[(base, 0)] = v.x;
        self.x[(base + 1, 0)] = v.y;
        self.x[(base + 2, 0)] = v.z;
    }

    fn state_quat(&self) -> Quaternion<f32> {
        Quaternion::new(
            self.x[(ATT, 0)],
            self.x[(ATT + 1, 0)],
            self.x[(ATT + 2, 0)],
            self.x[(ATT + 3, 0)],
        )
    }

    fn set_state_quat(&mut self, q: &Quaternion<f32>) {
        self.x[(ATT, 0)] = q.w;
        self.x[(ATT + 1, 0)] = q.i;
        self.x[(ATT + 2, 0)] = q.j;
        self.x[(ATT + 3, 0)] = q.k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProcessNoise, SensorNoise};
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    const DT: f32 = 0.01;

    fn accel_rest() -> Vector3<f32> {
        Vector3::new(0.0, 0.0, -GRAVITY_DEFAULT)
    }

    fn level_filter() -> Ekf {
        let mut ekf = Ekf::new();
        ekf.set_initial_state(
            Vector3::zeros(),
            Vector3::zeros(),
            UnitQuaternion::identity(),
        );
        ekf
    }

    #[test]
    fn test_uninitialized_filter_rejects_operations() {
        let mut ekf = Ekf::new();
        assert!(!ekf.is_initialized());

        assert_eq!(
            ekf.predict(Vector3::zeros(), accel_rest(), DT),
            Err(NavError::NotInitialized)
        );
        assert_eq!(
            ekf.update_gps(Vector3::zeros(), None),
            Err(NavError::NotInitialized)
        );
        assert_eq!(ekf.update_baro(0.0), Err(NavError::NotInitialized));
        assert_eq!(
            ekf.update_mag(Vector3::new(0.3, 0.0, 0.4)),
            Err(NavError::NotInitialized)
        );

        // sentinel getters
        assert_eq!(ekf.position(), Vector3::zeros());
        assert_eq!(ekf.velocity(), Vector3::zeros());
        assert_eq!(ekf.attitude(), UnitQuaternion::identity());
        assert_eq!(ekf.euler_angles(), (0.0, 0.0, 0.0));
        assert_eq!(ekf.gyro_bias(), Vector3::zeros());
        assert_eq!(ekf.accel_bias(), Vector3::zeros());
    }

    #[test]
    fn test_set_initial_state() {
        let mut ekf = Ekf::new();
        let q = UnitQuaternion::from_euler_angles(0.1, -0.2, 0.5);
        ekf.set_initial_state(Vector3::new(1.0, 2.0, 3.0), Vector3::new(-0.5, 0.0, 0.1), q);

        assert!(ekf.is_initialized());
        assert_eq!(ekf.position(), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(ekf.velocity(), Vector3::new(-0.5, 0.0, 0.1));
        assert!(ekf.attitude().angle_to(&q) < 1e-6);
        assert_eq!(ekf.gyro_bias(), Vector3::zeros());
        assert_eq!(ekf.accel_bias(), Vector3::zeros());

        let p = ekf.covariance();
        for (i, expected) in P_INIT_DIAG.iter().enumerate() {
            assert_eq!(p[(i, i)], *expected);
        }
    }

    #[test]
    fn test_predict_rejects_bad_dt() {
        let mut ekf = level_filter();
        let before = ekf.x;

        for dt in [0.0, -0.5, f32::NAN, f32::INFINITY] {
            let result = ekf.predict(Vector3::zeros(), accel_rest(), dt);
            assert!(matches!(result, Err(NavError::InvalidTimeStep(_))));
        }
        assert_eq!(ekf.x, before, "rejected predicts must not touch state");
    }

    #[test]
    fn test_predict_leaves_biases_untouched() {
        let mut ekf = level_filter();
        for _ in 0..20 {
            ekf.predict(
                Vector3::new(0.05, -0.1, 0.2),
                Vector3::new(0.3, -0.1, -9.6),
                DT,
            )
            .unwrap();
        }
        assert_eq!(ekf.gyro_bias(), Vector3::zeros());
        assert_eq!(ekf.accel_bias(), Vector3::zeros());
    }

    #[test]
    fn test_stationary_no_drift() {
        let mut ekf = level_filter();
        for _ in 0..1000 {
            ekf.predict(Vector3::zeros(), accel_rest(), DT).unwrap();
        }
        assert!(ekf.position().norm() < 1e-3, "position drifted");
        assert!(ekf.velocity().norm() < 1e-3, "velocity drifted");
        assert!(ekf.attitude().angle() < 1e-4, "attitude drifted");
    }

    #[test]
    fn test_pure_rotation_closes_full_turn() {
        let mut ekf = level_filter();
        // 1 rad/s about z for ~2*pi seconds
        for _ in 0..628 {
            ekf.predict(Vector3::new(0.0, 0.0, 1.0), accel_rest(), DT)
                .unwrap();
        }
        let (roll, pitch, yaw) = ekf.euler_angles();
        assert!(yaw.abs() < 0.02, "yaw did not close the turn: {yaw}");
        assert!(roll.abs() < 1e-3 && pitch.abs() < 1e-3);
        assert!(ekf.position().norm() < 0.05);
        assert!(ekf.velocity().norm() < 0.05);
    }

    #[test]
    fn test_gps_update_pulls_position() {
        let mut ekf = Ekf::new();
        ekf.set_initial_state(
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::zeros(),
            UnitQuaternion::identity(),
        );
        ekf.predict(Vector3::zeros(), accel_rest(), DT).unwrap();

        let p_pos_before = ekf.covariance()[(0, 0)];
        ekf.set_gps_noise(1.0, 1.0);
        ekf.update_gps(Vector3::zeros(), None).unwrap();

        assert!(
            ekf.position().norm() < 10.0,
            "position not pulled toward measurement"
        );
        assert!(
            ekf.covariance()[(0, 0)] < p_pos_before,
            "position uncertainty not reduced"
        );
    }

    #[test]
    fn test_gps_update_with_velocity() {
        let mut ekf = Ekf::new();
        ekf.set_initial_state(
            Vector3::new(2.0, -1.0, 0.5),
            Vector3::new(1.0, 0.0, 0.0),
            UnitQuaternion::identity(),
        );

        let p_before = ekf.covariance();
        ekf.update_gps(Vector3::zeros(), Some(Vector3::zeros()))
            .unwrap();

        assert!(ekf.position().norm() < Vector3::new(2.0f32, -1.0, 0.5).norm());
        assert!(ekf.velocity().norm() < 1.0);
        for i in 0..6 {
            assert!(ekf.covariance()[(i, i)] < p_before[(i, i)]);
        }
    }

    #[test]
    fn test_baro_monotone_descent() {
        let mut ekf = Ekf::new();
        ekf.set_initial_state(
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::zeros(),
            UnitQuaternion::identity(),
        );
        ekf.predict(Vector3::zeros(), accel_rest(), DT).unwrap();

        let mut z_prev = ekf.position().z;
        assert!(z_prev > 4.0);
        for _ in 0..8 {
            ekf.update_baro(0.0).unwrap();
            let z = ekf.position().z;
            assert!(z < z_prev, "z not strictly decreasing: {z} >= {z_prev}");
            assert!(z > 0.0, "z overshot the measurement");
            z_prev = z;
        }
    }

    #[test]
    fn test_mag_zero_innovation_leaves_state() {
        let mut ekf = Ekf::new();
        let q = UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2);
        ekf.set_initial_state(Vector3::zeros(), Vector3::zeros(), q);
        ekf.set_earth_magnetic_field(Vector3::new(1.0, 0.0, 0.0));

        // with 90 deg yaw the north-pointing field reads (0, -1, 0) in body
        ekf.update_mag(Vector3::new(0.0, -1.0, 0.0)).unwrap();

        assert!(ekf.position().norm() < 1e-4);
        assert!(ekf.velocity().norm() < 1e-4);
        assert!(ekf.attitude().angle_to(&q) < 1e-4);
    }

    #[test]
    fn test_mag_update_corrects_yaw() {
        let mut ekf = Ekf::new();
        // true attitude: identity; filter believes a small positive yaw
        let believed = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.1);
        ekf.set_initial_state(Vector3::zeros(), Vector3::zeros(), believed);
        ekf.set_earth_magnetic_field(Vector3::new(1.0, 0.0, 0.0));

        // level vehicle actually aligned with north measures the field on x
        let (_, _, yaw_before) = ekf.euler_angles();
        ekf.update_mag(Vector3::new(1.0, 0.0, 0.0)).unwrap();
        let (_, _, yaw_after) = ekf.euler_angles();

        assert!(
            yaw_after.abs() < yaw_before.abs(),
            "mag update must shrink the yaw error: {yaw_before} -> {yaw_after}"
        );
    }

    #[test]
    fn test_singular_innovation_rejected_without_mutation() {
        let mut ekf = level_filter();
        ekf.set_gps_noise(0.0, 0.0);

        // first zero-noise update zeroes the position/velocity covariance
        ekf.update_gps(Vector3::zeros(), Some(Vector3::zeros()))
            .unwrap();

        let x_before = ekf.x;
        let p_before = ekf.p;
        let result = ekf.update_gps(Vector3::new(1.0, 2.0, 3.0), Some(Vector3::zeros()));

        assert_eq!(result, Err(NavError::SingularInnovation));
        assert_eq!(ekf.x, x_before, "state mutated by rejected update");
        assert_eq!(ekf.p, p_before, "covariance mutated by rejected update");

        // the filter stays usable
        ekf.set_gps_noise(1.0, 1.0);
        ekf.update_gps(Vector3::zeros(), Some(Vector3::zeros()))
            .unwrap();
    }

    #[test]
    fn test_invariants_across_mixed_operations() {
        let mut ekf = level_filter();
        let gyro = Vector3::new(0.01, -0.02, 0.005);
        let accel = Vector3::new(0.1, 0.05, -9.75);

        for round in 0..5 {
            for _ in 0..10 {
                ekf.predict(gyro, accel, DT).unwrap();
            }
            ekf.update_gps(Vector3::new(0.1, -0.1, 0.0), Some(Vector3::zeros()))
                .unwrap();
            ekf.update_baro(0.05).unwrap();
            ekf.update_mag(ekf.earth_magnetic_field()).unwrap();

            // quaternion norm invariant
            let qn = ekf.state_quat().norm();
            assert!(
                (qn - 1.0).abs() < 1e-5,
                "quaternion norm {qn} off after round {round}"
            );

            // covariance symmetry and non-negative diagonal
            let p = ekf.covariance();
            for i in 0..STATE_DIM {
                assert!(p[(i, i)] >= 0.0, "negative variance at {i}");
                for j in 0..STATE_DIM {
                    assert!(
                        (p[(i, j)] - p[(j, i)]).abs() < 1e-5,
                        "P asymmetric at ({i}, {j}) after round {round}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_mag_jacobian_matches_finite_differences() {
        let q = quat::normalize(&quat::from_euler(0.3, -0.2, 0.7));
        let m = Vector3::new(0.29, -0.05, 0.42);
        let h = Ekf::mag_jacobian(&q, &m);

        let eps = 1e-3;
        for j in 0..4 {
            let mut plus = [q.w, q.i, q.j, q.k];
            let mut minus = plus;
            plus[j] += eps;
            minus[j] -= eps;
            let qp = Quaternion::new(plus[0], plus[1], plus[2], plus[3]);
            let qm = Quaternion::new(minus[0], minus[1], minus[2], minus[3]);

            let zp = quat::rotate_inverse(&qp, &m);
            let zm = quat::rotate_inverse(&qm, &m);
            for i in 0..3 {
                let fd = (zp[i] - zm[i]) / (2.0 * eps);
                assert_relative_eq!(h[(i, ATT + j)], fd, epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_process_noise_setter() {
        let mut ekf = Ekf::new();
        ekf.set_process_noise(1.0, 2.0, 3.0, 4.0, 5.0);
        let expected = [
            1.0, 1.0, 1.0, 4.0, 4.0, 4.0, 9.0, 9.0, 9.0, 9.0, 16.0, 16.0, 16.0, 25.0, 25.0, 25.0,
        ];
        for (i, var) in expected.iter().enumerate() {
            assert_eq!(ekf.q[(i, i)], *var);
        }
        // off-diagonals stay zero
        assert_eq!(ekf.q[(0, 1)], 0.0);
    }

    #[test]
    fn test_measurement_noise_setters() {
        let mut ekf = Ekf::new();
        ekf.set_gps_noise(2.0, 0.5);
        for i in 0..3 {
            assert_eq!(ekf.r_gps[(i, i)], 4.0);
            assert_eq!(ekf.r_gps[(i + 3, i + 3)], 0.25);
        }

        ekf.set_baro_noise(3.0);
        assert_eq!(ekf.r_baro[(0, 0)], 9.0);

        ekf.set_mag_noise(0.2);
        for i in 0..3 {
            assert_relative_eq!(ekf.r_mag[(i, i)], 0.04, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_with_config() {
        let config = FilterConfig {
            process_noise: ProcessNoise {
                pos_std: 0.2,
                vel_std: 0.3,
                att_std: 0.01,
                gyro_bias_std: 0.001,
                accel_bias_std: 0.01,
            },
            sensor_noise: SensorNoise {
                gps_pos_std: 2.0,
                gps_vel_std: 0.2,
                baro_std: 0.5,
                mag_std: 0.05,
            },
            gravity: 9.81,
            earth_mag_ned: Vector3::new(0.2, 0.0, 0.5),
        };
        let ekf = Ekf::with_config(&config);

        assert_relative_eq!(ekf.q[(0, 0)], 0.04, epsilon = 1e-7);
        assert_relative_eq!(ekf.r_gps[(0, 0)], 4.0, epsilon = 1e-7);
        assert_relative_eq!(ekf.r_baro[(0, 0)], 0.25, epsilon = 1e-7);
        assert_eq!(ekf.gravity, 9.81);
        assert_eq!(ekf.earth_magnetic_field(), Vector3::new(0.2, 0.0, 0.5));
        assert!(!ekf.is_initialized());
    }

    #[test]
    fn test_reset() {
        let mut ekf = level_filter();
        ekf.set_baro_noise(2.5);
        ekf.predict(Vector3::new(0.1, 0.0, 0.0), accel_rest(), DT)
            .unwrap();

        ekf.reset();
        assert!(!ekf.is_initialized());
        assert_eq!(ekf.position(), Vector3::zeros());
        // identity quaternion stored in the zeroed state
        assert_eq!(ekf.x[(ATT, 0)], 1.0);
        for (i, expected) in P_RESET_DIAG.iter().enumerate() {
            assert_eq!(ekf.p[(i, i)], *expected);
        }
        // tuned noise survives reset
        assert_eq!(ekf.r_baro[(0, 0)], 2.5 * 2.5);

        assert_eq!(
            ekf.predict(Vector3::zeros(), accel_rest(), DT),
            Err(NavError::NotInitialized)
        );
    }

    #[test]
    fn test_renormalization_degrades_to_identity() {
        let mut ekf = level_filter();
        // force a collapsed quaternion sub-state
        ekf.set_state_quat(&Quaternion::new(0.0, 0.0, 0.0, 0.0));
        ekf.renormalize_attitude();

        assert!(ekf.attitude_degraded());
        assert_eq!(ekf.attitude(), UnitQuaternion::identity());

        // a healthy renormalization clears the flag
        ekf.set_state_quat(&Quaternion::new(2.0, 0.0, 0.0, 0.0));
        ekf.renormalize_attitude();
        assert!(!ekf.attitude_degraded());
        assert_relative_eq!(ekf.state_quat().norm(), 1.0, epsilon = 1e-6);
    }
}
