//! # INS-EKF - Strapdown inertial navigation filter
//!
//! A 16-state Extended Kalman Filter for strapdown inertial navigation on
//! small airborne or ground vehicles. High-rate gyro and accelerometer
//! samples drive the prediction step; GPS position/velocity, barometric
//! altitude and a three-axis magnetometer provide the aiding corrections.
//!
//! The estimated state lives in a local North-East-Down (NED) tangent frame:
//!
//! - position and velocity in NED (m, m/s)
//! - attitude as a body-to-NED unit quaternion
//! - gyro and accelerometer biases in the body frame
//!
//! ## Design
//!
//! The filter is a pure in-memory state machine: no I/O, no threads, no heap
//! allocation on the hot path. All 16-dimensional algebra runs on a
//! fixed-capacity value-type matrix kernel ([`matrix::Matrix`]); the
//! vector/quaternion layer at the API boundary is [`nalgebra`].
//!
//! ## Usage
//!
//! ```
//! use ins_ekf::Ekf;
//! use nalgebra::{UnitQuaternion, Vector3};
//!
//! let mut ekf = Ekf::new();
//! ekf.set_initial_state(
//!     Vector3::zeros(),
//!     Vector3::zeros(),
//!     UnitQuaternion::identity(),
//! );
//!
//! // 100 Hz IMU: stationary, accelerometer measuring specific force
//! let gyro = Vector3::zeros();
//! let accel = Vector3::new(0.0, 0.0, -9.80665);
//! ekf.predict(gyro, accel, 0.01).unwrap();
//!
//! // GPS fix arrives: position plus velocity in NED
//! ekf.update_gps(Vector3::zeros(), Some(Vector3::zeros())).unwrap();
//!
//! let pos = ekf.position();
//! let (roll, pitch, yaw) = ekf.euler_angles();
//! # let _ = (pos, roll, pitch, yaw);
//! ```

use nalgebra as na;
use thiserror::Error;

pub mod ekf;
pub mod magfield;
pub mod matrix;
pub mod quat;

pub use ekf::Ekf;
pub use matrix::{Matrix, MatrixError};

/// Errors that can occur during filter operation.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum NavError {
    /// Predict/update was called before `set_initial_state`.
    #[error("filter is not initialized")]
    NotInitialized,

    /// Time step was zero, negative or non-finite.
    #[error("invalid time step: {0}")]
    InvalidTimeStep(f32),

    /// The innovation covariance S = H*P*H' + R could not be inverted.
    /// The update was rejected and the filter state is unchanged.
    #[error("innovation covariance is singular")]
    SingularInnovation,

    /// A matrix operation failed.
    #[error("matrix operation failed: {0}")]
    Matrix(#[from] MatrixError),
}

/// Result type for filter operations.
pub type NavResult<T> = Result<T, NavError>;

/// Process noise standard deviations, one per state group.
///
/// Each value is squared into the corresponding diagonal block of Q. Q is
/// treated as a per-second variance model and scaled by dt at every
/// prediction step.
#[derive(Debug, Clone, Copy)]
pub struct ProcessNoise {
    /// Position random walk (m)
    pub pos_std: f32,
    /// Velocity random walk (m/s)
    pub vel_std: f32,
    /// Attitude quaternion diffusion (unitless)
    pub att_std: f32,
    /// Gyro bias random walk (rad/s)
    pub gyro_bias_std: f32,
    /// Accelerometer bias random walk (m/s^2)
    pub accel_bias_std: f32,
}

impl Default for ProcessNoise {
    fn default() -> Self {
        Self {
            pos_std: 0.1,
            vel_std: 0.1,
            att_std: 0.1,
            gyro_bias_std: 0.1,
            accel_bias_std: 0.1,
        }
    }
}

/// Measurement noise standard deviations for the aiding sensors.
#[derive(Debug, Clone, Copy)]
pub struct SensorNoise {
    /// GPS position (m)
    pub gps_pos_std: f32,
    /// GPS velocity (m/s)
    pub gps_vel_std: f32,
    /// Barometric altitude (m)
    pub baro_std: f32,
    /// Magnetometer field components (uT, relative)
    pub mag_std: f32,
}

impl Default for SensorNoise {
    fn default() -> Self {
        Self {
            gps_pos_std: 5.0,
            gps_vel_std: 0.5,
            baro_std: 1.0,
            mag_std: 0.1,
        }
    }
}

/// Configuration for building a filter with [`Ekf::with_config`].
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Process noise parameters
    pub process_noise: ProcessNoise,

    /// Sensor noise parameters
    pub sensor_noise: SensorNoise,

    /// Gravity magnitude along +Z (down) in NED (m/s^2)
    pub gravity: f32,

    /// Earth magnetic field reference expressed in NED
    pub earth_mag_ned: na::Vector3<f32>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            process_noise: ProcessNoise::default(),
            sensor_noise: SensorNoise::default(),
            gravity: ekf::GRAVITY_DEFAULT,
            earth_mag_ned: magfield::default_earth_field_ned(),
        }
    }
}
