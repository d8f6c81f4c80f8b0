//! One-shot earth magnetic field direction estimation.
//!
//! With the vehicle at rest, the accelerometer pins down the local Down
//! axis, which is enough to express the averaged magnetometer reading in a
//! gravity-aligned NED frame. True north is unobservable from gravity
//! alone, so the horizontal axes are an arbitrary orthogonalization; the
//! filter only needs a consistent unit reference direction for its
//! magnetometer update.

use nalgebra::{Matrix3, Vector3};

use crate::quat::MIN_NORM;

/// Fallback earth field direction in NED, measured at a Seoul-latitude
/// (37.5N, 127E) test bench.
pub fn default_earth_field_ned() -> Vector3<f32> {
    Vector3::new(0.29, -0.05, 0.42)
}

/// Estimate the unit earth-field direction in NED from `N >= 1` pairs of
/// magnetometer and accelerometer samples captured at rest.
///
/// Returns [`default_earth_field_ned`] when the sample slices are empty,
/// have mismatched lengths, or the geometry degenerates (zero-norm mean
/// acceleration, Down parallel to the body y axis).
pub fn estimate_field_ned(
    mag_samples: &[Vector3<f32>],
    accel_samples: &[Vector3<f32>],
) -> Vector3<f32> {
    if mag_samples.is_empty() || mag_samples.len() != accel_samples.len() {
        return default_earth_field_ned();
    }

    let inv_n = 1.0 / mag_samples.len() as f32;
    let mean_mag: Vector3<f32> = mag_samples.iter().sum::<Vector3<f32>>() * inv_n;
    let mean_accel: Vector3<f32> = accel_samples.iter().sum::<Vector3<f32>>() * inv_n;

    // at rest the accelerometer measures -g along Down
    let down = match (-mean_accel).try_normalize(MIN_NORM) {
        Some(d) => d,
        None => return default_earth_field_ned(),
    };

    // arbitrary horizontal seed; only the field *direction* matters
    let east = match down.cross(&Vector3::y()).try_normalize(MIN_NORM) {
        Some(e) => e,
        None => return default_earth_field_ned(),
    };
    let north = match east.cross(&down).try_normalize(MIN_NORM) {
        Some(n) => n,
        None => return default_earth_field_ned(),
    };
    // re-orthogonalize east against the final north/down pair
    let east = match north.cross(&down).try_normalize(MIN_NORM) {
        Some(e) => e,
        None => return default_earth_field_ned(),
    };

    let dcm = Matrix3::new(
        north.x, north.y, north.z, //
        east.x, east.y, east.z, //
        down.x, down.y, down.z,
    );

    match (dcm * mean_mag).try_normalize(MIN_NORM) {
        Some(field) => field,
        None => default_earth_field_ned(),
    }
}
