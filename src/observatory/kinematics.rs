//! Single-axis motion profiles.
//!
//! Every axis (telescope altitude/azimuth, rotator, dome altitude/azimuth)
//! moves with a bounded acceleration, deceleration and cruise speed. A move
//! short enough never to reach cruise speed follows a triangular profile;
//! longer moves follow a trapezoidal one.

/// Motion limits of one axis, in radians and seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimits {
    pub max_speed: f64,
    pub accel: f64,
    pub decel: f64,
}

impl AxisLimits {
    /// Builds limits from degree-based values.
    pub fn from_degrees(max_speed: f64, accel: f64, decel: f64) -> Self {
        Self {
            max_speed: max_speed.to_radians(),
            accel: accel.to_radians(),
            decel: decel.to_radians(),
        }
    }

    /// Time to travel `distance` radians along this axis.
    pub fn delay(&self, distance: f64) -> f64 {
        kinematic_delay(distance, self.max_speed, self.accel, self.decel).0
    }
}

/// Returns `(delay, signed_peak_speed)` for a move of `distance`.
///
/// The peak speed carries the sign of the distance. A zero distance takes
/// no time and reaches no speed.
pub fn kinematic_delay(distance: f64, max_speed: f64, accel: f64, decel: f64) -> (f64, f64) {
    let d = distance.abs();
    if d == 0.0 {
        return (0.0, 0.0);
    }

    let peak = (2.0 * d / (1.0 / accel + 1.0 / decel)).sqrt();
    if peak <= max_speed {
        return (peak / accel + peak / decel, peak.copysign(distance));
    }

    let d_accel = 0.5 * max_speed * max_speed / accel;
    let d_decel = 0.5 * max_speed * max_speed / decel;
    let d_cruise = d - d_accel - d_decel;
    let delay = max_speed / accel + d_cruise / max_speed + max_speed / decel;
    (delay, max_speed.copysign(distance))
}
