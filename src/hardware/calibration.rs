//! Attenuator transmission calibration.
//!
//! The variable attenuator is driven by angle, but operators think in percent
//! transmission. The measured curve is a logistic fit:
//!
//! ```text
//! percent = 100 * L / (1 + exp(-k * (angle - x0)))
//! angle   = x0 - ln(100 * L / percent - 1) / k
//! ```

use serde::{Deserialize, Serialize};

/// Logistic fit between attenuator angle and transmission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttenuatorCalibration {
    /// Midpoint angle in degrees.
    pub x0: f64,
    /// Slope (negative: transmission falls as the angle grows).
    pub k: f64,
    /// Asymptotic maximum transmission, as a fraction.
    pub l: f64,
    /// Lower mechanical limit in degrees.
    pub min_angle: f64,
    /// Upper mechanical limit in degrees.
    pub max_angle: f64,
    /// Angular resolution of the device in degrees.
    pub resolution: f64,
}

impl Default for AttenuatorCalibration {
    fn default() -> Self {
        Self {
            x0: 28.1336,
            k: -0.288186,
            l: 0.994308,
            min_angle: 0.0,
            max_angle: 45.0,
            resolution: 0.1,
        }
    }
}

impl AttenuatorCalibration {
    /// Transmission in percent at `angle` degrees.
    pub fn percent_at(&self, angle: f64) -> f64 {
        100.0 * self.l / (1.0 + (-self.k * (angle - self.x0)).exp())
    }

    /// Angle that yields `percent`, clamped to the mechanical range and
    /// snapped to the device resolution.
    ///
    /// Requests at or beyond the asymptotes map to the range limits.
    pub fn angle_for(&self, percent: f64) -> f64 {
        let ratio = 100.0 * self.l / percent - 1.0;
        let raw = if percent <= 0.0 || !ratio.is_finite() {
            self.angle_for_extreme(false)
        } else if ratio <= 0.0 {
            self.angle_for_extreme(true)
        } else {
            self.x0 - ratio.ln() / self.k
        };
        self.quantize_angle(raw.clamp(self.min_angle, self.max_angle))
    }

    /// Transmission the device will actually produce when asked for `percent`.
    pub fn achievable_percent(&self, percent: f64) -> f64 {
        self.percent_at(self.angle_for(percent))
    }

    /// Snap an angle to the device resolution.
    pub fn quantize_angle(&self, angle: f64) -> f64 {
        if self.resolution <= 0.0 {
            return angle;
        }
        let steps = (angle / self.resolution).round();
        // Round again to kill binary noise such as 12.300000000000001.
        (steps * self.resolution * 1e6).round() / 1e6
    }

    fn angle_for_extreme(&self, full: bool) -> f64 {
        // With k < 0 transmission rises as the angle falls.
        let toward_min = (self.k < 0.0) == full;
        if toward_min {
            self.min_angle
        } else {
            self.max_angle
        }
    }
}
