//! Orientation tracker configuration (`orientation_tracker_config.yaml`).

use super::{violations, ConfigError, ConfigFile};
use crate::consts::{
    ACCEL_RANGES, DATA_RATES, GYRO_RANGES, TRACKING_RATE_MAX, TRACKING_RATE_MIN,
};
use serde::{Deserialize, Serialize};

/// How the latest attitude estimate is expressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrientationFormat {
    /// Euler angles in radians (3 values).
    EulerRadians,
    /// Euler angles in degrees (3 values).
    #[default]
    EulerDegrees,
    /// Unit quaternion w,x,y,z (4 values).
    Quaternion,
}

impl OrientationFormat {
    /// Number of scalars one sample carries.
    pub const fn len(self) -> usize {
        match self {
            Self::EulerRadians | Self::EulerDegrees => 3,
            Self::Quaternion => 4,
        }
    }

    /// Always false; samples are never empty.
    pub const fn is_empty(self) -> bool {
        false
    }
}

fn default_alpha() -> f64 {
    0.5
}

fn default_tracking_rate() -> u32 {
    104
}

/// IMU sampling and fusion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    /// Gyroscope output data rate [Hz], one of the LSM6DS3 rates.
    pub gyro_data_rate: u32,
    /// Accelerometer output data rate [Hz], one of the LSM6DS3 rates.
    pub accel_data_rate: u32,
    /// Gyroscope full-scale range [dps].
    pub gyro_range: u32,
    /// Accelerometer full-scale range [g].
    pub accel_range: u32,
    /// Fusion loop rate [Hz], 1..=300.
    #[serde(default = "default_tracking_rate")]
    pub tracking_rate: u32,
    /// Enable the sensor's integrated LPF2 accelerometer filter.
    pub enable_lpf2: bool,
    /// Enable the first-order complementary pre-filter in software.
    pub enable_simple_lpf: bool,
    /// Pre-filter coefficient (0, 1).
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Output convention for attitude samples.
    #[serde(default)]
    pub orientation_format: OrientationFormat,
}

impl ConfigFile for TrackerConfig {
    const FILE_NAME: &'static str = "orientation_tracker_config.yaml";

    fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        for (label, rate) in [("gyro_data_rate", self.gyro_data_rate),
                              ("accel_data_rate", self.accel_data_rate)] {
            if !DATA_RATES.contains(&rate) {
                errors.push(format!(
                    "{label} {rate} is not valid, allowed: {}",
                    join(&DATA_RATES)
                ));
            }
        }
        if !GYRO_RANGES.contains(&self.gyro_range) {
            errors.push(format!(
                "gyro_range {} is not valid, allowed: {}",
                self.gyro_range,
                join(&GYRO_RANGES)
            ));
        }
        if !ACCEL_RANGES.contains(&self.accel_range) {
            errors.push(format!(
                "accel_range {} is not valid, allowed: {}",
                self.accel_range,
                join(&ACCEL_RANGES)
            ));
        }
        if !(TRACKING_RATE_MIN..=TRACKING_RATE_MAX).contains(&self.tracking_rate) {
            errors.push(format!(
                "tracking_rate {} outside [{TRACKING_RATE_MIN}, {TRACKING_RATE_MAX}]",
                self.tracking_rate
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            errors.push(format!("alpha {} outside (0, 1)", self.alpha));
        }
        violations(errors)
    }
}

fn join(values: &[u32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrackerConfig {
        TrackerConfig {
            gyro_data_rate: 104,
            accel_data_rate: 104,
            gyro_range: 250,
            accel_range: 2,
            tracking_rate: 100,
            enable_lpf2: false,
            enable_simple_lpf: true,
            alpha: 0.5,
            orientation_format: OrientationFormat::EulerDegrees,
        }
    }

    #[test]
    fn valid_config_passes() {
        config().validate().unwrap();
    }

    #[test]
    fn rejects_off_list_rates_and_ranges() {
        let mut cfg = config();
        cfg.gyro_data_rate = 100;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.accel_range = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_alpha_at_bounds() {
        for alpha in [0.0, 1.0] {
            let mut cfg = config();
            cfg.alpha = alpha;
            assert!(cfg.validate().is_err());
        }
    }

    #[test]
    fn rejects_tracking_rate_out_of_band() {
        let mut cfg = config();
        cfg.tracking_rate = 0;
        assert!(cfg.validate().is_err());
        cfg.tracking_rate = 301;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn format_lengths() {
        assert_eq!(OrientationFormat::EulerRadians.len(), 3);
        assert_eq!(OrientationFormat::Quaternion.len(), 4);
    }
}
