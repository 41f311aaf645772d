//! Valve channel and pump configuration (`servo_config.yaml`).

use super::{violations, ConfigError, ConfigFile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest admissible pulse value [µs]; also the PCA9685 counter ceiling.
pub const PULSE_LIMIT_US: f64 = 4095.0;

/// Highest output index on the PWM peripheral.
pub const OUTPUT_CHANNEL_MAX: u8 = 15;

fn default_direction() -> i8 {
    1
}

fn default_gamma() -> f64 {
    1.0
}

/// One proportional valve channel.
///
/// The deadband fields describe the physical region around `center` where
/// the valve does not respond; command magnitude is compressed into the
/// working range on either side of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Output index on the PWM peripheral (0..=15, unique incl. pump).
    pub output_channel: u8,
    /// Smallest pulse ever emitted [µs].
    pub pulse_min: u16,
    /// Largest pulse ever emitted [µs].
    pub pulse_max: u16,
    /// Neutral pulse [µs]. Defaults to the midpoint of min/max.
    #[serde(default)]
    pub center: Option<f64>,
    /// Command sign inversion: +1 or -1.
    #[serde(default = "default_direction")]
    pub direction: i8,
    /// Input deadzone as a percentage of full scale [0, 100].
    #[serde(default)]
    pub deadzone: f64,
    /// Deadband above center [µs], at most half the span.
    #[serde(default)]
    pub deadband_us_pos: f64,
    /// Deadband below center [µs], at most half the span.
    #[serde(default)]
    pub deadband_us_neg: f64,
    /// Sinusoidal anti-stiction dither.
    #[serde(default)]
    pub dither_enable: bool,
    /// Dither amplitude [µs], at most a quarter of the span.
    #[serde(default)]
    pub dither_amp_us: f64,
    /// Dither frequency (0, 200] Hz.
    #[serde(default)]
    pub dither_hz: f64,
    /// Slew limiting of the emitted pulse.
    #[serde(default)]
    pub ramp_enable: bool,
    /// Slew limit [µs/s]; must be positive when ramping is enabled.
    #[serde(default)]
    pub ramp_limit: f64,
    /// Command shaping exponent (0, 5].
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Whether this channel's demand contributes to the pump throttle.
    #[serde(default)]
    pub affects_pump: bool,
    /// Whether the channel may be switched by the operator station.
    #[serde(default)]
    pub toggleable: bool,
}

impl ChannelConfig {
    /// Effective neutral pulse [µs].
    pub fn center(&self) -> f64 {
        self.center
            .unwrap_or_else(|| f64::from(self.pulse_min) + self.span() / 2.0)
    }

    /// Full pulse span [µs].
    pub fn span(&self) -> f64 {
        f64::from(self.pulse_max) - f64::from(self.pulse_min)
    }

    /// Working range above the positive deadband edge [µs].
    pub fn working_range_pos(&self) -> f64 {
        f64::from(self.pulse_max) - (self.center() + self.deadband_us_pos)
    }

    /// Working range below the negative deadband edge [µs].
    pub fn working_range_neg(&self) -> f64 {
        (self.center() - self.deadband_us_neg) - f64::from(self.pulse_min)
    }

    fn collect_violations(&self, name: &str, errors: &mut Vec<String>) {
        if self.output_channel > OUTPUT_CHANNEL_MAX {
            errors.push(format!(
                "{name}: output_channel {} exceeds {OUTPUT_CHANNEL_MAX}",
                self.output_channel
            ));
        }
        if f64::from(self.pulse_max) > PULSE_LIMIT_US {
            errors.push(format!("{name}: pulse_max {} exceeds {PULSE_LIMIT_US}", self.pulse_max));
        }
        if self.pulse_min >= self.pulse_max {
            errors.push(format!(
                "{name}: pulse_min {} must be below pulse_max {}",
                self.pulse_min, self.pulse_max
            ));
        }
        if self.direction != 1 && self.direction != -1 {
            errors.push(format!("{name}: direction must be +1 or -1, got {}", self.direction));
        }
        if !(0.0..=100.0).contains(&self.deadzone) {
            errors.push(format!("{name}: deadzone {} outside [0, 100] %", self.deadzone));
        }
        let center = self.center();
        if center < f64::from(self.pulse_min) || center > f64::from(self.pulse_max) {
            errors.push(format!("{name}: center {center} outside pulse bounds"));
        }
        let half_span = self.span() / 2.0;
        for (label, deadband) in [("deadband_us_pos", self.deadband_us_pos),
                                  ("deadband_us_neg", self.deadband_us_neg)] {
            if deadband < 0.0 || deadband > half_span {
                errors.push(format!("{name}: {label} {deadband} outside [0, span/2]"));
            }
        }
        if center + self.deadband_us_pos > f64::from(self.pulse_max) {
            errors.push(format!("{name}: positive deadband edge exceeds pulse_max"));
        }
        if center - self.deadband_us_neg < f64::from(self.pulse_min) {
            errors.push(format!("{name}: negative deadband edge undercuts pulse_min"));
        }
        if self.dither_enable {
            if self.dither_amp_us < 0.0 || self.dither_amp_us > self.span() / 4.0 {
                errors.push(format!(
                    "{name}: dither_amp_us {} outside [0, span/4]",
                    self.dither_amp_us
                ));
            }
            if !(self.dither_hz > 0.0 && self.dither_hz <= 200.0) {
                errors.push(format!("{name}: dither_hz {} outside (0, 200]", self.dither_hz));
            }
        }
        if self.ramp_enable && self.ramp_limit <= 0.0 {
            errors.push(format!("{name}: ramp_limit must be positive when ramping is enabled"));
        }
        if !(self.gamma > 0.0 && self.gamma <= 5.0) {
            errors.push(format!("{name}: gamma {} outside (0, 5]", self.gamma));
        }
    }
}

/// The single hydraulic pump output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PumpConfig {
    /// Output index on the PWM peripheral (unique incl. channels).
    pub output_channel: u8,
    /// Pulse at throttle -1 [µs]; also the safe-state pulse.
    pub pulse_min: u16,
    /// Pulse at throttle +1 [µs].
    pub pulse_max: u16,
    /// Base throttle with no demand [-1, 0.6].
    pub idle: f64,
    /// Demand-to-throttle gain (0, 1].
    pub multiplier: f64,
}

impl PumpConfig {
    fn collect_violations(&self, errors: &mut Vec<String>) {
        if self.output_channel > OUTPUT_CHANNEL_MAX {
            errors.push(format!(
                "pump: output_channel {} exceeds {OUTPUT_CHANNEL_MAX}",
                self.output_channel
            ));
        }
        if f64::from(self.pulse_max) > PULSE_LIMIT_US {
            errors.push(format!("pump: pulse_max {} exceeds {PULSE_LIMIT_US}", self.pulse_max));
        }
        if self.pulse_min >= self.pulse_max {
            errors.push(format!(
                "pump: pulse_min {} must be below pulse_max {}",
                self.pulse_min, self.pulse_max
            ));
        }
        if !(-1.0..=0.6).contains(&self.idle) {
            errors.push(format!("pump: idle {} outside [-1, 0.6]", self.idle));
        }
        if !(self.multiplier > 0.0 && self.multiplier <= 1.0) {
            errors.push(format!("pump: multiplier {} outside (0, 1]", self.multiplier));
        }
    }
}

/// Complete valve/pump document (`servo_config.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServoConfig {
    /// Pump output block.
    pub pump: PumpConfig,
    /// Named valve channels.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl ServoConfig {
    /// Channel names in stable order, optionally including the pump.
    pub fn channel_names(&self, include_pump: bool) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        if include_pump {
            names.push("pump".to_string());
        }
        names
    }

    /// Output indices currently claimed by channels and the pump.
    pub fn used_outputs(&self) -> Vec<u8> {
        let mut used: Vec<u8> = self.channels.values().map(|c| c.output_channel).collect();
        used.push(self.pump.output_channel);
        used
    }
}

impl ConfigFile for ServoConfig {
    const FILE_NAME: &'static str = "servo_config.yaml";

    fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        self.pump.collect_violations(&mut errors);
        for (name, channel) in &self.channels {
            if name.eq_ignore_ascii_case("pump") {
                errors.push("channel name 'pump' is reserved".to_string());
            }
            channel.collect_violations(name, &mut errors);
        }
        let mut used = self.used_outputs();
        used.sort_unstable();
        for pair in used.windows(2) {
            if pair[0] == pair[1] {
                errors.push(format!("output channel {} assigned more than once", pair[0]));
            }
        }
        violations(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelConfig {
        ChannelConfig {
            output_channel: 1,
            pulse_min: 1000,
            pulse_max: 2000,
            center: Some(1500.0),
            direction: 1,
            deadzone: 0.0,
            deadband_us_pos: 40.0,
            deadband_us_neg: 40.0,
            dither_enable: false,
            dither_amp_us: 0.0,
            dither_hz: 0.0,
            ramp_enable: false,
            ramp_limit: 0.0,
            gamma: 1.0,
            affects_pump: true,
            toggleable: false,
        }
    }

    fn pump() -> PumpConfig {
        PumpConfig {
            output_channel: 0,
            pulse_min: 1100,
            pulse_max: 1900,
            idle: 0.0,
            multiplier: 1.0,
        }
    }

    fn servo() -> ServoConfig {
        let mut channels = BTreeMap::new();
        channels.insert("lift_boom".to_string(), channel());
        ServoConfig { pump: pump(), channels }
    }

    #[test]
    fn valid_config_passes() {
        servo().validate().unwrap();
    }

    #[test]
    fn center_defaults_to_midpoint() {
        let mut c = channel();
        c.center = None;
        assert_eq!(c.center(), 1500.0);
    }

    #[test]
    fn working_ranges_follow_deadbands() {
        let c = channel();
        assert_eq!(c.working_range_pos(), 2000.0 - 1540.0);
        assert_eq!(c.working_range_neg(), 1460.0 - 1000.0);
    }

    #[test]
    fn duplicate_output_channel_rejected() {
        let mut cfg = servo();
        cfg.channels.get_mut("lift_boom").unwrap().output_channel = cfg.pump.output_channel;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_pulse_bounds_rejected() {
        let mut cfg = servo();
        let c = cfg.channels.get_mut("lift_boom").unwrap();
        c.pulse_min = 2000;
        c.pulse_max = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_deadband_rejected() {
        let mut cfg = servo();
        cfg.channels.get_mut("lift_boom").unwrap().deadband_us_pos = 600.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dither_bounds_enforced_only_when_enabled() {
        let mut cfg = servo();
        {
            let c = cfg.channels.get_mut("lift_boom").unwrap();
            c.dither_amp_us = 300.0; // over span/4
            c.dither_hz = 35.0;
        }
        cfg.validate().unwrap();
        cfg.channels.get_mut("lift_boom").unwrap().dither_enable = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn gamma_out_of_range_rejected() {
        let mut cfg = servo();
        cfg.channels.get_mut("lift_boom").unwrap().gamma = 5.5;
        assert!(cfg.validate().is_err());
        cfg.channels.get_mut("lift_boom").unwrap().gamma = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reserved_pump_name_rejected() {
        let mut cfg = servo();
        cfg.channels.insert("Pump".to_string(), channel());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pump_idle_bounds() {
        let mut cfg = servo();
        cfg.pump.idle = 0.7;
        assert!(cfg.validate().is_err());
        cfg.pump.idle = -1.0;
        cfg.validate().unwrap();
    }
}
