//! Pure pulse-shaping math for one valve channel.
//!
//! Turns a normalized command in [-1, 1] into a physical pulse width,
//! compressing the command into the working range either side of the
//! valve's deadband so the response stays linear, then optionally slew
//! limiting and dithering. No I/O happens here; time is injected, which
//! keeps every function deterministic and directly testable.

use excavator_common::config::servo::{ChannelConfig, PumpConfig};
use std::f64::consts::PI;

/// Phase spacing between channel dither waves, so simultaneous peaks on
/// the supply rail are avoided.
const DITHER_PHASE_STEP: f64 = PI / 3.0;

/// Per-channel runtime state carried between updates.
#[derive(Debug, Clone)]
pub struct ChannelState {
    /// Last commanded value after clamping [-1, 1].
    pub last_value: f64,
    /// Last emitted pulse [µs].
    pub last_pulse_us: f64,
    /// Monotonic time of the last ramp step [s].
    pub last_update_s: Option<f64>,
    /// Previously observed update interval [s]; bounds dt after stalls.
    pub prev_dt_s: Option<f64>,
}

impl ChannelState {
    /// Fresh state resting at the channel's center pulse.
    pub fn at_center(config: &ChannelConfig) -> Self {
        Self {
            last_value: 0.0,
            last_pulse_us: config.center(),
            last_update_s: None,
            prev_dt_s: None,
        }
    }

    /// Reset to center, dropping ramp history.
    pub fn reset(&mut self, config: &ChannelConfig) {
        *self = Self::at_center(config);
    }
}

/// Shape one command into a pulse width [µs], updating `state`.
///
/// `now_s` is a monotonic timestamp; `output_channel` selects the dither
/// phase.
pub fn shape_pulse(
    config: &ChannelConfig,
    state: &mut ChannelState,
    value: f64,
    now_s: f64,
) -> f64 {
    let value = value.clamp(-1.0, 1.0);
    let signed = value * f64::from(config.direction);
    let threshold = config.deadzone / 100.0;

    let mut pulse = if value.abs() < threshold || signed == 0.0 {
        config.center()
    } else {
        // Gamma shaping preserves the sign, compresses the magnitude.
        let magnitude = value.abs().powf(config.gamma);
        if signed > 0.0 {
            let base = config.center() + config.deadband_us_pos;
            base + magnitude * (f64::from(config.pulse_max) - base)
        } else {
            let base = config.center() - config.deadband_us_neg;
            base - magnitude * (base - f64::from(config.pulse_min))
        }
    };

    if config.ramp_enable {
        pulse = apply_ramp(config, state, pulse, now_s);
    } else {
        state.last_update_s = Some(now_s);
    }

    if config.dither_enable {
        let phase = f64::from(config.output_channel) * DITHER_PHASE_STEP;
        pulse += config.dither_amp_us * (2.0 * PI * config.dither_hz * now_s + phase).sin();
    }

    pulse = pulse.clamp(f64::from(config.pulse_min), f64::from(config.pulse_max));
    state.last_value = if value.abs() < threshold { 0.0 } else { value };
    state.last_pulse_us = pulse;
    pulse
}

/// Slew-limit `target` against the previous pulse.
///
/// dt is clamped to twice the previously observed interval so a stalled
/// loop cannot produce one giant catch-up step.
fn apply_ramp(config: &ChannelConfig, state: &mut ChannelState, target: f64, now_s: f64) -> f64 {
    let pulse = match state.last_update_s {
        None => target,
        Some(last) => {
            let mut dt = (now_s - last).max(0.0);
            if let Some(prev_dt) = state.prev_dt_s {
                dt = dt.min(2.0 * prev_dt);
            }
            state.prev_dt_s = Some((now_s - last).max(0.0));
            let max_step = config.ramp_limit * dt;
            state.last_pulse_us + (target - state.last_pulse_us).clamp(-max_step, max_step)
        }
    };
    state.last_update_s = Some(now_s);
    pulse
}

/// Convert a pulse width to the 16-bit duty value the device expects.
pub fn duty_from_pulse(pulse_us: f64, period_us: f64) -> u16 {
    ((pulse_us / period_us) * 65_535.0).round().clamp(0.0, 65_535.0) as u16
}

/// Pump throttle [-1, 1] → pulse width [µs].
pub fn pump_pulse(config: &PumpConfig, throttle: f64) -> f64 {
    let throttle = throttle.clamp(-1.0, 1.0);
    let span = f64::from(config.pulse_max) - f64::from(config.pulse_min);
    f64::from(config.pulse_min) + span * (throttle + 1.0) / 2.0
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
            affects_pump: false,
            toggleable: false,
        }
    }

    #[test]
    fn deadband_positive_half_command() {
        let cfg = channel();
        let mut state = ChannelState::at_center(&cfg);
        let pulse = shape_pulse(&cfg, &mut state, 0.5, 0.0);
        assert!((pulse - 1770.0).abs() < 1e-9, "got {pulse}");
    }

    #[test]
    fn gamma_two_quarters_the_magnitude() {
        let mut cfg = channel();
        cfg.gamma = 2.0;
        let mut state = ChannelState::at_center(&cfg);
        let pulse = shape_pulse(&cfg, &mut state, 0.5, 0.0);
        assert!((pulse - 1655.0).abs() < 1e-9, "got {pulse}");
    }

    #[test]
    fn deadzone_snaps_to_center() {
        let mut cfg = channel();
        cfg.deadzone = 10.0;
        let mut state = ChannelState::at_center(&cfg);
        let pulse = shape_pulse(&cfg, &mut state, 0.05, 0.0);
        assert_eq!(pulse, 1500.0);
        assert_eq!(state.last_value, 0.0);
    }

    #[test]
    fn negative_command_mirrors_into_lower_range() {
        let cfg = channel();
        let mut state = ChannelState::at_center(&cfg);
        let pulse = shape_pulse(&cfg, &mut state, -0.5, 0.0);
        // base 1460, range 460 below it
        assert!((pulse - 1230.0).abs() < 1e-9, "got {pulse}");
    }

    #[test]
    fn direction_flips_the_side() {
        let mut cfg = channel();
        cfg.direction = -1;
        let mut state = ChannelState::at_center(&cfg);
        let pulse = shape_pulse(&cfg, &mut state, 0.5, 0.0);
        assert!((pulse - 1230.0).abs() < 1e-9, "got {pulse}");
    }

    #[test]
    fn deterministic_with_fixed_time() {
        let mut cfg = channel();
        cfg.dither_enable = true;
        cfg.dither_amp_us = 20.0;
        cfg.dither_hz = 35.0;
        let a = shape_pulse(&cfg, &mut ChannelState::at_center(&cfg), 0.3, 1.25);
        let b = shape_pulse(&cfg, &mut ChannelState::at_center(&cfg), 0.3, 1.25);
        assert_eq!(a, b);
    }

    #[test]
    fn zero_command_rests_at_center() {
        let cfg = channel();
        let mut state = ChannelState::at_center(&cfg);
        assert_eq!(shape_pulse(&cfg, &mut state, 0.0, 0.0), 1500.0);
    }

    #[test]
    fn pulse_always_within_bounds() {
        let mut cfg = channel();
        cfg.dither_enable = true;
        cfg.dither_amp_us = 250.0;
        cfg.dither_hz = 200.0;
        let mut state = ChannelState::at_center(&cfg);
        for step in 0..200 {
            let t = f64::from(step) * 0.01;
            let v = f64::from(step % 21 - 10) / 10.0;
            let pulse = shape_pulse(&cfg, &mut state, v, t);
            assert!((1000.0..=2000.0).contains(&pulse), "pulse {pulse} escaped bounds");
        }
    }

    #[test]
    fn ramp_bounds_step_size() {
        let mut cfg = channel();
        cfg.ramp_enable = true;
        cfg.ramp_limit = 100.0; // µs/s
        let mut state = ChannelState::at_center(&cfg);

        // Establish a baseline interval of 10 ms.
        shape_pulse(&cfg, &mut state, 0.0, 0.0);
        shape_pulse(&cfg, &mut state, 0.0, 0.01);

        let before = state.last_pulse_us;
        let pulse = shape_pulse(&cfg, &mut state, 1.0, 0.02);
        assert!((pulse - before).abs() <= 100.0 * 0.01 + 1e-9);
    }

    #[test]
    fn ramp_clamps_catch_up_after_stall() {
        let mut cfg = channel();
        cfg.ramp_enable = true;
        cfg.ramp_limit = 1000.0;
        let mut state = ChannelState::at_center(&cfg);

        shape_pulse(&cfg, &mut state, 0.0, 0.0);
        shape_pulse(&cfg, &mut state, 0.0, 0.01); // prev_dt = 10 ms

        // A 5 s stall must behave like at most 2 * prev_dt = 20 ms.
        let before = state.last_pulse_us;
        let pulse = shape_pulse(&cfg, &mut state, 1.0, 5.01);
        assert!(
            (pulse - before).abs() <= 1000.0 * 0.02 + 1e-9,
            "step {} exceeds the clamped ramp budget",
            (pulse - before).abs()
        );
    }

    #[test]
    fn duty_conversion_rounds() {
        assert_eq!(duty_from_pulse(1500.0, 20_000.0), (1500.0f64 / 20_000.0 * 65_535.0).round() as u16);
        assert_eq!(duty_from_pulse(0.0, 20_000.0), 0);
    }

    #[test]
    fn pump_pulse_maps_throttle_range() {
        let pump = PumpConfig {
            output_channel: 0,
            pulse_min: 1100,
            pulse_max: 1900,
            idle: 0.0,
            multiplier: 1.0,
        };
        assert_eq!(pump_pulse(&pump, -1.0), 1100.0);
        assert_eq!(pump_pulse(&pump, 1.0), 1900.0);
        assert_eq!(pump_pulse(&pump, 0.0), 1500.0);
        // Out-of-range throttle clamps.
        assert_eq!(pump_pulse(&pump, 3.0), 1900.0);
    }
}
