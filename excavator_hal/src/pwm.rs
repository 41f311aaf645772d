//! Valve and pump controller.
//!
//! Owns the PWM device, one [`ChannelState`] per configured channel and
//! the pump throttle computation. All pulse math is delegated to
//! [`crate::pulse`]; this module sequences it and pushes duty cycles to
//! the peripheral.

use crate::error::{HalError, HalResult};
use crate::pca9685::PwmDevice;
use crate::pulse::{self, ChannelState};
use excavator_common::config::servo::ServoConfig;
use excavator_common::config::ConfigFile;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

/// Divisor turning summed channel demand into pump throttle.
const PUMP_DEMAND_DIVISOR: f64 = 10.0;

/// The valve/pump controller.
pub struct PwmController {
    device: Box<dyn PwmDevice>,
    config: ServoConfig,
    states: BTreeMap<String, ChannelState>,
    pump_override: Option<f64>,
    pump_load_bias: f64,
    variable_pump: bool,
    epoch: Instant,
}

impl PwmController {
    /// Initialize the device at `frequency_hz` and drive everything to
    /// the safe state (channels centered, pump at minimum).
    ///
    /// # Errors
    ///
    /// Fails when the config is invalid, the implied PWM period cannot
    /// contain the largest configured pulse, or the peripheral rejects
    /// the setup writes.
    pub fn new(
        mut device: Box<dyn PwmDevice>,
        config: ServoConfig,
        frequency_hz: f64,
    ) -> HalResult<Self> {
        config
            .validate()
            .map_err(|e| HalError::PwmSetup(e.to_string()))?;
        device.init(frequency_hz)?;

        let period_us = device.period_us();
        let widest = config
            .channels
            .values()
            .map(|c| f64::from(c.pulse_max))
            .chain([f64::from(config.pump.pulse_max)])
            .fold(0.0, f64::max);
        if period_us < widest {
            return Err(HalError::PwmSetup(format!(
                "PWM period {period_us} µs shorter than widest pulse {widest} µs"
            )));
        }

        let states = config
            .channels
            .iter()
            .map(|(name, cfg)| (name.clone(), ChannelState::at_center(cfg)))
            .collect();

        let mut controller = Self {
            device,
            config,
            states,
            pump_override: None,
            pump_load_bias: 0.0,
            variable_pump: true,
            epoch: Instant::now(),
        };
        controller.reset(true)?;
        info!("PWM controller started, outputs in safe state");
        Ok(controller)
    }

    /// Apply a named command map.
    ///
    /// Unknown channel names are logged and skipped. With `zero_unnamed`
    /// every configured channel absent from the map is driven to zero;
    /// otherwise absent channels keep their last pulse. When
    /// `one_shot_pump_override` is set, a `pump` entry in the map becomes
    /// the throttle for exactly this cycle.
    ///
    /// # Errors
    ///
    /// Only a peripheral write failure is an error; it must propagate so
    /// the coordinator can tear the operation down.
    pub fn apply_commands(
        &mut self,
        commands: &BTreeMap<String, f64>,
        zero_unnamed: bool,
        one_shot_pump_override: bool,
    ) -> HalResult<()> {
        let now_s = self.epoch.elapsed().as_secs_f64();

        for name in commands.keys() {
            if name != "pump" && !self.config.channels.contains_key(name) {
                warn!(channel = %name, "command for unknown channel skipped");
            }
        }
        if one_shot_pump_override {
            if let Some(value) = commands.get("pump") {
                self.pump_override = Some(value.clamp(-1.0, 1.0));
            }
        }

        let names: Vec<String> = self.config.channels.keys().cloned().collect();
        for name in names {
            let value = match commands.get(&name) {
                Some(v) => *v,
                None if zero_unnamed => 0.0,
                None => continue,
            };
            self.drive_channel(&name, value, now_s)?;
        }

        self.update_pump()
    }

    fn drive_channel(&mut self, name: &str, value: f64, now_s: f64) -> HalResult<()> {
        let cfg = &self.config.channels[name];
        let Some(state) = self.states.get_mut(name) else {
            return Ok(());
        };
        let pulse = pulse::shape_pulse(cfg, state, value, now_s);
        let duty = pulse::duty_from_pulse(pulse, self.device.period_us());
        self.device.set_duty(cfg.output_channel, duty)
    }

    /// Recompute and write the pump output for this cycle.
    fn update_pump(&mut self) -> HalResult<()> {
        let pump = &self.config.pump;
        let throttle = match self.pump_override.take() {
            Some(value) => value,
            None => {
                let base = if self.variable_pump {
                    let demand: f64 = self
                        .config
                        .channels
                        .iter()
                        .filter(|(_, c)| c.affects_pump)
                        .map(|(name, _)| self.states[name].last_value.abs())
                        .sum();
                    pump.idle + pump.multiplier * demand / PUMP_DEMAND_DIVISOR
                } else {
                    pump.idle + pump.multiplier / PUMP_DEMAND_DIVISOR
                };
                base + self.pump_load_bias
            }
        };
        let throttle = throttle.clamp(-1.0, 1.0);
        let duty = pulse::duty_from_pulse(
            pulse::pump_pulse(pump, throttle),
            self.device.period_us(),
        );
        self.device.set_duty(pump.output_channel, duty)
    }

    /// Write every channel's center pulse; with `reset_pump` also the
    /// pump's minimum. Clears any pending one-shot override.
    pub fn reset(&mut self, reset_pump: bool) -> HalResult<()> {
        self.pump_override = None;
        let period_us = self.device.period_us();
        for (name, cfg) in &self.config.channels {
            if let Some(state) = self.states.get_mut(name) {
                state.reset(cfg);
            }
            let duty = pulse::duty_from_pulse(cfg.center(), period_us);
            self.device.set_duty(cfg.output_channel, duty)?;
        }
        if reset_pump {
            let duty =
                pulse::duty_from_pulse(f64::from(self.config.pump.pulse_min), period_us);
            self.device.set_duty(self.config.pump.output_channel, duty)?;
        }
        Ok(())
    }

    /// Soft safe state used by the rate monitor: channels centered, pump
    /// at its idle throttle (not minimum — the engine keeps turning).
    pub fn soft_safe_state(&mut self) -> HalResult<()> {
        self.reset(false)?;
        let duty = pulse::duty_from_pulse(
            pulse::pump_pulse(&self.config.pump, self.config.pump.idle),
            self.device.period_us(),
        );
        self.device.set_duty(self.config.pump.output_channel, duty)
    }

    /// Atomically replace the channel/pump configuration and reset all
    /// runtime state back to safe.
    pub fn reload_config(&mut self, config: ServoConfig) -> HalResult<()> {
        config
            .validate()
            .map_err(|e| HalError::PwmSetup(e.to_string()))?;
        self.config = config;
        self.states = self
            .config
            .channels
            .iter()
            .map(|(name, cfg)| (name.clone(), ChannelState::at_center(cfg)))
            .collect();
        self.reset(true)?;
        info!("PWM configuration reloaded, runtime state reset");
        Ok(())
    }

    /// Preview the pulse a command would produce, without touching the
    /// device or runtime state. Dither is evaluated at t = 0.
    pub fn compute_pulse(&self, channel: &str, value: f64) -> Option<f64> {
        let cfg = self.config.channels.get(channel)?;
        let mut scratch = ChannelState::at_center(cfg);
        Some(pulse::shape_pulse(cfg, &mut scratch, value, 0.0))
    }

    /// Persistent manual pump-load bias added to the computed throttle.
    pub fn set_pump_load_bias(&mut self, bias: f64) {
        self.pump_load_bias = bias.clamp(-1.0, 1.0);
    }

    /// Select demand-tracking (`true`) or fixed-offset pump throttle.
    pub fn set_variable_pump(&mut self, variable: bool) {
        self.variable_pump = variable;
    }

    /// Configured channel names.
    pub fn channel_names(&self) -> Vec<String> {
        self.config.channels.keys().cloned().collect()
    }

    /// Last pulse emitted on `channel` [µs].
    pub fn last_pulse(&self, channel: &str) -> Option<f64> {
        self.states.get(channel).map(|s| s.last_pulse_us)
    }

    /// Current configuration.
    pub fn config(&self) -> &ServoConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pca9685::{SimPwm, SimPwmState};
    use excavator_common::config::servo::{ChannelConfig, PumpConfig};
    use std::sync::Arc;

    fn channel(output: u8) -> ChannelConfig {
        ChannelConfig {
            output_channel: output,
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

    fn servo_config() -> ServoConfig {
        let mut channels = BTreeMap::new();
        channels.insert("lift_boom".to_string(), channel(1));
        channels.insert("tilt_bucket".to_string(), channel(2));
        ServoConfig {
            pump: PumpConfig {
                output_channel: 0,
                pulse_min: 1100,
                pulse_max: 1900,
                idle: 0.0,
                multiplier: 1.0,
            },
            channels,
        }
    }

    fn controller() -> (PwmController, Arc<SimPwmState>) {
        let device = SimPwm::new();
        let state = device.state();
        let ctrl = PwmController::new(Box::new(device), servo_config(), 50.0).unwrap();
        (ctrl, state)
    }

    fn duty(pulse: f64) -> u16 {
        pulse::duty_from_pulse(pulse, 20_000.0)
    }

    #[test]
    fn init_lands_in_safe_state() {
        let (_ctrl, sim) = controller();
        assert_eq!(sim.duty(1), duty(1500.0));
        assert_eq!(sim.duty(2), duty(1500.0));
        assert_eq!(sim.duty(0), duty(1100.0));
    }

    #[test]
    fn apply_named_command_writes_expected_duty() {
        let (mut ctrl, sim) = controller();
        let mut commands = BTreeMap::new();
        commands.insert("lift_boom".to_string(), 0.5);
        ctrl.apply_commands(&commands, true, false).unwrap();

        assert_eq!(sim.duty(1), duty(1770.0));
        assert_eq!(ctrl.last_pulse("lift_boom"), Some(1770.0));
        // invariant: duty equals round(pulse / period * 65535)
        assert_eq!(sim.duty(1), duty(ctrl.last_pulse("lift_boom").unwrap()));
        // unnamed channel zeroed to center
        assert_eq!(sim.duty(2), duty(1500.0));
    }

    #[test]
    fn unknown_channel_is_skipped_not_fatal() {
        let (mut ctrl, _sim) = controller();
        let mut commands = BTreeMap::new();
        commands.insert("no_such_valve".to_string(), 1.0);
        ctrl.apply_commands(&commands, true, false).unwrap();
    }

    #[test]
    fn variable_pump_tracks_demand() {
        let (mut ctrl, sim) = controller();
        let mut commands = BTreeMap::new();
        commands.insert("lift_boom".to_string(), 1.0);
        commands.insert("tilt_bucket".to_string(), -1.0);
        ctrl.apply_commands(&commands, true, false).unwrap();

        // throttle = idle + multiplier * (1 + 1) / 10 = 0.2
        assert_eq!(sim.duty(0), duty(pulse::pump_pulse(&servo_config().pump, 0.2)));
    }

    #[test]
    fn fixed_pump_ignores_demand() {
        let (mut ctrl, sim) = controller();
        ctrl.set_variable_pump(false);
        let mut commands = BTreeMap::new();
        commands.insert("lift_boom".to_string(), 1.0);
        ctrl.apply_commands(&commands, true, false).unwrap();

        // throttle = idle + multiplier / 10 = 0.1
        assert_eq!(sim.duty(0), duty(pulse::pump_pulse(&servo_config().pump, 0.1)));
    }

    #[test]
    fn pump_override_lasts_one_cycle() {
        let (mut ctrl, sim) = controller();
        let mut commands = BTreeMap::new();
        commands.insert("pump".to_string(), 0.8);
        ctrl.apply_commands(&commands, true, true).unwrap();
        assert_eq!(sim.duty(0), duty(pulse::pump_pulse(&servo_config().pump, 0.8)));

        // Next cycle reverts to the computed throttle (all demand zero).
        ctrl.apply_commands(&BTreeMap::new(), true, false).unwrap();
        assert_eq!(sim.duty(0), duty(pulse::pump_pulse(&servo_config().pump, 0.0)));
    }

    #[test]
    fn pump_load_bias_shifts_throttle() {
        let (mut ctrl, sim) = controller();
        ctrl.set_pump_load_bias(0.3);
        ctrl.apply_commands(&BTreeMap::new(), true, false).unwrap();
        assert_eq!(sim.duty(0), duty(pulse::pump_pulse(&servo_config().pump, 0.3)));
    }

    #[test]
    fn reset_restores_safe_state_and_clears_override() {
        let (mut ctrl, sim) = controller();
        let mut commands = BTreeMap::new();
        commands.insert("lift_boom".to_string(), 0.9);
        commands.insert("pump".to_string(), 1.0);
        ctrl.apply_commands(&commands, true, true).unwrap();

        ctrl.reset(true).unwrap();
        assert_eq!(sim.duty(1), duty(1500.0));
        assert_eq!(sim.duty(0), duty(1100.0));
        assert_eq!(ctrl.last_pulse("lift_boom"), Some(1500.0));
    }

    #[test]
    fn soft_safe_state_idles_pump() {
        let (mut ctrl, sim) = controller();
        let mut commands = BTreeMap::new();
        commands.insert("lift_boom".to_string(), 0.9);
        ctrl.apply_commands(&commands, true, false).unwrap();

        ctrl.soft_safe_state().unwrap();
        assert_eq!(sim.duty(1), duty(1500.0));
        assert_eq!(sim.duty(0), duty(pulse::pump_pulse(&servo_config().pump, 0.0)));
    }

    #[test]
    fn device_failure_propagates() {
        let (mut ctrl, sim) = controller();
        sim.set_failing(true);
        let mut commands = BTreeMap::new();
        commands.insert("lift_boom".to_string(), 0.2);
        assert!(ctrl.apply_commands(&commands, true, false).is_err());
    }

    #[test]
    fn reload_replaces_config_and_resets() {
        let (mut ctrl, sim) = controller();
        let mut commands = BTreeMap::new();
        commands.insert("lift_boom".to_string(), 0.9);
        ctrl.apply_commands(&commands, true, false).unwrap();

        let mut new_config = servo_config();
        new_config.channels.get_mut("lift_boom").unwrap().center = Some(1600.0);
        ctrl.reload_config(new_config).unwrap();

        assert_eq!(sim.duty(1), duty(1600.0));
        assert_eq!(ctrl.last_pulse("lift_boom"), Some(1600.0));
    }

    #[test]
    fn compute_pulse_is_pure() {
        let (ctrl, sim) = controller();
        let before = sim.duty(1);
        assert_eq!(ctrl.compute_pulse("lift_boom", 0.5), Some(1770.0));
        assert_eq!(ctrl.compute_pulse("lift_boom", 0.5), Some(1770.0));
        assert_eq!(sim.duty(1), before);
        assert_eq!(ctrl.compute_pulse("missing", 0.5), None);
    }

    #[test]
    fn period_shorter_than_pulse_rejected() {
        let device = SimPwm::new();
        // 1000 Hz → 1000 µs period < 2000 µs pulse_max
        assert!(PwmController::new(Box::new(device), servo_config(), 1000.0).is_err());
    }
}
