//! PWM output device: trait, PCA9685 register driver and simulation.

use crate::error::{HalError, HalResult};
use crate::i2c::I2cBus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Number of outputs on the peripheral.
pub const OUTPUT_COUNT: usize = 16;

/// A 16-output PWM peripheral.
///
/// Duty cycles are 16-bit full-scale regardless of the device's native
/// resolution; implementations downscale as needed.
pub trait PwmDevice: Send {
    /// Program the output frequency and bring the device out of sleep.
    fn init(&mut self, frequency_hz: f64) -> HalResult<()>;

    /// Set one output's duty cycle (0..=65535 = 0..100 %).
    fn set_duty(&mut self, channel: u8, duty: u16) -> HalResult<()>;

    /// Output period [µs] implied by the programmed frequency.
    fn period_us(&self) -> f64;
}

// ─── PCA9685 ────────────────────────────────────────────────────────

const MODE1: u8 = 0x00;
const MODE2: u8 = 0x01;
const LED0_ON_L: u8 = 0x06;
const PRESCALE: u8 = 0xFE;

const MODE1_SLEEP: u8 = 0x10;
const MODE1_AUTO_INC: u8 = 0x20;
const MODE1_RESTART: u8 = 0x80;
const MODE2_OUTDRV: u8 = 0x04;

/// Internal oscillator frequency [Hz].
const OSC_HZ: f64 = 25_000_000.0;

/// NXP PCA9685 16-channel 12-bit PWM controller on I²C.
pub struct Pca9685 {
    bus: I2cBus,
    address: u8,
    period_us: f64,
}

impl Pca9685 {
    /// Default I²C address with all address pins low.
    pub const DEFAULT_ADDRESS: u8 = 0x40;

    /// Attach to the device at `address` on `bus`. Call
    /// [`PwmDevice::init`] before emitting pulses.
    pub fn new(bus: I2cBus, address: u8) -> Self {
        Self { bus, address, period_us: 0.0 }
    }
}

impl PwmDevice for Pca9685 {
    fn init(&mut self, frequency_hz: f64) -> HalResult<()> {
        if !(24.0..=1526.0).contains(&frequency_hz) {
            return Err(HalError::PwmSetup(format!(
                "frequency {frequency_hz} Hz outside the PCA9685 range 24..=1526"
            )));
        }
        let prescale = (OSC_HZ / (4096.0 * frequency_hz)).round() as u8 - 1;

        // Prescale can only be written while the oscillator sleeps.
        self.bus.write_reg(self.address, MODE1, MODE1_SLEEP)?;
        self.bus.write_reg(self.address, PRESCALE, prescale)?;
        self.bus.write_reg(self.address, MODE1, MODE1_AUTO_INC)?;
        std::thread::sleep(std::time::Duration::from_millis(5));
        self.bus
            .write_reg(self.address, MODE1, MODE1_RESTART | MODE1_AUTO_INC)?;
        self.bus.write_reg(self.address, MODE2, MODE2_OUTDRV)?;

        self.period_us = 1_000_000.0 / frequency_hz;
        info!(address = self.address, frequency_hz, prescale, "PCA9685 initialized");
        Ok(())
    }

    fn set_duty(&mut self, channel: u8, duty: u16) -> HalResult<()> {
        if usize::from(channel) >= OUTPUT_COUNT {
            return Err(HalError::PwmSetup(format!("channel {channel} out of range")));
        }
        // 16-bit duty → native 12-bit compare value.
        let off = duty >> 4;
        let reg = LED0_ON_L + 4 * channel;
        let frame = [0u8, 0u8, (off & 0xFF) as u8, (off >> 8) as u8];
        self.bus.write_block(self.address, reg, &frame)?;
        debug!(channel, duty, "duty written");
        Ok(())
    }

    fn period_us(&self) -> f64 {
        self.period_us
    }
}

// ─── Simulation backend ─────────────────────────────────────────────

/// Shared observable state of a [`SimPwm`].
#[derive(Default)]
pub struct SimPwmState {
    duties: Mutex<[u16; OUTPUT_COUNT]>,
    failing: AtomicBool,
    initialized: AtomicBool,
}

impl SimPwmState {
    /// Last duty written to `channel`.
    pub fn duty(&self, channel: u8) -> u16 {
        self.duties.lock()[usize::from(channel)]
    }

    /// Make every subsequent write fail (write-failure propagation tests).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether `init` has run.
    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

/// Recording stand-in for the PCA9685, used by tests and `--no-pwm` runs.
pub struct SimPwm {
    state: Arc<SimPwmState>,
    period_us: f64,
}

impl SimPwm {
    /// New simulated device.
    pub fn new() -> Self {
        Self { state: Arc::new(SimPwmState::default()), period_us: 0.0 }
    }

    /// Handle for observing writes after the device moves into a
    /// controller.
    pub fn state(&self) -> Arc<SimPwmState> {
        Arc::clone(&self.state)
    }
}

impl Default for SimPwm {
    fn default() -> Self {
        Self::new()
    }
}

impl PwmDevice for SimPwm {
    fn init(&mut self, frequency_hz: f64) -> HalResult<()> {
        self.period_us = 1_000_000.0 / frequency_hz;
        self.state.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_duty(&mut self, channel: u8, duty: u16) -> HalResult<()> {
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(HalError::Simulated);
        }
        if usize::from(channel) >= OUTPUT_COUNT {
            return Err(HalError::PwmSetup(format!("channel {channel} out of range")));
        }
        self.state.duties.lock()[usize::from(channel)] = duty;
        Ok(())
    }

    fn period_us(&self) -> f64 {
        self.period_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_records_duties() {
        let mut dev = SimPwm::new();
        let state = dev.state();
        dev.init(50.0).unwrap();
        dev.set_duty(3, 12_000).unwrap();
        assert_eq!(state.duty(3), 12_000);
        assert_eq!(state.duty(4), 0);
        assert!((dev.period_us() - 20_000.0).abs() < 1e-9);
    }

    #[test]
    fn sim_failure_injection() {
        let mut dev = SimPwm::new();
        let state = dev.state();
        dev.init(50.0).unwrap();
        state.set_failing(true);
        assert!(matches!(dev.set_duty(0, 1), Err(HalError::Simulated)));
        state.set_failing(false);
        dev.set_duty(0, 1).unwrap();
    }

    #[test]
    fn sim_rejects_out_of_range_channel() {
        let mut dev = SimPwm::new();
        dev.init(50.0).unwrap();
        assert!(dev.set_duty(16, 0).is_err());
    }
}
