//! IMU sensor access.
//!
//! - [`ImuSensor`] - the adapter trait the fusion loop runs against
//! - [`lsm6ds3`] - the LSM6DS3 register driver
//! - [`ahrs`] - Mahony attitude filter
//! - [`SimImu`] - scripted sensor for tests

use crate::error::{HalError, HalResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod ahrs;
pub mod lsm6ds3;

/// A 6-DoF inertial sensor.
///
/// Rates and ranges must come from the sets in
/// `excavator_common::consts`; implementations reject anything else.
/// The sensor's integrated accelerometer low-pass filter is exposed only
/// through [`ImuSensor::set_integrated_lpf`] — no raw register bits
/// above this trait.
pub trait ImuSensor: Send {
    /// Angular rate [deg/s] on x, y, z.
    fn read_gyro_dps(&mut self) -> HalResult<[f64; 3]>;

    /// Specific force [g] on x, y, z.
    fn read_accel_g(&mut self) -> HalResult<[f64; 3]>;

    /// Program the gyroscope output data rate [Hz].
    fn set_gyro_data_rate(&mut self, hz: u32) -> HalResult<()>;

    /// Program the accelerometer output data rate [Hz].
    fn set_accel_data_rate(&mut self, hz: u32) -> HalResult<()>;

    /// Program the gyroscope full-scale range [dps].
    fn set_gyro_range(&mut self, dps: u32) -> HalResult<()>;

    /// Program the accelerometer full-scale range [g].
    fn set_accel_range(&mut self, g: u32) -> HalResult<()>;

    /// Enable or disable the sensor's integrated low-pass filter.
    fn set_integrated_lpf(&mut self, enabled: bool) -> HalResult<()>;

    /// Whether the integrated low-pass filter is currently enabled.
    fn integrated_lpf_enabled(&mut self) -> HalResult<bool>;
}

// ─── Simulation backend ─────────────────────────────────────────────

/// Shared observable/controllable state of a [`SimImu`].
#[derive(Default)]
pub struct SimImuState {
    gyro_dps: Mutex<[f64; 3]>,
    accel_g: Mutex<[f64; 3]>,
    failing: AtomicBool,
    lpf: AtomicBool,
}

impl SimImuState {
    /// Script the next gyro reading.
    pub fn set_gyro(&self, dps: [f64; 3]) {
        *self.gyro_dps.lock() = dps;
    }

    /// Script the next accel reading.
    pub fn set_accel(&self, g: [f64; 3]) {
        *self.accel_g.lock() = g;
    }

    /// Make every subsequent read fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

/// Scripted IMU used by tests.
pub struct SimImu {
    state: Arc<SimImuState>,
}

impl SimImu {
    /// New simulated sensor reading level and still by default.
    pub fn new() -> Self {
        let state = Arc::new(SimImuState::default());
        state.set_accel([0.0, 0.0, 1.0]);
        Self { state }
    }

    /// Handle for scripting readings after the sensor moves into a loop.
    pub fn state(&self) -> Arc<SimImuState> {
        Arc::clone(&self.state)
    }
}

impl Default for SimImu {
    fn default() -> Self {
        Self::new()
    }
}

impl ImuSensor for SimImu {
    fn read_gyro_dps(&mut self) -> HalResult<[f64; 3]> {
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(HalError::Simulated);
        }
        Ok(*self.state.gyro_dps.lock())
    }

    fn read_accel_g(&mut self) -> HalResult<[f64; 3]> {
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(HalError::Simulated);
        }
        Ok(*self.state.accel_g.lock())
    }

    fn set_gyro_data_rate(&mut self, hz: u32) -> HalResult<()> {
        lsm6ds3::odr_bits(hz).map(|_| ())
    }

    fn set_accel_data_rate(&mut self, hz: u32) -> HalResult<()> {
        lsm6ds3::odr_bits(hz).map(|_| ())
    }

    fn set_gyro_range(&mut self, dps: u32) -> HalResult<()> {
        lsm6ds3::gyro_range_bits(dps).map(|_| ())
    }

    fn set_accel_range(&mut self, g: u32) -> HalResult<()> {
        lsm6ds3::accel_range_bits(g).map(|_| ())
    }

    fn set_integrated_lpf(&mut self, enabled: bool) -> HalResult<()> {
        self.state.lpf.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn integrated_lpf_enabled(&mut self) -> HalResult<bool> {
        Ok(self.state.lpf.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_reads_scripted_values() {
        let mut imu = SimImu::new();
        let state = imu.state();
        state.set_gyro([1.0, 2.0, 3.0]);
        assert_eq!(imu.read_gyro_dps().unwrap(), [1.0, 2.0, 3.0]);
        assert_eq!(imu.read_accel_g().unwrap(), [0.0, 0.0, 1.0]);
    }

    #[test]
    fn sim_failure_injection() {
        let mut imu = SimImu::new();
        imu.state().set_failing(true);
        assert!(imu.read_gyro_dps().is_err());
    }

    #[test]
    fn sim_rejects_off_list_options() {
        let mut imu = SimImu::new();
        assert!(imu.set_gyro_data_rate(100).is_err());
        assert!(imu.set_gyro_data_rate(104).is_ok());
        assert!(imu.set_accel_range(3).is_err());
        assert!(imu.set_accel_range(4).is_ok());
    }

    #[test]
    fn sim_lpf_round_trips() {
        let mut imu = SimImu::new();
        assert!(!imu.integrated_lpf_enabled().unwrap());
        imu.set_integrated_lpf(true).unwrap();
        assert!(imu.integrated_lpf_enabled().unwrap());
    }
}
