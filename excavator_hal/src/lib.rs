//! Excavator Hardware Abstraction Layer
//!
//! Pluggable hardware access for the two safety-critical peripherals:
//! the PCA9685 PWM controller driving valves and pump, and the LSM6DS3
//! IMU feeding the orientation fusion loop. Every device sits behind a
//! trait ([`pca9685::PwmDevice`], [`imu::ImuSensor`]) with a Linux I²C
//! implementation and a simulation implementation, so the daemon, the
//! watchdog and the test suite share one code path.
//!
//! # Module Structure
//!
//! - [`i2c`] - `/dev/i2c-N` bus wrapper
//! - [`pca9685`] - PWM device trait, PCA9685 register driver, simulation
//! - [`pulse`] - pure pulse-shaping math (deadband, gamma, ramp, dither)
//! - [`pwm`] - the valve/pump controller built on the above
//! - [`imu`] - IMU sensor trait, LSM6DS3 driver, Mahony AHRS, simulation

pub mod error;
pub mod i2c;
pub mod imu;
pub mod pca9685;
pub mod pulse;
pub mod pwm;

pub use error::{HalError, HalResult};
