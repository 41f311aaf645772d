//! ST LSM6DS3 6-DoF IMU register driver.
//!
//! Register conventions:
//!
//! ```text
//! WHO_AM_I   0x0F  identity, 0x69 (LSM6DS3) or 0x6A (LSM6DS3TR-C)
//! CTRL1_XL   0x10  {ODR_XL[3:0], FS_XL[1:0], ...}
//! CTRL2_G    0x11  {ODR_G[3:0], FS_G[1:0], ...}
//! CTRL3_C    0x12  {BOOT, BDU, ..., IF_INC, ..., SW_RESET}
//! CTRL8_XL   0x17  {LPF2_XL_EN, ...}
//! OUTX_L_G   0x22  gyro  x/y/z, 6 bytes little-endian
//! OUTX_L_XL  0x28  accel x/y/z, 6 bytes little-endian
//! ```
//!
//! Block Data Update and register auto-increment are enabled at init so
//! multi-byte reads are coherent.

use crate::error::{HalError, HalResult};
use crate::i2c::I2cBus;
use tracing::{info, warn};

/// Primary and alternate I²C addresses (SDO pin low/high).
pub const ADDRESSES: [u8; 2] = [0x6A, 0x6B];

const WHO_AM_I: u8 = 0x0F;
const CTRL1_XL: u8 = 0x10;
const CTRL2_G: u8 = 0x11;
const CTRL3_C: u8 = 0x12;
const CTRL8_XL: u8 = 0x17;
const OUTX_L_G: u8 = 0x22;
const OUTX_L_XL: u8 = 0x28;

const CTRL3_BDU: u8 = 0x40;
const CTRL3_IF_INC: u8 = 0x04;
const CTRL8_LPF2_XL_EN: u8 = 0x80;

const WHO_AM_I_LSM6DS3: u8 = 0x69;
const WHO_AM_I_LSM6DS3TRC: u8 = 0x6A;

/// ODR field (bits 7:4 of CTRL1_XL / CTRL2_G) for a rate in Hz.
pub fn odr_bits(hz: u32) -> HalResult<u8> {
    Ok(match hz {
        104 => 0x40,
        208 => 0x50,
        416 => 0x60,
        833 => 0x70,
        1666 => 0x80,
        3333 => 0x90,
        6666 => 0xA0,
        other => return Err(HalError::Unsupported { what: "data rate", value: other }),
    })
}

/// FS_G field (bits 3:2 of CTRL2_G) for a gyro range in dps.
pub fn gyro_range_bits(dps: u32) -> HalResult<u8> {
    Ok(match dps {
        250 => 0x00,
        500 => 0x04,
        1000 => 0x08,
        2000 => 0x0C,
        other => return Err(HalError::Unsupported { what: "gyro range", value: other }),
    })
}

/// FS_XL field (bits 3:2 of CTRL1_XL) for an accel range in g.
/// The encoding is non-monotonic by design of the part.
pub fn accel_range_bits(g: u32) -> HalResult<u8> {
    Ok(match g {
        2 => 0x00,
        16 => 0x04,
        4 => 0x08,
        8 => 0x0C,
        other => return Err(HalError::Unsupported { what: "accel range", value: other }),
    })
}

/// Gyro sensitivity [dps/LSB] for a range.
fn gyro_sensitivity(dps: u32) -> f64 {
    match dps {
        250 => 0.008_75,
        500 => 0.017_50,
        1000 => 0.035,
        _ => 0.070,
    }
}

/// Accel sensitivity [g/LSB] for a range.
fn accel_sensitivity(g: u32) -> f64 {
    match g {
        2 => 0.000_061,
        4 => 0.000_122,
        8 => 0.000_244,
        _ => 0.000_488,
    }
}

/// The LSM6DS3 driver over a Linux I²C bus.
pub struct Lsm6ds3 {
    bus: I2cBus,
    address: u8,
    gyro_odr_bits: u8,
    accel_odr_bits: u8,
    gyro_range_bits: u8,
    accel_range_bits: u8,
    gyro_sensitivity: f64,
    accel_sensitivity: f64,
}

impl Lsm6ds3 {
    /// Probe and configure the sensor at `address`.
    ///
    /// An address outside [`ADDRESSES`] falls back to the default 0x6A
    /// with a warning; an unexpected WHO_AM_I is fatal.
    pub fn new(mut bus: I2cBus, address: u8) -> HalResult<Self> {
        let address = if ADDRESSES.contains(&address) {
            address
        } else {
            warn!(address, "invalid LSM6DS3 address, falling back to 0x6A");
            ADDRESSES[0]
        };

        let identity = bus.read_reg(address, WHO_AM_I)?;
        if identity != WHO_AM_I_LSM6DS3 && identity != WHO_AM_I_LSM6DS3TRC {
            return Err(HalError::UnknownDevice { address, found: identity });
        }

        let mut sensor = Self {
            bus,
            address,
            gyro_odr_bits: odr_bits(104)?,
            accel_odr_bits: odr_bits(104)?,
            gyro_range_bits: gyro_range_bits(250)?,
            accel_range_bits: accel_range_bits(2)?,
            gyro_sensitivity: gyro_sensitivity(250),
            accel_sensitivity: accel_sensitivity(2),
        };
        sensor
            .bus
            .write_reg(address, CTRL3_C, CTRL3_BDU | CTRL3_IF_INC)?;
        sensor.write_ctrl1()?;
        sensor.write_ctrl2()?;
        info!(address, identity, "LSM6DS3 initialized");
        Ok(sensor)
    }

    fn write_ctrl1(&mut self) -> HalResult<()> {
        self.bus.write_reg(
            self.address,
            CTRL1_XL,
            self.accel_odr_bits | self.accel_range_bits,
        )
    }

    fn write_ctrl2(&mut self) -> HalResult<()> {
        self.bus
            .write_reg(self.address, CTRL2_G, self.gyro_odr_bits | self.gyro_range_bits)
    }

    fn read_vector(&mut self, reg: u8, sensitivity: f64) -> HalResult<[f64; 3]> {
        let mut raw = [0u8; 6];
        self.bus.read_block(self.address, reg, &mut raw)?;
        let mut out = [0.0; 3];
        for (i, value) in out.iter_mut().enumerate() {
            let lsb = i16::from_le_bytes([raw[2 * i], raw[2 * i + 1]]);
            *value = f64::from(lsb) * sensitivity;
        }
        Ok(out)
    }
}

impl super::ImuSensor for Lsm6ds3 {
    fn read_gyro_dps(&mut self) -> HalResult<[f64; 3]> {
        self.read_vector(OUTX_L_G, self.gyro_sensitivity)
    }

    fn read_accel_g(&mut self) -> HalResult<[f64; 3]> {
        self.read_vector(OUTX_L_XL, self.accel_sensitivity)
    }

    fn set_gyro_data_rate(&mut self, hz: u32) -> HalResult<()> {
        self.gyro_odr_bits = odr_bits(hz)?;
        self.write_ctrl2()
    }

    fn set_accel_data_rate(&mut self, hz: u32) -> HalResult<()> {
        self.accel_odr_bits = odr_bits(hz)?;
        self.write_ctrl1()
    }

    fn set_gyro_range(&mut self, dps: u32) -> HalResult<()> {
        self.gyro_range_bits = gyro_range_bits(dps)?;
        self.gyro_sensitivity = gyro_sensitivity(dps);
        self.write_ctrl2()
    }

    fn set_accel_range(&mut self, g: u32) -> HalResult<()> {
        self.accel_range_bits = accel_range_bits(g)?;
        self.accel_sensitivity = accel_sensitivity(g);
        self.write_ctrl1()
    }

    fn set_integrated_lpf(&mut self, enabled: bool) -> HalResult<()> {
        let value = if enabled { CTRL8_LPF2_XL_EN } else { 0 };
        self.bus.write_reg(self.address, CTRL8_XL, value)
    }

    fn integrated_lpf_enabled(&mut self) -> HalResult<bool> {
        Ok(self.bus.read_reg(self.address, CTRL8_XL)? & CTRL8_LPF2_XL_EN != 0)
    }
}
