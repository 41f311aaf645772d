//! Linux userspace I²C bus access.
//!
//! Thin wrapper over `/dev/i2c-N`: selects the slave address with the
//! `I2C_SLAVE` ioctl and performs register-oriented reads and writes.
//! Both the PCA9685 and the LSM6DS3 use the common
//! write-register-pointer-then-transfer convention.

use crate::error::{HalError, HalResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

/// `ioctl` request selecting the peer address for subsequent transfers.
const I2C_SLAVE: libc::c_ulong = 0x0703;

/// An open I²C bus device node.
pub struct I2cBus {
    file: File,
    bus: u8,
    current_addr: Option<u8>,
}

impl I2cBus {
    /// Open `/dev/i2c-<bus>`.
    pub fn open(bus: u8) -> HalResult<Self> {
        let path = format!("/dev/i2c-{bus}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| HalError::i2c(format!("open {path}"), e))?;
        Ok(Self { file, bus, current_addr: None })
    }

    /// Bus number this handle was opened on.
    pub fn bus_number(&self) -> u8 {
        self.bus
    }

    fn select(&mut self, addr: u8) -> HalResult<()> {
        if self.current_addr == Some(addr) {
            return Ok(());
        }
        let rc = unsafe {
            libc::ioctl(self.file.as_raw_fd(), I2C_SLAVE, libc::c_ulong::from(addr))
        };
        if rc < 0 {
            return Err(HalError::i2c(
                format!("select address {addr:#04x}"),
                std::io::Error::last_os_error(),
            ));
        }
        self.current_addr = Some(addr);
        Ok(())
    }

    /// Write one byte into `reg` of the device at `addr`.
    pub fn write_reg(&mut self, addr: u8, reg: u8, value: u8) -> HalResult<()> {
        self.write_block(addr, reg, &[value])
    }

    /// Write `data` starting at `reg` of the device at `addr`.
    pub fn write_block(&mut self, addr: u8, reg: u8, data: &[u8]) -> HalResult<()> {
        self.select(addr)?;
        let mut frame = Vec::with_capacity(1 + data.len());
        frame.push(reg);
        frame.extend_from_slice(data);
        self.file
            .write_all(&frame)
            .map_err(|e| HalError::i2c(format!("write reg {reg:#04x} @ {addr:#04x}"), e))
    }

    /// Read one byte from `reg` of the device at `addr`.
    pub fn read_reg(&mut self, addr: u8, reg: u8) -> HalResult<u8> {
        let mut buf = [0u8; 1];
        self.read_block(addr, reg, &mut buf)?;
        Ok(buf[0])
    }

    /// Read `buf.len()` bytes starting at `reg` of the device at `addr`.
    ///
    /// Relies on the device's register auto-increment, which both the
    /// PCA9685 (AI bit) and the LSM6DS3 (IF_INC, on by default) provide.
    pub fn read_block(&mut self, addr: u8, reg: u8, buf: &mut [u8]) -> HalResult<()> {
        self.select(addr)?;
        self.file
            .write_all(&[reg])
            .map_err(|e| HalError::i2c(format!("set read pointer {reg:#04x} @ {addr:#04x}"), e))?;
        self.file
            .read_exact(buf)
            .map_err(|e| HalError::i2c(format!("read reg {reg:#04x} @ {addr:#04x}"), e))
    }
}
