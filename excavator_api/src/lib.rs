//! # Excavator Control Daemon
//!
//! The on-vehicle control server of the tele-operated excavator. An
//! operator station opens a WebSocket control session, then either
//! streams joystick vectors over the UDP datagram channel (driving),
//! receives the vehicle's orientation stream (mirroring), or both.
//!
//! # Module Structure
//!
//! - [`coordinator`] - the operation state machine binding everything
//! - [`engine`] - per-subsystem {Idle, Starting, Running, Stopping} cells
//! - [`session`] - UDP datagram session (handshake, CRC framing, liveness)
//! - [`control`] - WebSocket control channel (actions, validation)
//! - [`tracker`] - IMU sampling and orientation fusion loop
//! - [`monitor`] - watchdog process handle and command-rate monitor
//! - [`registry`] - per-subject config registry with busy guards
//! - [`screen`] - status screen boundary trait
//! - [`probes`] - thin host probes (CPU temperature)

pub mod control;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod probes;
pub mod registry;
pub mod screen;
pub mod session;
pub mod tracker;

pub use error::{ApiError, ApiResult};
