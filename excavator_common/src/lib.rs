//! Excavator Common Library
//!
//! Shared constants, configuration loading and the cross-process watchdog
//! heartbeat channel used by the `excavator_api` daemon and the
//! `excavator_watchdog` process.
//!
//! # Module Structure
//!
//! - [`consts`] - System-wide constants (rates, ports, grace periods)
//! - [`config`] - Configuration types, YAML load/store and validation
//! - [`heartbeat`] - Single-slot shared-memory token cells for the watchdog
//! - [`prelude`] - Common re-exports for convenience

pub mod config;
pub mod consts;
pub mod heartbeat;
pub mod prelude;
