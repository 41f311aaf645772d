//! Prelude module for common re-exports.
//!
//! `use excavator_common::prelude::*;` pulls in the types nearly every
//! consumer needs without listing individual paths.

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ChannelConfig, ConfigError, ConfigFile, PumpConfig, ScreenConfig, ServoConfig,
    TrackerConfig, VehicleConfig,
};
pub use crate::config::tracker::OrientationFormat;

// ─── System constants ───────────────────────────────────────────────
pub use crate::consts::{
    COMMAND_RECEIVE_MAX_RATE, MAX_RATE, MIN_RATE, ORIENTATION_SEND_MAX_RATE,
    SHUTDOWN_GRACE_PERIOD_S,
};

// ─── Watchdog channel ───────────────────────────────────────────────
pub use crate::heartbeat::{monotonic_ns, CellId, HeartbeatChannel, HeartbeatError};
