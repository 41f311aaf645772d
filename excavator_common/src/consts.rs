//! System-wide constants for the excavator workspace.
//!
//! Single source of truth for rate limits, sensor option sets, ports and
//! shutdown timing. Imported by all crates — no duplication permitted.
//!
//! CRITICAL: `MIN_RATE` and `SHUTDOWN_GRACE_PERIOD_S` are tightly coupled.
//! Every loop socket timeout and sleep interval is bounded by `1/MIN_RATE`,
//! so `SHUTDOWN_GRACE_PERIOD_S` must stay strictly greater than that bound
//! or thread joins may time out on healthy threads.

/// Lowest rate any loop may be configured with [Hz]. 0.1 Hz = one
/// iteration every 10 s, the longest a loop can sleep between stop-event
/// checks.
pub const MIN_RATE: f64 = 0.1;

/// Highest rate any loop may be configured with [Hz].
pub const MAX_RATE: f64 = 300.0;

/// Grace period for joining worker threads on shutdown [s].
pub const SHUTDOWN_GRACE_PERIOD_S: u64 = 11;

/// Cap for the orientation (mirroring) send loop [Hz].
pub const ORIENTATION_SEND_MAX_RATE: f64 = 150.0;

/// Cap for the driving command receive loop [Hz].
pub const COMMAND_RECEIVE_MAX_RATE: f64 = 25.0;

/// Allowed IMU tracking rates [Hz].
pub const TRACKING_RATE_MIN: u32 = 1;
/// Upper bound of the IMU tracking rate [Hz].
pub const TRACKING_RATE_MAX: u32 = 300;

/// Output data rates the LSM6DS3 supports [Hz].
pub const DATA_RATES: [u32; 7] = [104, 208, 416, 833, 1666, 3333, 6666];

/// Gyroscope full-scale ranges [dps].
pub const GYRO_RANGES: [u32; 4] = [250, 500, 1000, 2000];

/// Accelerometer full-scale ranges [g].
pub const ACCEL_RANGES: [u32; 4] = [2, 4, 8, 16];

/// Read counters wrap at this value to avoid unbounded growth.
pub const COUNTER_WRAP: u32 = 65_535;

/// Default control-channel (WebSocket) port. The datagram channel binds
/// to `control_port - 1`.
pub const DEFAULT_CONTROL_PORT: u16 = 5432;

/// Default service-listener TCP port for external datagram helpers.
pub const DEFAULT_SERVICE_LISTENER_PORT: u16 = 7123;

/// Session liveness: fatal if no valid frame for this long [s].
pub const SESSION_LIVENESS_TIMEOUT_S: u64 = 30;

/// Watchdog acknowledgements silent for this long → respawn watchdog [s].
pub const WATCHDOG_SILENCE_TIMEOUT_S: u64 = 25;

/// Minimum watchdog stall window when rate monitoring is off [s].
pub const WATCHDOG_MIN_WINDOW_S: f64 = 10.0;

/// Safe-state retry attempts inside the watchdog.
pub const WATCHDOG_SAFE_STATE_RETRIES: u32 = 3;

/// PCA9685 output frequency [Hz]. Period 20 000 µs comfortably exceeds
/// the largest admissible pulse (4095 µs).
pub const PWM_FREQUENCY_HZ: f64 = 50.0;

/// Screen render-time bounds [s] (exclusive).
pub const RENDER_TIME_MIN_S: f64 = 0.1;
/// Upper screen render-time bound [s] (exclusive).
pub const RENDER_TIME_MAX_S: f64 = 1000.0;
/// Font size bounds [pt] (exclusive).
pub const FONT_SIZE_MIN: i64 = 1;
/// Upper font size bound [pt] (exclusive).
pub const FONT_SIZE_MAX: i64 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_grace_exceeds_slowest_loop() {
        // A join must outlast one full iteration at the slowest rate.
        assert!((SHUTDOWN_GRACE_PERIOD_S as f64) > 1.0 / MIN_RATE);
    }

    #[test]
    fn per_site_rate_caps_within_global_bounds() {
        assert!(ORIENTATION_SEND_MAX_RATE <= MAX_RATE);
        assert!(COMMAND_RECEIVE_MAX_RATE <= MAX_RATE);
        assert!(MIN_RATE < COMMAND_RECEIVE_MAX_RATE);
    }

    #[test]
    fn pwm_period_covers_max_pulse() {
        let period_us = 1_000_000.0 / PWM_FREQUENCY_HZ;
        assert!(period_us >= 4095.0);
    }
}
