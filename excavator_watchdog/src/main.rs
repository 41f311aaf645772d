//! # Excavator Safety Watchdog
//!
//! Runs as a **separate OS process** so a hang or crash of the control
//! daemon can never prevent safe-state recovery. The daemon spawns this
//! binary, hands it the heartbeat channel path and its own PID, and then
//! drops a token into the channel on every control iteration.
//!
//! The watchdog wakes every half stall-window and, in order:
//!
//! 1. exits cleanly if a shutdown token arrived,
//! 2. verifies the supervised PID is still alive,
//! 3. consumes at most one heartbeat token,
//! 4. forces the safe state if the last heartbeat is older than the
//!    stall window.
//!
//! The safe-state path kills the supervised process first (it may be
//! holding the I²C bus), waits briefly for the kernel to release the
//! bus, then re-initializes the PWM peripheral and writes every channel
//! to its center and the pump to its minimum.
//!
//! # Usage
//!
//! ```bash
//! excavator_watchdog --pid 4242 --channel /dev/shm/excavator_wd \
//!     --config-dir /home/excavator/config --rate-threshold 1.5
//! ```

#![deny(warnings)]

use clap::Parser;
use excavator_common::config::{ConfigFile, ServoConfig};
use excavator_common::consts::{
    PWM_FREQUENCY_HZ, WATCHDOG_MIN_WINDOW_S, WATCHDOG_SAFE_STATE_RETRIES,
};
use excavator_common::heartbeat::{monotonic_ns, CellId, HeartbeatChannel};
use excavator_hal::i2c::I2cBus;
use excavator_hal::pca9685::Pca9685;
use excavator_hal::pwm::PwmController;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Excavator safety watchdog - forces PWM safe state when the control
/// daemon stalls or dies
#[derive(Parser, Debug)]
#[command(name = "excavator_watchdog")]
#[command(version)]
#[command(about = "Cross-process PWM safety watchdog")]
struct Args {
    /// PID of the supervised control daemon
    #[arg(long)]
    pid: i32,

    /// Path of the heartbeat channel file created by the daemon
    #[arg(long)]
    channel: PathBuf,

    /// Config directory holding servo_config.yaml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Expected command rate [Hz]; 0 disables rate-derived timing
    #[arg(long, default_value_t = 0.0)]
    rate_threshold: f64,

    /// I2C bus number of the PWM peripheral
    #[arg(long, default_value_t = 1)]
    i2c_bus: u8,

    /// I2C address of the PWM peripheral
    #[arg(long, default_value_t = 0x40)]
    pwm_address: u8,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Stall window [s]: ten command periods, or the fixed floor when rate
/// monitoring is off.
fn stall_window_s(rate_threshold: f64) -> f64 {
    if rate_threshold > 0.0 {
        10.0 / rate_threshold
    } else {
        WATCHDOG_MIN_WINDOW_S
    }
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&args) {
        error!("watchdog failed: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let channel = HeartbeatChannel::open(&args.channel)?;
    let window_s = stall_window_s(args.rate_threshold);
    let wake = Duration::from_secs_f64(window_s / 2.0);
    info!(
        pid = args.pid,
        window_s, "watchdog armed, waking every {:.1} s", wake.as_secs_f64()
    );

    let mut last_heartbeat_ns = monotonic_ns();
    loop {
        std::thread::sleep(wake);

        if channel.pop(CellId::Shutdown).is_some() {
            info!("shutdown requested, watchdog exiting");
            return Ok(());
        }

        if !pid_alive(args.pid) {
            warn!(pid = args.pid, "supervised process is gone");
            force_safe_state(args);
            return Ok(());
        }

        if let Some(stamp) = channel.pop(CellId::PwmToWd) {
            last_heartbeat_ns = stamp;
        }

        // Acknowledge so the daemon knows the watchdog itself is alive.
        let _ = channel.push(CellId::WdToPwm);

        let age_s = (monotonic_ns().saturating_sub(last_heartbeat_ns)) as f64 / 1e9;
        if age_s > window_s {
            warn!(age_s, window_s, "heartbeat stalled");
            kill_supervised(args.pid);
            force_safe_state(args);
            return Ok(());
        }
    }
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// The stalled process may still hold the I²C bus; it has to go first.
fn kill_supervised(pid: i32) {
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => info!(pid, "supervised process killed"),
        Err(e) => warn!(pid, "failed to kill supervised process: {e}"),
    }
    // Give the kernel a moment to release the bus file descriptor.
    std::thread::sleep(Duration::from_millis(500));
}

/// Re-initialize the peripheral and drive every output to safety.
///
/// Constructing a [`PwmController`] writes each channel's center and the
/// pump's minimum, which is exactly the safe state.
fn force_safe_state(args: &Args) {
    for attempt in 1..=WATCHDOG_SAFE_STATE_RETRIES {
        match write_safe_state(args) {
            Ok(()) => {
                info!(attempt, "PWM outputs forced to safe state");
                return;
            }
            Err(e) => {
                warn!(attempt, "safe state attempt failed: {e}");
                std::thread::sleep(Duration::from_millis(250));
            }
        }
    }
    error!("all safe state attempts exhausted, outputs may be live");
}

fn write_safe_state(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServoConfig::load(&args.config_dir)?;
    let bus = I2cBus::open(args.i2c_bus)?;
    let device = Pca9685::new(bus, args.pwm_address);
    let _controller = PwmController::new(Box::new(device), config, PWM_FREQUENCY_HZ)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_window_follows_rate() {
        assert_eq!(stall_window_s(2.0), 5.0);
        assert_eq!(stall_window_s(0.5), 20.0);
        // Monitoring off → fixed floor.
        assert_eq!(stall_window_s(0.0), 10.0);
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
        // A PID far past the kernel's pid_max cannot exist.
        assert!(!pid_alive(i32::MAX));
    }
}
