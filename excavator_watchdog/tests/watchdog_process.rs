//! # Watchdog Process Tests
//!
//! Drives the real watchdog binary against a scripted "main process"
//! (a plain `sleep`) and the shared heartbeat channel. The PWM
//! peripheral is absent on build machines, so the safe-state path is
//! exercised up to the point where the bus open fails; what these
//! tests pin down is the supervision behavior itself: shutdown tokens,
//! stall detection and the kill of the supervised process.

use excavator_common::config::servo::{ChannelConfig, PumpConfig, ServoConfig};
use excavator_common::config::ConfigFile;
use excavator_common::heartbeat::{CellId, HeartbeatChannel};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

fn watchdog_bin() -> &'static str {
    env!("CARGO_BIN_EXE_excavator_watchdog")
}

fn seed_servo_config(dir: &Path) {
    let mut channels = BTreeMap::new();
    channels.insert(
        "lift_boom".to_string(),
        ChannelConfig {
            output_channel: 1,
            pulse_min: 1000,
            pulse_max: 2000,
            center: Some(1500.0),
            direction: 1,
            deadzone: 0.0,
            deadband_us_pos: 40.0,
            deadband_us_neg: 40.0,
            dither_enable: false,
            dither_amp_us: 0.0,
            dither_hz: 0.0,
            ramp_enable: false,
            ramp_limit: 0.0,
            gamma: 1.0,
            affects_pump: true,
            toggleable: false,
        },
    );
    ServoConfig {
        pump: PumpConfig {
            output_channel: 0,
            pulse_min: 1100,
            pulse_max: 1900,
            idle: 0.0,
            multiplier: 1.0,
        },
        channels,
    }
    .store(dir)
    .unwrap();
}

fn spawn_dummy_main() -> Child {
    Command::new("sleep").arg("60").spawn().expect("spawn dummy main process")
}

fn spawn_watchdog(channel: &Path, config_dir: &Path, pid: u32, rate: f64) -> Child {
    Command::new(watchdog_bin())
        .arg("--pid")
        .arg(pid.to_string())
        .arg("--channel")
        .arg(channel)
        .arg("--config-dir")
        .arg(config_dir)
        .arg("--rate-threshold")
        .arg(rate.to_string())
        .spawn()
        .expect("spawn watchdog")
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn shutdown_token_exits_cleanly_without_killing_main() {
    let dir = tempfile::tempdir().unwrap();
    seed_servo_config(dir.path());
    let channel_path = dir.path().join("wd_channel");
    let channel = HeartbeatChannel::create(&channel_path).unwrap();

    let mut main = spawn_dummy_main();
    let mut watchdog = spawn_watchdog(&channel_path, dir.path(), main.id(), 10.0);

    // Keep the heartbeat warm, then request shutdown.
    channel.push(CellId::PwmToWd);
    std::thread::sleep(Duration::from_millis(200));
    assert!(channel.push(CellId::Shutdown));

    assert!(
        wait_for_exit(&mut watchdog, Duration::from_secs(3)),
        "watchdog should exit on the shutdown token"
    );
    // The supervised process is untouched.
    assert!(main.try_wait().unwrap().is_none(), "main must still be running");
    main.kill().unwrap();
    main.wait().unwrap();
}

#[test]
fn heartbeat_stall_kills_the_supervised_process() {
    let dir = tempfile::tempdir().unwrap();
    seed_servo_config(dir.path());
    let channel_path = dir.path().join("wd_channel");
    let _channel = HeartbeatChannel::create(&channel_path).unwrap();

    let mut main = spawn_dummy_main();
    // 10 Hz threshold → 1 s stall window; no heartbeats ever arrive.
    let mut watchdog = spawn_watchdog(&channel_path, dir.path(), main.id(), 10.0);

    assert!(
        wait_for_exit(&mut watchdog, Duration::from_secs(10)),
        "watchdog should run its safe-state path and exit"
    );
    assert!(
        wait_for_exit(&mut main, Duration::from_secs(2)),
        "supervised process should have been killed"
    );
}

#[test]
fn dead_main_process_triggers_safe_state_exit() {
    let dir = tempfile::tempdir().unwrap();
    seed_servo_config(dir.path());
    let channel_path = dir.path().join("wd_channel");
    let channel = HeartbeatChannel::create(&channel_path).unwrap();

    let mut main = spawn_dummy_main();
    let mut watchdog = spawn_watchdog(&channel_path, dir.path(), main.id(), 2.0);

    // Main dies outright; heartbeats keep flowing until then.
    channel.push(CellId::PwmToWd);
    main.kill().unwrap();
    main.wait().unwrap();

    assert!(
        wait_for_exit(&mut watchdog, Duration::from_secs(15)),
        "watchdog should notice the dead PID and exit"
    );
}

#[test]
fn watchdog_acknowledges_over_the_channel() {
    let dir = tempfile::tempdir().unwrap();
    seed_servo_config(dir.path());
    let channel_path = dir.path().join("wd_channel");
    let channel = HeartbeatChannel::create(&channel_path).unwrap();

    let mut main = spawn_dummy_main();
    // 2 Hz threshold → 5 s window, 2.5 s wake cadence.
    let mut watchdog = spawn_watchdog(&channel_path, dir.path(), main.id(), 2.0);

    let deadline = Instant::now() + Duration::from_secs(8);
    let mut acked = false;
    while Instant::now() < deadline {
        channel.push(CellId::PwmToWd);
        if channel.pop(CellId::WdToPwm).is_some() {
            acked = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    assert!(acked, "watchdog should acknowledge via the wd→pwm cell");

    channel.push(CellId::Shutdown);
    wait_for_exit(&mut watchdog, Duration::from_secs(5));
    main.kill().unwrap();
    main.wait().unwrap();
}
