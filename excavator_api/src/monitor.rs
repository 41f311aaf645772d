//! Watchdog process handle and command-rate monitor.
//!
//! The daemon side of the safety story: spawns the watchdog OS process,
//! feeds the heartbeat channel, respawns the watchdog when its
//! acknowledgements go silent, and tracks the observed command rate so
//! starvation flips the driver into a soft safe state.

use excavator_common::consts::WATCHDOG_SILENCE_TIMEOUT_S;
use excavator_common::heartbeat::{CellId, HeartbeatChannel};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Environment override for the watchdog binary path (tests, packaging).
pub const WATCHDOG_BIN_ENV: &str = "EXCAVATOR_WATCHDOG_BIN";

// ─── Command-rate monitor ───────────────────────────────────────────

/// EWMA coefficient over inter-command intervals.
const EWMA_ALPHA: f64 = 0.3;

/// How long the implied rate may sit below the threshold before the
/// soft safe state engages.
const STARVATION_TOLERANCE: Duration = Duration::from_secs(2);

/// Fraction of the required rate that re-arms the driver.
const REARM_FRACTION: f64 = 0.25;

/// Verdict of one rate-monitor assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateVerdict {
    /// Commands are flowing at an acceptable rate.
    Healthy,
    /// Starvation detected just now: drive the soft safe state.
    EnterSoftSafe,
    /// Still starved; outputs stay safed.
    SoftSafed,
    /// Rate recovered: normal command application may resume.
    Recover,
}

/// EWMA-based starvation detector for the driving command stream.
pub struct RateMonitor {
    threshold_hz: f64,
    ewma_interval_s: Option<f64>,
    last_arrival: Option<Instant>,
    armed_at: Instant,
    starved_since: Option<Instant>,
    soft_safed: bool,
}

impl RateMonitor {
    /// Monitor expecting commands at `threshold_hz`; 0 disables it.
    pub fn new(threshold_hz: f64, now: Instant) -> Self {
        Self {
            threshold_hz,
            ewma_interval_s: None,
            last_arrival: None,
            armed_at: now,
            starved_since: None,
            soft_safed: false,
        }
    }

    /// Whether rate monitoring is active.
    pub fn enabled(&self) -> bool {
        self.threshold_hz > 0.0
    }

    /// Record one fresh command arrival.
    pub fn note_command(&mut self, now: Instant) {
        if let Some(last) = self.last_arrival {
            let interval = now.duration_since(last).as_secs_f64();
            self.ewma_interval_s = Some(match self.ewma_interval_s {
                Some(ewma) => (1.0 - EWMA_ALPHA) * ewma + EWMA_ALPHA * interval,
                None => interval,
            });
        }
        self.last_arrival = Some(now);
    }

    /// Interval the stream currently implies [s]: the EWMA, stretched
    /// by the gap since the last arrival when the stream has gone quiet.
    fn effective_interval(&self, now: Instant) -> f64 {
        let since_last = now
            .duration_since(self.last_arrival.unwrap_or(self.armed_at))
            .as_secs_f64();
        match self.ewma_interval_s {
            Some(ewma) => ewma.max(since_last),
            None => since_last,
        }
    }

    /// Assess the stream; called once per receiver-loop iteration.
    pub fn assess(&mut self, now: Instant) -> RateVerdict {
        if !self.enabled() {
            return RateVerdict::Healthy;
        }
        let interval = self.effective_interval(now);
        let implied_hz = if interval > 0.0 { 1.0 / interval } else { f64::INFINITY };

        if self.soft_safed {
            if implied_hz >= self.threshold_hz * REARM_FRACTION {
                self.soft_safed = false;
                self.starved_since = None;
                return RateVerdict::Recover;
            }
            return RateVerdict::SoftSafed;
        }

        if implied_hz < self.threshold_hz {
            let since = *self.starved_since.get_or_insert(now);
            if now.duration_since(since) >= STARVATION_TOLERANCE {
                self.soft_safed = true;
                return RateVerdict::EnterSoftSafe;
            }
        } else {
            self.starved_since = None;
        }
        RateVerdict::Healthy
    }
}

// ─── Watchdog process handle ────────────────────────────────────────

/// Owns the watchdog child process and the heartbeat channel.
pub struct WatchdogHandle {
    channel: Arc<HeartbeatChannel>,
    child: Arc<Mutex<Option<Child>>>,
    stop: Arc<AtomicBool>,
    monitor_thread: Option<JoinHandle<()>>,
}

struct SpawnSpec {
    channel_path: PathBuf,
    config_dir: PathBuf,
    rate_threshold: f64,
}

impl WatchdogHandle {
    /// Create the heartbeat channel, spawn the watchdog process and the
    /// silence monitor thread.
    pub fn spawn(
        channel_path: PathBuf,
        config_dir: PathBuf,
        rate_threshold: f64,
    ) -> Result<Self, crate::ApiError> {
        let channel = Arc::new(HeartbeatChannel::create(&channel_path)?);
        let spec = SpawnSpec { channel_path, config_dir, rate_threshold };
        let child = Arc::new(Mutex::new(Some(spawn_watchdog(&spec)?)));

        let stop = Arc::new(AtomicBool::new(false));
        let monitor_thread = {
            let channel = Arc::clone(&channel);
            let child = Arc::clone(&child);
            let stop = Arc::clone(&stop);
            Some(std::thread::spawn(move || silence_monitor(&channel, &child, &stop, &spec)))
        };
        info!("watchdog spawned and monitored");
        Ok(Self { channel, child, stop, monitor_thread })
    }

    /// Drop one liveness token; a full cell means the watchdog has not
    /// consumed the previous one yet, which is fine.
    pub fn beat(&self) {
        let _ = self.channel.push(CellId::PwmToWd);
    }

    /// Ask the watchdog to exit, wait briefly, then force it.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.channel.push(CellId::Shutdown);

        if let Some(mut child) = self.child.lock().take() {
            let deadline = Instant::now() + Duration::from_secs(3);
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(%status, "watchdog exited");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Ok(None) => {
                        warn!("watchdog did not exit in time, killing it");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Err(e) => {
                        warn!("failed to reap watchdog: {e}");
                        break;
                    }
                }
            }
        }
        if let Some(handle) = self.monitor_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watchdog_binary() -> PathBuf {
    if let Ok(path) = std::env::var(WATCHDOG_BIN_ENV) {
        return PathBuf::from(path);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("excavator_watchdog")))
        .unwrap_or_else(|| PathBuf::from("excavator_watchdog"))
}

fn spawn_watchdog(spec: &SpawnSpec) -> std::io::Result<Child> {
    Command::new(watchdog_binary())
        .arg("--pid")
        .arg(std::process::id().to_string())
        .arg("--channel")
        .arg(&spec.channel_path)
        .arg("--config-dir")
        .arg(&spec.config_dir)
        .arg("--rate-threshold")
        .arg(spec.rate_threshold.to_string())
        .spawn()
}

/// Respawns the watchdog when its acknowledgements go silent.
fn silence_monitor(
    channel: &HeartbeatChannel,
    child: &Mutex<Option<Child>>,
    stop: &AtomicBool,
    spec: &SpawnSpec,
) {
    let timeout = Duration::from_secs(WATCHDOG_SILENCE_TIMEOUT_S);
    let mut last_ack = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
        if channel.pop(CellId::WdToPwm).is_some() {
            last_ack = Instant::now();
            continue;
        }
        if last_ack.elapsed() > timeout {
            warn!("watchdog silent, respawning it");
            let mut slot = child.lock();
            if let Some(mut old) = slot.take() {
                let _ = old.kill();
                let _ = old.wait();
            }
            match spawn_watchdog(spec) {
                Ok(new_child) => {
                    *slot = Some(new_child);
                    last_ack = Instant::now();
                }
                Err(e) => error!("failed to respawn watchdog: {e}"),
            }
        }
    }
    debug!("watchdog silence monitor exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn disabled_monitor_is_always_healthy() {
        let base = Instant::now();
        let mut monitor = RateMonitor::new(0.0, base);
        assert_eq!(monitor.assess(advance(base, 60_000)), RateVerdict::Healthy);
    }

    #[test]
    fn healthy_stream_stays_healthy() {
        let base = Instant::now();
        let mut monitor = RateMonitor::new(5.0, base);
        for step in 0..50u64 {
            let now = advance(base, step * 100); // 10 Hz
            monitor.note_command(now);
            assert_eq!(monitor.assess(now), RateVerdict::Healthy, "step {step}");
        }
    }

    #[test]
    fn starvation_enters_soft_safe_after_tolerance() {
        let base = Instant::now();
        let mut monitor = RateMonitor::new(5.0, base);
        for step in 0..20u64 {
            let now = advance(base, step * 100);
            monitor.note_command(now);
            monitor.assess(now);
        }
        // Stream stops. Within tolerance: still healthy.
        assert_eq!(monitor.assess(advance(base, 2500)), RateVerdict::Healthy);
        // One second starved is inside the 2 s window (starved clock
        // starts at first starved assessment).
        assert_eq!(monitor.assess(advance(base, 3400)), RateVerdict::Healthy);
        // Past the tolerance window: safe state engages once.
        assert_eq!(monitor.assess(advance(base, 6000)), RateVerdict::EnterSoftSafe);
        assert_eq!(monitor.assess(advance(base, 7000)), RateVerdict::SoftSafed);
    }

    #[test]
    fn recovery_at_quarter_rate() {
        let base = Instant::now();
        let mut monitor = RateMonitor::new(10.0, base);
        for step in 0..20u64 {
            let now = advance(base, step * 100);
            monitor.note_command(now);
            monitor.assess(now);
        }
        // First starved assessment starts the tolerance clock.
        assert_eq!(monitor.assess(advance(base, 5_000)), RateVerdict::Healthy);
        assert_eq!(monitor.assess(advance(base, 10_000)), RateVerdict::EnterSoftSafe);

        // Commands resume at ~3.3 Hz — above the 2.5 Hz re-arm bar for
        // a 10 Hz threshold, below the threshold itself.
        let mut now = advance(base, 10_000);
        let mut verdicts = Vec::new();
        for _ in 0..30 {
            now += Duration::from_millis(300);
            monitor.note_command(now);
            verdicts.push(monitor.assess(now));
        }
        assert!(verdicts.contains(&RateVerdict::Recover), "verdicts: {verdicts:?}");
    }

    #[test]
    fn watchdog_spawn_beat_shutdown() {
        // A stand-in binary that ignores its arguments.
        std::env::set_var(WATCHDOG_BIN_ENV, "/bin/true");
        let dir = tempfile::tempdir().unwrap();
        let mut handle = WatchdogHandle::spawn(
            dir.path().join("wd_channel"),
            dir.path().to_path_buf(),
            1.0,
        )
        .unwrap();
        handle.beat();
        handle.shutdown();
        std::env::remove_var(WATCHDOG_BIN_ENV);
    }
}
