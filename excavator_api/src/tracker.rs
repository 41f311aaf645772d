//! IMU sampling and orientation fusion loop.
//!
//! One cooperative thread samples the sensor at the configured tracking
//! rate, optionally applies a first-order complementary pre-filter,
//! feeds the Mahony filter and stores the newest attitude estimate in a
//! single overwrite slot. Config changes take effect on the next
//! iteration without restarting the loop.

use crate::session::FailureHook;
use excavator_common::config::tracker::OrientationFormat;
use excavator_common::config::TrackerConfig;
use excavator_common::consts::COUNTER_WRAP;
use excavator_hal::imu::ahrs::Mahony;
use excavator_hal::imu::ImuSensor;
use excavator_hal::HalResult;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info};

/// Point-in-time tracker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    /// Fusion iterations since the last counter wrap.
    pub read_count: u32,
    /// Iterations that overran their deadline.
    pub missed_deadlines: u32,
    /// missed / read ratio.
    pub read_target_time_miss_rate: f64,
    /// Latest attitude estimate in the configured format.
    pub current_orientation: Option<Vec<f64>>,
}

struct TrackerShared {
    stop: AtomicBool,
    config: Mutex<TrackerConfig>,
    generation: AtomicU64,
    latest: Mutex<Option<Vec<f64>>>,
    read_count: AtomicU32,
    missed: AtomicU32,
}

/// Handle to the running fusion loop.
pub struct OrientationTracker {
    shared: Arc<TrackerShared>,
    thread: Option<JoinHandle<()>>,
}

impl OrientationTracker {
    /// Program the sensor and start the fusion loop.
    pub fn start(
        mut sensor: Box<dyn ImuSensor>,
        config: TrackerConfig,
        fatal: FailureHook,
    ) -> HalResult<Self> {
        apply_sensor_config(sensor.as_mut(), &config)?;

        let shared = Arc::new(TrackerShared {
            stop: AtomicBool::new(false),
            config: Mutex::new(config),
            generation: AtomicU64::new(0),
            latest: Mutex::new(None),
            read_count: AtomicU32::new(0),
            missed: AtomicU32::new(0),
        });
        let loop_shared = Arc::clone(&shared);
        let thread =
            Some(std::thread::spawn(move || fusion_loop(sensor, &loop_shared, &fatal)));
        info!("orientation tracker started");
        Ok(Self { shared, thread })
    }

    /// Swap in a new configuration; the loop picks it up on its next
    /// iteration and reprograms the sensor.
    pub fn reload_config(&self, config: TrackerConfig) {
        *self.shared.config.lock() = config;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        info!("orientation tracker config reloaded");
    }

    /// Latest attitude estimate, in the configured format.
    pub fn orientation(&self) -> Option<Vec<f64>> {
        self.shared.latest.lock().clone()
    }

    /// Statistics snapshot.
    pub fn status(&self) -> TrackerStatus {
        let read_count = self.shared.read_count.load(Ordering::Relaxed);
        let missed = self.shared.missed.load(Ordering::Relaxed);
        let miss_rate =
            if read_count > 0 { f64::from(missed) / f64::from(read_count) } else { 0.0 };
        TrackerStatus {
            read_count,
            missed_deadlines: missed,
            read_target_time_miss_rate: miss_rate,
            current_orientation: self.orientation(),
        }
    }

    /// Stop the loop and join it. Safe to call from the loop thread.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        info!("orientation tracker shut down");
    }
}

impl Drop for OrientationTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_sensor_config(sensor: &mut dyn ImuSensor, config: &TrackerConfig) -> HalResult<()> {
    sensor.set_gyro_data_rate(config.gyro_data_rate)?;
    sensor.set_accel_data_rate(config.accel_data_rate)?;
    sensor.set_gyro_range(config.gyro_range)?;
    sensor.set_accel_range(config.accel_range)?;
    sensor.set_integrated_lpf(config.enable_lpf2)
}

fn fusion_loop(mut sensor: Box<dyn ImuSensor>, shared: &TrackerShared, fatal: &FailureHook) {
    let mut ahrs = Mahony::new();
    let mut prev_gyro = [0.0; 3];
    let mut prev_accel = [0.0; 3];
    let mut last_update = Instant::now();
    let mut seen_generation = shared.generation.load(Ordering::SeqCst);

    while !shared.stop.load(Ordering::SeqCst) {
        let config = shared.config.lock().clone();

        let generation = shared.generation.load(Ordering::SeqCst);
        if generation != seen_generation {
            seen_generation = generation;
            if let Err(e) = apply_sensor_config(sensor.as_mut(), &config) {
                error!("failed to apply tracker config: {e}");
                fatal("imu_configure");
                break;
            }
            debug!("sensor reprogrammed from new config");
        }

        // Rate is re-read every pass so a live reload changes cadence
        // without restarting the loop.
        let period = std::time::Duration::from_secs_f64(1.0 / f64::from(config.tracking_rate));
        let deadline = Instant::now() + period;

        let (gyro, accel) = match (sensor.read_gyro_dps(), sensor.read_accel_g()) {
            (Ok(gyro), Ok(accel)) => (gyro, accel),
            (Err(e), _) | (_, Err(e)) => {
                error!("sensor read error: {e}");
                fatal("imu_read");
                break;
            }
        };

        let (gyro, accel) = if config.enable_simple_lpf {
            let alpha = config.alpha;
            let mut filtered_gyro = [0.0; 3];
            let mut filtered_accel = [0.0; 3];
            for axis in 0..3 {
                filtered_gyro[axis] = (1.0 - alpha) * prev_gyro[axis] + alpha * gyro[axis];
                filtered_accel[axis] = (1.0 - alpha) * prev_accel[axis] + alpha * accel[axis];
            }
            prev_gyro = filtered_gyro;
            prev_accel = filtered_accel;
            (filtered_gyro, filtered_accel)
        } else {
            prev_gyro = gyro;
            prev_accel = accel;
            (gyro, accel)
        };

        let dt = last_update.elapsed().as_secs_f64();
        last_update = Instant::now();
        let gyro_rad = [
            gyro[0].to_radians(),
            gyro[1].to_radians(),
            gyro[2].to_radians(),
        ];
        ahrs.update(dt, gyro_rad, accel);

        let sample = match config.orientation_format {
            OrientationFormat::EulerRadians => {
                let (roll, pitch, yaw) = ahrs.euler();
                vec![roll, pitch, yaw]
            }
            OrientationFormat::EulerDegrees => {
                let (roll, pitch, yaw) = ahrs.euler();
                vec![roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()]
            }
            OrientationFormat::Quaternion => {
                vec![ahrs.q.w, ahrs.q.x, ahrs.q.y, ahrs.q.z]
            }
        };
        *shared.latest.lock() = Some(sample);

        let count = shared.read_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= COUNTER_WRAP {
            shared.read_count.store(0, Ordering::Relaxed);
            shared.missed.store(0, Ordering::Relaxed);
        }

        let now = Instant::now();
        if now < deadline {
            std::thread::sleep(deadline - now);
        } else {
            shared.missed.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!("fusion loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use excavator_hal::imu::SimImu;
    use std::time::Duration;

    fn config() -> TrackerConfig {
        TrackerConfig {
            gyro_data_rate: 104,
            accel_data_rate: 104,
            gyro_range: 250,
            accel_range: 2,
            tracking_rate: 200,
            enable_lpf2: false,
            enable_simple_lpf: false,
            alpha: 0.5,
            orientation_format: OrientationFormat::EulerDegrees,
        }
    }

    fn noop_hook() -> FailureHook {
        Arc::new(|_| {})
    }

    #[test]
    fn produces_samples_at_the_configured_shape() {
        let sensor = SimImu::new();
        let mut tracker =
            OrientationTracker::start(Box::new(sensor), config(), noop_hook()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let sample = tracker.orientation().expect("a sample by now");
        assert_eq!(sample.len(), 3);
        tracker.shutdown();
    }

    #[test]
    fn quaternion_format_has_four_values() {
        let sensor = SimImu::new();
        let mut cfg = config();
        cfg.orientation_format = OrientationFormat::Quaternion;
        let mut tracker = OrientationTracker::start(Box::new(sensor), cfg, noop_hook()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(tracker.orientation().unwrap().len(), 4);
        tracker.shutdown();
    }

    #[test]
    fn level_still_sensor_reads_level() {
        let sensor = SimImu::new();
        let mut tracker =
            OrientationTracker::start(Box::new(sensor), config(), noop_hook()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let sample = tracker.orientation().unwrap();
        assert!(sample[0].abs() < 2.0, "roll {}", sample[0]);
        assert!(sample[1].abs() < 2.0, "pitch {}", sample[1]);
        tracker.shutdown();
    }

    #[test]
    fn read_error_fires_fatal_and_stops_loop() {
        let sensor = SimImu::new();
        let sim = sensor.state();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let hook: FailureHook = Arc::new(move |_| flag.store(true, Ordering::SeqCst));

        let mut tracker = OrientationTracker::start(Box::new(sensor), config(), hook).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        sim.set_failing(true);
        std::thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
        tracker.shutdown();
    }

    #[test]
    fn reload_changes_format_next_iteration() {
        let sensor = SimImu::new();
        let mut tracker =
            OrientationTracker::start(Box::new(sensor), config(), noop_hook()).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut cfg = config();
        cfg.orientation_format = OrientationFormat::Quaternion;
        tracker.reload_config(cfg);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(tracker.orientation().unwrap().len(), 4);
        tracker.shutdown();
    }

    #[test]
    fn status_reports_counters() {
        let sensor = SimImu::new();
        let mut tracker =
            OrientationTracker::start(Box::new(sensor), config(), noop_hook()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let status = tracker.status();
        assert!(status.read_count > 0);
        assert!(status.current_orientation.is_some());
        tracker.shutdown();
    }
}
