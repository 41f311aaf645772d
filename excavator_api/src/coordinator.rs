//! The operation coordinator.
//!
//! Owns every engine (PWM driver, orientation tracker, datagram
//! session, service listener, watchdog handle, screen) and binds them
//! into the four mutually exclusive operations {None, Mirroring,
//! Driving, Driving+Mirroring}. Public transition entries run a
//! two-phase guard: claim the transition under the state lock, do the
//! blocking work outside it. On abnormal termination of any sub-engine
//! the failure hook runs the stop transition of whatever operation is
//! active.

use crate::control::actions::ChannelKind;
use crate::control::{Action, ActionSink, ClientHandle};
use crate::engine::{Claim, EngineCell};
use crate::monitor::{RateMonitor, RateVerdict, WatchdogHandle};
use crate::probes;
use crate::registry::{ConfigRegistry, RegistryError, Subject};
use crate::screen::{HeadlessScreen, ScreenMessage, StatusScreen};
use crate::session::listener::ServiceListener;
use crate::session::wire::ElementType;
use crate::session::{FailureHook, FrameShape, UdpSession};
use crate::tracker::OrientationTracker;
use crate::{ApiError, ApiResult};
use excavator_common::config::{
    ConfigFile, ScreenConfig, ServoConfig, TrackerConfig, VehicleConfig,
};
use excavator_common::consts::{
    DEFAULT_CONTROL_PORT, DEFAULT_SERVICE_LISTENER_PORT, PWM_FREQUENCY_HZ,
    SHUTDOWN_GRACE_PERIOD_S,
};
use excavator_hal::i2c::I2cBus;
use excavator_hal::imu::lsm6ds3::Lsm6ds3;
use excavator_hal::imu::{ImuSensor, SimImu};
use excavator_hal::pca9685::{Pca9685, PwmDevice, SimPwm, SimPwmState};
use excavator_hal::pwm::PwmController;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Freshness budget applied to received joystick vectors.
const SESSION_MAX_AGE: Duration = Duration::from_secs(5);

/// How long the vehicle waits for the operator's datagram handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Commanded-rate fraction handed to the watchdog and rate monitor.
/// Ten-ish missed frames at the nominal rate count as starvation.
const RATE_THRESHOLD_DIVISOR: f64 = 16.0;

/// The four mutually exclusive operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// No operation active.
    None,
    /// Vehicle streams orientation to the operator.
    Mirroring,
    /// Operator streams joystick vectors to the vehicle.
    Driving,
    /// Both streams at once.
    DrivingAndMirroring,
}

impl Operation {
    /// Wire name of the operation.
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mirroring => "mirroring",
            Self::Driving => "driving",
            Self::DrivingAndMirroring => "driving_and_mirroring",
        }
    }

    const fn started_event(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mirroring => "started_mirroring",
            Self::Driving => "started_driving",
            Self::DrivingAndMirroring => "started_driving_and_mirroring",
        }
    }

    const fn stopped_event(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mirroring => "stopped_mirroring",
            Self::Driving => "stopped_driving",
            Self::DrivingAndMirroring => "stopped_driving_and_mirroring",
        }
    }
}

/// Daemon construction parameters.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Control channel bind address.
    pub control_ip: String,
    /// Control channel port; the datagram channel uses `port - 1`.
    pub control_port: u16,
    /// Companion service-listener port.
    pub service_listener_port: u16,
    /// Directory holding the four YAML config files.
    pub config_dir: PathBuf,
    /// Whether the PWM driver is armed at all.
    pub pwm_enabled: bool,
    /// Substitute simulation devices for all hardware.
    pub simulate: bool,
    /// I²C bus number for PWM and IMU.
    pub i2c_bus: u8,
    /// PCA9685 address.
    pub pwm_address: u8,
    /// LSM6DS3 address.
    pub imu_address: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_ip: "0.0.0.0".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            service_listener_port: DEFAULT_SERVICE_LISTENER_PORT,
            config_dir: PathBuf::from("config"),
            pwm_enabled: true,
            simulate: false,
            i2c_bus: 1,
            pwm_address: Pca9685::DEFAULT_ADDRESS,
            imu_address: 0x6A,
        }
    }
}

#[derive(Default)]
struct OpState {
    current: Operation,
    starting: bool,
    stopping: bool,
    send_rate: Option<f64>,
    receive_rate: Option<f64>,
    channel_names: Vec<String>,
    /// Connection that started the current operation; cleanup paths
    /// that have no connection of their own report through it.
    initiator: Option<ClientHandle>,
}

impl Default for Operation {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Default)]
struct Engines {
    session: Option<UdpSession>,
    tracker: Option<OrientationTracker>,
    pwm: Option<PwmController>,
    listener: Option<ServiceListener>,
    watchdog: Option<WatchdogHandle>,
    screen: Option<Arc<dyn StatusScreen>>,
}

#[derive(Default)]
struct Loops {
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

/// The coordinator.
pub struct Excavator {
    settings: Settings,
    registry: ConfigRegistry,
    state: Mutex<OpState>,
    engines: Mutex<Engines>,
    loops: Mutex<Loops>,
    stop_event: Arc<AtomicBool>,
    session_cell: EngineCell,
    tracker_cell: EngineCell,
    pwm_cell: EngineCell,
    listener_cell: EngineCell,
    screen_cell: EngineCell,
    start_time: Instant,
    self_ref: Mutex<Weak<Excavator>>,
    sim_pwm: Mutex<Option<Arc<SimPwmState>>>,
}

impl Excavator {
    /// Build the coordinator. The vehicle config is loaded eagerly; a
    /// fitted screen starts immediately.
    pub fn new(settings: Settings) -> ApiResult<Arc<Self>> {
        let vehicle = VehicleConfig::load(&settings.config_dir)?;
        let registry = ConfigRegistry::new(settings.config_dir.clone());
        let excavator = Arc::new(Self {
            settings,
            registry,
            state: Mutex::new(OpState::default()),
            engines: Mutex::new(Engines::default()),
            loops: Mutex::new(Loops::default()),
            stop_event: Arc::new(AtomicBool::new(false)),
            session_cell: EngineCell::new("udp_session"),
            tracker_cell: EngineCell::new("orientation_tracker"),
            pwm_cell: EngineCell::new("pwm_controller"),
            listener_cell: EngineCell::new("service_listener"),
            screen_cell: EngineCell::new("screen"),
            start_time: Instant::now(),
            self_ref: Mutex::new(Weak::new()),
            sim_pwm: Mutex::new(None),
        });
        *excavator.self_ref.lock() = Arc::downgrade(&excavator);

        if vehicle.has_screen {
            excavator.start_screen(None);
        }
        info!("coordinator ready");
        Ok(excavator)
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref.lock().upgrade()
    }

    /// Currently active operation.
    pub fn current_operation(&self) -> Operation {
        self.state.lock().current
    }

    /// Simulation PWM observer, present in simulate mode while a
    /// driving operation runs.
    pub fn sim_pwm(&self) -> Option<Arc<SimPwmState>> {
        self.sim_pwm.lock().clone()
    }

    // ─── Transition guards ──────────────────────────────────────────

    /// Two-phase start guard: rejects when another operation is active
    /// or any transition is in flight, else claims the target state.
    fn claim_start(&self, op: Operation, context: &str, client: Option<&ClientHandle>) -> bool {
        let mut state = self.state.lock();
        if state.current != Operation::None {
            let message = format!(
                "Operation: {} already underway stop it first to start a different one.",
                state.current.name()
            );
            warn!("{message}");
            if let Some(client) = client {
                client.send_error(&message, context);
            }
            return false;
        }
        if state.starting || state.stopping {
            warn!(context, "operation transition already in progress");
            if let Some(client) = client {
                client.send_error("Operation already in transition", context);
            }
            return false;
        }
        // Claimed up front so every cleanup path sees the operation.
        state.starting = true;
        state.current = op;
        true
    }

    fn claim_stop(&self, op: Operation, context: &str, client: Option<&ClientHandle>) -> Claim {
        let mut state = self.state.lock();
        if state.current != op {
            if let Some(client) = client {
                client.send_event(op.stopped_event());
            }
            return Claim::AlreadyDone;
        }
        if state.starting || state.stopping {
            warn!(context, "operation transition already in progress");
            if let Some(client) = client {
                client.send_error("Operation already in transition", context);
            }
            return Claim::Busy;
        }
        state.stopping = true;
        Claim::Claimed
    }

    fn finish_start(
        &self,
        op: Operation,
        context: &str,
        client: Option<&ClientHandle>,
        result: ApiResult<()>,
    ) {
        self.state.lock().starting = false;
        match result {
            Ok(()) => {
                let mut state = self.state.lock();
                state.initiator = client.cloned();
                drop(state);
                if let Some(client) = client {
                    client.send_event(op.started_event());
                }
                info!(operation = op.name(), "operation started");
            }
            Err(e) => {
                error!(operation = op.name(), "failed to start: {e}");
                if let Some(client) = client {
                    client.send_error(&format!("Failed to start {}: {e}", op.name()), context);
                }
                self.stop_operation(op, None);
            }
        }
    }

    fn reset_operation_values(&self) {
        let mut state = self.state.lock();
        info!(operation = state.current.name(), "resetting operation values");
        state.current = Operation::None;
        state.starting = false;
        state.stopping = false;
        state.send_rate = None;
        state.receive_rate = None;
        state.channel_names.clear();
        state.initiator = None;
        drop(state);
        self.stop_event.store(false, Ordering::SeqCst);
    }

    /// Failure hook handed to every engine loop: runs the stop
    /// transition of whatever operation is active.
    fn failure_hook(&self) -> FailureHook {
        let weak = self.self_ref.lock().clone();
        Arc::new(move |context: &str| {
            if let Some(excavator) = weak.upgrade() {
                warn!(context, "engine failed, cleaning up the active operation");
                excavator.cleanup_operation();
            }
        })
    }

    /// Stop whatever operation is active. Used by failure hooks and
    /// client-disconnect cleanup.
    pub fn cleanup_operation(&self) {
        match self.current_operation() {
            Operation::None => {}
            Operation::Mirroring => self.stop_mirroring(None),
            Operation::Driving => self.stop_driving(None),
            Operation::DrivingAndMirroring => self.stop_driving_and_mirroring(None),
        }
    }

    // ─── Public operation transitions ───────────────────────────────

    /// Start the mirroring operation.
    pub fn start_mirroring(&self, send_rate: f64, client: Option<&ClientHandle>) {
        let op = Operation::Mirroring;
        if !self.claim_start(op, "start_mirroring", client) {
            return;
        }
        self.state.lock().send_rate = Some(send_rate);
        let result = self.start_mirroring_services(client);
        self.finish_start(op, "start_mirroring", client, result);
    }

    /// Stop the mirroring operation.
    pub fn stop_mirroring(&self, client: Option<&ClientHandle>) {
        self.run_stop(Operation::Mirroring, "stop_mirroring", client);
    }

    /// Start the driving operation.
    pub fn start_driving(
        &self,
        channel_names: Vec<String>,
        receive_rate: f64,
        client: Option<&ClientHandle>,
    ) {
        let op = Operation::Driving;
        if !self.claim_start(op, "start_driving", client) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.receive_rate = Some(receive_rate);
            state.channel_names = channel_names.clone();
        }
        let result = self.start_driving_services(&channel_names, receive_rate, client, false);
        self.finish_start(op, "start_driving", client, result);
    }

    /// Stop the driving operation.
    pub fn stop_driving(&self, client: Option<&ClientHandle>) {
        self.run_stop(Operation::Driving, "stop_driving", client);
    }

    /// Start driving and mirroring simultaneously.
    pub fn start_driving_and_mirroring(
        &self,
        channel_names: Vec<String>,
        receive_rate: f64,
        send_rate: f64,
        client: Option<&ClientHandle>,
    ) {
        let op = Operation::DrivingAndMirroring;
        if !self.claim_start(op, "start_driving_and_mirroring", client) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.receive_rate = Some(receive_rate);
            state.send_rate = Some(send_rate);
            state.channel_names = channel_names.clone();
        }
        let result = self.start_combined_services(&channel_names, receive_rate, client);
        self.finish_start(op, "start_driving_and_mirroring", client, result);
    }

    /// Stop the combined operation.
    pub fn stop_driving_and_mirroring(&self, client: Option<&ClientHandle>) {
        self.run_stop(
            Operation::DrivingAndMirroring,
            "stop_driving_and_mirroring",
            client,
        );
    }

    fn stop_operation(&self, op: Operation, client: Option<&ClientHandle>) {
        match op {
            Operation::None => {}
            Operation::Mirroring => self.stop_mirroring(client),
            Operation::Driving => self.stop_driving(client),
            Operation::DrivingAndMirroring => self.stop_driving_and_mirroring(client),
        }
    }

    /// Shared stop transition: signal, join loops, tear engines down
    /// in reverse startup order, report, reset.
    fn run_stop(&self, op: Operation, context: &str, client: Option<&ClientHandle>) {
        match self.claim_stop(op, context, client) {
            Claim::AlreadyDone | Claim::Busy => return,
            Claim::Claimed => {}
        }
        info!(operation = op.name(), "stopping operation");
        self.stop_event.store(true, Ordering::SeqCst);
        self.join_loops();
        self.stop_pwm();
        self.stop_watchdog();
        self.stop_tracker();
        self.stop_session();
        self.stop_listener();

        let recipient = {
            let state = self.state.lock();
            client.cloned().or_else(|| state.initiator.clone())
        };
        if let Some(recipient) = recipient {
            recipient.send_event(op.stopped_event());
        }
        self.reset_operation_values();
        info!(operation = op.name(), "operation stopped");
    }

    // ─── Service assembly ───────────────────────────────────────────

    fn start_mirroring_services(&self, client: Option<&ClientHandle>) -> ApiResult<()> {
        info!("starting mirroring services...");
        let tracker_config = TrackerConfig::load(&self.settings.config_dir)?;
        let outputs = tracker_config.orientation_format.len() as u16;
        self.start_listener()?;
        self.start_session(
            FrameShape { num_outputs: outputs, num_inputs: 0 },
            Operation::Mirroring,
            client,
        )?;
        self.start_tracker(tracker_config)?;
        self.spawn_sender_loop()?;
        Ok(())
    }

    fn start_driving_services(
        &self,
        channel_names: &[String],
        receive_rate: f64,
        client: Option<&ClientHandle>,
        mirroring_too: bool,
    ) -> ApiResult<()> {
        info!("starting driving services...");
        if !mirroring_too {
            self.start_listener()?;
            self.start_session(
                FrameShape {
                    num_outputs: 0,
                    num_inputs: channel_names.len() as u16,
                },
                Operation::Driving,
                client,
            )?;
        }
        let rate_threshold = receive_rate / RATE_THRESHOLD_DIVISOR;
        if self.settings.pwm_enabled {
            self.start_pwm()?;
            self.start_watchdog(rate_threshold)?;
        }
        self.spawn_receiver_loop(channel_names.to_vec(), receive_rate, rate_threshold)?;
        Ok(())
    }

    fn start_combined_services(
        &self,
        channel_names: &[String],
        receive_rate: f64,
        client: Option<&ClientHandle>,
    ) -> ApiResult<()> {
        info!("starting driving and mirroring services...");
        let tracker_config = TrackerConfig::load(&self.settings.config_dir)?;
        let outputs = tracker_config.orientation_format.len() as u16;
        self.start_listener()?;
        self.start_session(
            FrameShape {
                num_outputs: outputs,
                num_inputs: channel_names.len() as u16,
            },
            Operation::DrivingAndMirroring,
            client,
        )?;
        self.start_tracker(tracker_config)?;
        self.spawn_sender_loop()?;
        self.start_driving_services(channel_names, receive_rate, client, true)?;
        Ok(())
    }

    // ─── Engine lifecycles ──────────────────────────────────────────

    fn start_listener(&self) -> ApiResult<()> {
        match self.listener_cell.begin_start() {
            Claim::AlreadyDone => return Ok(()),
            Claim::Busy => {
                return Err(ApiError::Transition("service listener is transitioning".into()));
            }
            Claim::Claimed => {}
        }
        let result = ServiceListener::start(
            self.settings.service_listener_port,
            "udp_socket",
            self.failure_hook(),
        );
        match result {
            Ok(listener) => {
                self.engines.lock().listener = Some(listener);
                self.listener_cell.commit_start(true);
                Ok(())
            }
            Err(e) => {
                self.listener_cell.commit_start(false);
                Err(e.into())
            }
        }
    }

    fn stop_listener(&self) {
        if self.listener_cell.begin_stop() != Claim::Claimed {
            return;
        }
        if let Some(mut listener) = self.engines.lock().listener.take() {
            listener.close();
        }
        self.listener_cell.commit_stop();
    }

    fn start_session(
        &self,
        shape: FrameShape,
        operation: Operation,
        client: Option<&ClientHandle>,
    ) -> ApiResult<()> {
        match self.session_cell.begin_start() {
            Claim::AlreadyDone => return Ok(()),
            Claim::Busy => {
                return Err(ApiError::Transition("UDP session is transitioning".into()));
            }
            Claim::Claimed => {}
        }
        let result = (|| -> ApiResult<UdpSession> {
            let mut session = UdpSession::server(
                self.settings.control_port - 1,
                shape,
                ElementType::F64,
                SESSION_MAX_AGE,
            )?;
            // Tell the operator the vehicle is ready for the datagram
            // handshake before blocking in the receive.
            if let Some(client) = client {
                client.send_json(&json!({
                    "event": "handshake",
                    "operation": operation.name(),
                }));
            }
            session.handshake(HANDSHAKE_TIMEOUT)?;
            session.start(self.failure_hook())?;
            Ok(session)
        })();
        match result {
            Ok(session) => {
                self.engines.lock().session = Some(session);
                self.session_cell.commit_start(true);
                Ok(())
            }
            Err(e) => {
                self.session_cell.commit_start(false);
                Err(e)
            }
        }
    }

    fn stop_session(&self) {
        if self.session_cell.begin_stop() != Claim::Claimed {
            return;
        }
        if let Some(mut session) = self.engines.lock().session.take() {
            session.close();
        }
        self.session_cell.commit_stop();
    }

    fn start_tracker(&self, config: TrackerConfig) -> ApiResult<()> {
        match self.tracker_cell.begin_start() {
            Claim::AlreadyDone => return Ok(()),
            Claim::Busy => {
                return Err(ApiError::Transition("orientation tracker is transitioning".into()));
            }
            Claim::Claimed => {}
        }
        let result = self
            .make_imu_sensor()
            .and_then(|sensor| {
                OrientationTracker::start(sensor, config, self.failure_hook())
                    .map_err(ApiError::from)
            });
        match result {
            Ok(tracker) => {
                self.engines.lock().tracker = Some(tracker);
                self.tracker_cell.commit_start(true);
                Ok(())
            }
            Err(e) => {
                self.tracker_cell.commit_start(false);
                Err(e)
            }
        }
    }

    fn stop_tracker(&self) {
        if self.tracker_cell.begin_stop() != Claim::Claimed {
            return;
        }
        if let Some(mut tracker) = self.engines.lock().tracker.take() {
            tracker.shutdown();
        }
        self.tracker_cell.commit_stop();
    }

    fn start_pwm(&self) -> ApiResult<()> {
        match self.pwm_cell.begin_start() {
            Claim::AlreadyDone => return Ok(()),
            Claim::Busy => {
                return Err(ApiError::Transition("PWM controller is transitioning".into()));
            }
            Claim::Claimed => {}
        }
        let result = (|| -> ApiResult<PwmController> {
            let config = ServoConfig::load(&self.settings.config_dir)?;
            let device = self.make_pwm_device()?;
            Ok(PwmController::new(device, config, PWM_FREQUENCY_HZ)?)
        })();
        match result {
            Ok(controller) => {
                self.engines.lock().pwm = Some(controller);
                self.pwm_cell.commit_start(true);
                Ok(())
            }
            Err(e) => {
                self.pwm_cell.commit_start(false);
                Err(e)
            }
        }
    }

    fn stop_pwm(&self) {
        if self.pwm_cell.begin_stop() != Claim::Claimed {
            return;
        }
        if let Some(mut pwm) = self.engines.lock().pwm.take() {
            if let Err(e) = pwm.reset(true) {
                error!("failed to reset PWM outputs on stop: {e}");
            }
        }
        *self.sim_pwm.lock() = None;
        self.pwm_cell.commit_stop();
    }

    fn start_watchdog(&self, rate_threshold: f64) -> ApiResult<()> {
        if self.settings.simulate {
            return Ok(());
        }
        let channel_path =
            PathBuf::from(format!("/dev/shm/excavator_wd_{}", std::process::id()));
        let handle = WatchdogHandle::spawn(
            channel_path,
            self.settings.config_dir.clone(),
            rate_threshold,
        )?;
        self.engines.lock().watchdog = Some(handle);
        Ok(())
    }

    fn stop_watchdog(&self) {
        if let Some(mut watchdog) = self.engines.lock().watchdog.take() {
            watchdog.shutdown();
        }
    }

    fn start_screen(&self, client: Option<&ClientHandle>) {
        match self.screen_cell.begin_start() {
            Claim::AlreadyDone => {
                if let Some(client) = client {
                    client.send_event("started_screen");
                }
                return;
            }
            Claim::Busy => {
                if let Some(client) = client {
                    client.send_error("Screen already in transition", "start_screen");
                }
                return;
            }
            Claim::Claimed => {}
        }
        self.engines.lock().screen = Some(Arc::new(HeadlessScreen::default()));
        self.screen_cell.commit_start(true);
        if let Some(client) = client {
            client.send_event("started_screen");
        }
        info!("screen started");
    }

    fn stop_screen(&self, client: Option<&ClientHandle>) {
        match self.screen_cell.begin_stop() {
            Claim::AlreadyDone => {
                if let Some(client) = client {
                    client.send_event("stopped_screen");
                }
                return;
            }
            Claim::Busy => {
                if let Some(client) = client {
                    client.send_error("Screen already in transition", "stop_screen");
                }
                return;
            }
            Claim::Claimed => {}
        }
        self.engines.lock().screen = None;
        self.screen_cell.commit_stop();
        if let Some(client) = client {
            client.send_event("stopped_screen");
        }
        info!("screen stopped");
    }

    fn make_pwm_device(&self) -> ApiResult<Box<dyn PwmDevice>> {
        if self.settings.simulate {
            let device = SimPwm::new();
            *self.sim_pwm.lock() = Some(device.state());
            Ok(Box::new(device))
        } else {
            let bus = I2cBus::open(self.settings.i2c_bus)?;
            Ok(Box::new(Pca9685::new(bus, self.settings.pwm_address)))
        }
    }

    fn make_imu_sensor(&self) -> ApiResult<Box<dyn ImuSensor>> {
        if self.settings.simulate {
            Ok(Box::new(SimImu::new()))
        } else {
            let bus = I2cBus::open(self.settings.i2c_bus)?;
            Ok(Box::new(Lsm6ds3::new(bus, self.settings.imu_address)?))
        }
    }

    // ─── Loop threads ───────────────────────────────────────────────

    fn spawn_sender_loop(&self) -> ApiResult<()> {
        let excavator = self
            .arc()
            .ok_or_else(|| ApiError::Transition("coordinator is shutting down".into()))?;
        let rate = self
            .state
            .lock()
            .send_rate
            .ok_or_else(|| ApiError::Transition("no send rate configured".into()))?;
        let handle = std::thread::spawn(move || sender_loop(&excavator, rate));
        self.loops.lock().sender = Some(handle);
        Ok(())
    }

    fn spawn_receiver_loop(
        &self,
        channel_names: Vec<String>,
        rate: f64,
        rate_threshold: f64,
    ) -> ApiResult<()> {
        let excavator = self
            .arc()
            .ok_or_else(|| ApiError::Transition("coordinator is shutting down".into()))?;
        let handle = std::thread::spawn(move || {
            receiver_loop(&excavator, &channel_names, rate, rate_threshold);
        });
        self.loops.lock().receiver = Some(handle);
        Ok(())
    }

    fn join_loops(&self) {
        let (sender, receiver) = {
            let mut loops = self.loops.lock();
            (loops.sender.take(), loops.receiver.take())
        };
        if let Some(handle) = sender {
            join_with_grace(handle, "mirroring sender");
        }
        if let Some(handle) = receiver {
            join_with_grace(handle, "driving receiver");
        }
    }

    // ─── Status & shutdown ──────────────────────────────────────────

    /// Vehicle-level status document.
    pub fn status(&self) -> Value {
        json!({
            "cpu_temperature": probes::cpu_temperature()
                .map(|t| format!("{t:.1}C"))
                .unwrap_or_else(|| "unavailable".to_string()),
            "current_operation": self.current_operation().name(),
            "uptime": format!("{:.2} minutes", self.start_time.elapsed().as_secs_f64() / 60.0),
        })
    }

    /// Full daemon shutdown: stop the active operation and the screen.
    /// The stop transition already returns PWM outputs to center and
    /// pump to minimum before releasing the peripheral.
    pub fn shutdown(&self) {
        info!("shutting down coordinator...");
        self.cleanup_operation();
        self.stop_screen(None);
        info!("coordinator shut down");
    }
}

fn join_with_grace(handle: JoinHandle<()>, name: &str) {
    if handle.thread().id() == std::thread::current().id() {
        return;
    }
    let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_GRACE_PERIOD_S);
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        error!("{name} loop did not exit within the grace period");
    }
}

/// Deadline-driven orientation sender.
fn sender_loop(excavator: &Arc<Excavator>, rate: f64) {
    info!(rate, "orientation sender loop started");
    let period = Duration::from_secs_f64(1.0 / rate);
    let mut failed: Option<&'static str> = None;

    while !excavator.stop_event.load(Ordering::SeqCst) {
        let deadline = Instant::now() + period;
        {
            let engines = excavator.engines.lock();
            if let (Some(tracker), Some(session)) =
                (engines.tracker.as_ref(), engines.session.as_ref())
            {
                if let Some(orientation) = tracker.orientation() {
                    if let Err(e) = session.send(&orientation) {
                        error!("orientation send failed: {e}");
                        failed = Some("orientation_send");
                    }
                }
            }
        }
        if failed.is_some() {
            break;
        }
        let now = Instant::now();
        if now < deadline {
            std::thread::sleep(deadline - now);
        }
    }
    if let Some(context) = failed {
        let hook = excavator.failure_hook();
        hook(context);
    }
    info!("orientation sender loop stopped");
}

/// 1/rate receiver: pulls the latest session vector and applies it, or
/// all-zero when nothing fresh arrived.
fn receiver_loop(
    excavator: &Arc<Excavator>,
    channel_names: &[String],
    rate: f64,
    rate_threshold: f64,
) {
    info!(rate, "driving receiver loop started");
    let period = Duration::from_secs_f64(1.0 / rate);
    let mut monitor = RateMonitor::new(rate_threshold, Instant::now());
    let mut failed: Option<&'static str> = None;

    while !excavator.stop_event.load(Ordering::SeqCst) {
        let deadline = Instant::now() + period;
        {
            let mut engines = excavator.engines.lock();
            let latest = engines.session.as_ref().and_then(UdpSession::get_latest);

            let mut commands = BTreeMap::new();
            if let Some(values) = &latest {
                for (name, value) in channel_names.iter().zip(values) {
                    commands.insert(name.clone(), *value);
                }
            }

            let now = Instant::now();
            if latest.is_some() {
                monitor.note_command(now);
            }
            if let Some(pwm) = engines.pwm.as_mut() {
                let outcome = match monitor.assess(now) {
                    RateVerdict::EnterSoftSafe => {
                        warn!("command stream starved, entering soft safe state");
                        pwm.soft_safe_state()
                    }
                    RateVerdict::SoftSafed => Ok(()),
                    RateVerdict::Recover => {
                        info!("command stream recovered");
                        pwm.apply_commands(&commands, true, false)
                    }
                    RateVerdict::Healthy => pwm.apply_commands(&commands, true, false),
                };
                if let Err(e) = outcome {
                    error!("PWM write failed: {e}");
                    failed = Some("pwm_write");
                }
            }
            if let Some(watchdog) = engines.watchdog.as_ref() {
                watchdog.beat();
            }
        }
        if failed.is_some() {
            break;
        }
        let now = Instant::now();
        if now < deadline {
            std::thread::sleep(deadline - now);
        }
    }
    if let Some(context) = failed {
        let hook = excavator.failure_hook();
        hook(context);
    }
    info!("driving receiver loop stopped");
}

// ─── Control-channel dispatch ───────────────────────────────────────

impl Excavator {
    fn ensure_idle(&self, client: &ClientHandle, context: &str) -> bool {
        let current = self.current_operation();
        if current != Operation::None {
            client.send_error(
                &format!(
                    "Operation: {} already underway stop it first to start a different one.",
                    current.name()
                ),
                context,
            );
            return false;
        }
        true
    }

    fn send_registry_result(
        &self,
        client: &ClientHandle,
        context: &str,
        subject: Subject,
        result: Result<Value, RegistryError>,
    ) {
        match result {
            Ok(config) => {
                client.send_configuration(subject.target(), context, &config);
            }
            Err(e) => {
                client.send_error(&e.to_string(), context);
            }
        }
    }

    fn handle_get_config(&self, client: &ClientHandle, subject: Subject) {
        let result = match subject {
            Subject::Servo => self.registry.get::<ServoConfig>(subject).and_then(to_value),
            Subject::Tracker => self.registry.get::<TrackerConfig>(subject).and_then(to_value),
            Subject::Screen => self.registry.get::<ScreenConfig>(subject).and_then(to_value),
            Subject::Vehicle => self.registry.get::<VehicleConfig>(subject).and_then(to_value),
        };
        self.send_registry_result(client, "get_config", subject, result);
    }

    fn handle_configure_tracker(&self, client: &ClientHandle, patch: &Value) {
        let context = "configure_orientation_tracker";
        if !self.ensure_idle(client, context) {
            return;
        }
        let result = self
            .registry
            .replace::<TrackerConfig>(Subject::Tracker, patch)
            .and_then(|config| {
                if let Some(tracker) = self.engines.lock().tracker.as_ref() {
                    tracker.reload_config(config.clone());
                }
                to_value(config)
            });
        self.send_registry_result(client, context, Subject::Tracker, result);
    }

    fn handle_configure_screen(&self, client: &ClientHandle, patch: &Value) {
        let context = "configure_screen";
        if !self.ensure_idle(client, context) {
            return;
        }
        let result = self
            .registry
            .replace::<ScreenConfig>(Subject::Screen, patch)
            .and_then(|config| {
                if let Some(screen) = self.engines.lock().screen.as_ref() {
                    screen.reload_config(config.clone());
                }
                to_value(config)
            });
        self.send_registry_result(client, context, Subject::Screen, result);
    }

    fn handle_configure_excavator(&self, client: &ClientHandle, patch: &Value) {
        let context = "configure_excavator";
        if !self.ensure_idle(client, context) {
            return;
        }
        let result = self
            .registry
            .replace::<VehicleConfig>(Subject::Vehicle, patch)
            .and_then(|config| {
                // A vehicle that lost its screen in config drops it live.
                if config.has_screen {
                    self.start_screen(None);
                } else {
                    self.stop_screen(None);
                }
                to_value(config)
            });
        self.send_registry_result(client, context, Subject::Vehicle, result);
    }

    fn handle_configure_pwm(
        &self,
        client: &ClientHandle,
        pump: Option<&Value>,
        channels: Option<&Value>,
    ) {
        let context = "configure_pwm_controller";
        if !self.ensure_idle(client, context) {
            return;
        }
        let result = self.registry.replace_servo(pump, channels).and_then(|config| {
            if let Some(pwm) = self.engines.lock().pwm.as_mut() {
                pwm.reload_config(config.clone())
                    .map_err(|e| RegistryError::Config(
                        excavator_common::config::ConfigError::Validation(e.to_string()),
                    ))?;
            }
            to_value(config)
        });
        self.send_registry_result(client, context, Subject::Servo, result);
    }

    fn handle_add_pwm_channel(
        &self,
        client: &ClientHandle,
        name: &str,
        kind: ChannelKind,
        config: &Value,
    ) {
        let context = "add_pwm_channel";
        if !self.ensure_idle(client, context) {
            return;
        }
        let result = match kind {
            ChannelKind::Valve => self.registry.add_channel(name, config),
            ChannelKind::Pump => self.registry.replace_pump(config),
        };
        match result.and_then(to_value) {
            Ok(config) => {
                client.send_json(&json!({
                    "event": "configuration",
                    "message": "Configuration Succeeded",
                    "target": Subject::Servo.target(),
                    "context": context,
                    "channel_name": name,
                    "config": config.to_string(),
                }));
            }
            Err(e) => {
                client.send_error(&e.to_string(), context);
            }
        }
    }

    fn handle_remove_pwm_channel(&self, client: &ClientHandle, name: &str) {
        let context = "remove_pwm_channel";
        if !self.ensure_idle(client, context) {
            return;
        }
        match self.registry.remove_channel(name).and_then(to_value) {
            Ok(config) => {
                client.send_json(&json!({
                    "event": "configuration",
                    "message": "Configuration Succeeded",
                    "target": Subject::Servo.target(),
                    "context": context,
                    "channel_name": name,
                    "config": config.to_string(),
                }));
            }
            Err(e) => {
                client.send_error(&e.to_string(), context);
            }
        }
    }

    fn handle_screen_message(&self, client: &ClientHandle, message: ScreenMessage) {
        let screen = self.engines.lock().screen.clone();
        match screen {
            Some(screen) => {
                screen.show(message);
                client.send_json(&json!({
                    "event": "screen_message_displayed",
                    "message": "Screen message added to the render queue successfully",
                }));
            }
            None => {
                warn!("screen has not been initialized");
                client.send_error("Screen has not been initialized", "screen_message");
            }
        }
    }

    fn handle_status_udp(&self, client: &ClientHandle) {
        let t0 = std::time::Instant::now();
        eprintln!("DEBUG: handle_status_udp entered t={:?}", t0.elapsed());
        let engines = self.engines.lock();
        eprintln!("DEBUG: handle_status_udp got engines lock t={:?}", t0.elapsed());
        match engines.session.as_ref() {
            Some(session) => {
                eprintln!("DEBUG: calling session.status() t={:?}", t0.elapsed());
                let s = session.status();
                eprintln!("DEBUG: session.status() returned t={:?}", t0.elapsed());
                match serde_json::to_value(s) {
                Ok(status) => {
                    eprintln!("DEBUG: handle_status_udp got status {status:?}, sending t={:?}", t0.elapsed());
                    let r = client.send_status("udp", status);
                    eprintln!("DEBUG: handle_status_udp send_status returned {r} t={:?}", t0.elapsed());
                }
                Err(e) => {
                    client.send_error(&format!("Failed to get udp status: {e}"), "status_udp");
                }
            }
            }
            None => {
                client.send_error(
                    "UDP service is shutdown - Start an operation to see the status of it.",
                    "status_udp",
                );
            }
        }
    }

    fn handle_status_tracker(&self, client: &ClientHandle) {
        let engines = self.engines.lock();
        match engines.tracker.as_ref() {
            Some(tracker) => match serde_json::to_value(tracker.status()) {
                Ok(status) => {
                    client.send_status("orientation", status);
                }
                Err(e) => {
                    client.send_error(
                        &format!("Failed to get tracker status: {e}"),
                        "status_orientation_tracker",
                    );
                }
            },
            None => {
                client.send_error(
                    "Orientation tracker is not initialized. start_mirroring first",
                    "status_orientation_tracker",
                );
            }
        }
    }

    fn handle_status_screen(&self, client: &ClientHandle) {
        let screen = self.engines.lock().screen.clone();
        match screen {
            Some(screen) => {
                client.send_status("screen", screen.status());
            }
            None => {
                client.send_error("Screen not initialized", "status_screen");
            }
        }
    }
}

fn to_value<T: serde::Serialize>(config: T) -> Result<Value, RegistryError> {
    serde_json::to_value(config).map_err(|e| {
        RegistryError::Config(excavator_common::config::ConfigError::Parse(e.to_string()))
    })
}

impl ActionSink for Excavator {
    fn dispatch(&self, action: Action, client: ClientHandle) {
        match action {
            Action::ScreenMessage { header, body, render_time, render_count } => {
                self.handle_screen_message(
                    &client,
                    ScreenMessage { header, body, render_time, render_count },
                );
            }
            Action::StartScreen => self.start_screen(Some(&client)),
            Action::StopScreen => self.stop_screen(Some(&client)),
            Action::StartMirroring { send_rate } => {
                self.start_mirroring(send_rate, Some(&client));
            }
            Action::StopMirroring => self.stop_mirroring(Some(&client)),
            Action::StartDriving { channel_names, receive_rate } => {
                self.start_driving(channel_names, receive_rate, Some(&client));
            }
            Action::StopDriving => self.stop_driving(Some(&client)),
            Action::StartDrivingAndMirroring { channel_names, receive_rate, send_rate } => {
                self.start_driving_and_mirroring(
                    channel_names,
                    receive_rate,
                    send_rate,
                    Some(&client),
                );
            }
            Action::StopDrivingAndMirroring => self.stop_driving_and_mirroring(Some(&client)),
            Action::AddPwmChannel { name, kind, config } => {
                self.handle_add_pwm_channel(&client, &name, kind, &config);
            }
            Action::RemovePwmChannel { name } => {
                self.handle_remove_pwm_channel(&client, &name);
            }
            Action::ConfigurePwmController { pump, channels } => {
                self.handle_configure_pwm(&client, pump.as_ref(), channels.as_ref());
            }
            Action::ConfigureScreen { patch } => self.handle_configure_screen(&client, &patch),
            Action::ConfigureOrientationTracker { patch } => {
                self.handle_configure_tracker(&client, &patch);
            }
            Action::ConfigureExcavator { patch } => {
                self.handle_configure_excavator(&client, &patch);
            }
            Action::GetOrientationTrackerConfig => {
                self.handle_get_config(&client, Subject::Tracker);
            }
            Action::GetExcavatorConfig => self.handle_get_config(&client, Subject::Vehicle),
            Action::GetScreenConfig => self.handle_get_config(&client, Subject::Screen),
            Action::GetPwmConfig => self.handle_get_config(&client, Subject::Servo),
            Action::StatusScreen => self.handle_status_screen(&client),
            Action::StatusExcavator => {
                client.send_status("excavator", self.status());
            }
            Action::StatusOrientationTracker => self.handle_status_tracker(&client),
            Action::StatusUdp => self.handle_status_udp(&client),
        }
    }

    fn client_disconnected(&self, client_id: u64) {
        let is_initiator = {
            let state = self.state.lock();
            state.initiator.as_ref().map(ClientHandle::id) == Some(client_id)
        };
        if is_initiator {
            info!(client_id, "operation initiator disconnected, cleaning up");
            self.cleanup_operation();
        }
    }

    fn channel_names(&self) -> Vec<String> {
        ServoConfig::load(&self.settings.config_dir)
            .map(|config| config.channel_names(false))
            .unwrap_or_default()
    }
}
