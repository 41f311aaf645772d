//! UDP datagram session.
//!
//! A symmetric endpoint with an explicit 9-byte handshake, fixed-shape
//! CRC-16 framing, freshness gating on the single latest-value slot and
//! a liveness watchdog. The receive loop blocks with a 1 s socket
//! timeout so a raised stop signal is observed within a second; a
//! zero-byte datagram is the agreed peer-hangup signal.

use crate::session::wire::{
    decode_frame, encode_frame, frame_len, ElementType, Handshake, WireError, HANDSHAKE_LEN,
};
use excavator_common::consts::SESSION_LIVENESS_TIMEOUT_S;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod listener;
pub mod wire;

/// Invoked by a session thread when the session has failed fatally.
/// The argument names the failing part for the log and error context.
pub type FailureHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Socket creation or transfer failed.
    #[error("session I/O error: {source}")]
    Io {
        /// Source I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The peer did not complete the handshake in time.
    #[error("handshake timeout")]
    HandshakeTimeout,

    /// The peers' frame shapes do not match.
    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),

    /// Wire-format error during the handshake.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Operation requires a running session.
    #[error("session is not running")]
    NotRunning,

    /// `send` was called with the wrong number of values.
    #[error("expected {expected} values to send, got {got}")]
    WrongValueCount {
        /// Negotiated outgoing count.
        expected: usize,
        /// Provided count.
        got: usize,
    },
}

/// Negotiated frame shape of this endpoint.
#[derive(Debug, Clone, Copy)]
pub struct FrameShape {
    /// Values sent per outgoing frame.
    pub num_outputs: u16,
    /// Values expected per incoming frame.
    pub num_inputs: u16,
}

/// Point-in-time session statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Whether the receive loop is active.
    pub running: bool,
    /// Frames accepted.
    pub packets_received: u64,
    /// Frames sent.
    pub packets_sent: u64,
    /// `get_latest` calls that found only stale data.
    pub packets_expired: u64,
    /// Frames dropped on CRC mismatch.
    pub packets_corrupted: u64,
    /// Frames dropped on size mismatch.
    pub packets_malformed: u64,
    /// Seconds since the last accepted frame.
    pub time_since_last_packet: Option<f64>,
    /// Age of the currently buffered sample [s].
    pub data_age_seconds: Option<f64>,
    /// Whether an unconsumed sample is buffered.
    pub has_data: bool,
    /// Outgoing element-type code.
    pub send_type: String,
    /// Incoming element-type code, known after the handshake.
    pub receive_type: Option<String>,
    /// Values expected per incoming frame.
    pub num_inputs: u16,
    /// Values sent per outgoing frame.
    pub num_outputs: u16,
}

#[derive(Default)]
struct Stats {
    received: u64,
    sent: u64,
    expired: u64,
    corrupted: u64,
    malformed: u64,
    last_packet: Option<Instant>,
    // Welford accumulator over inter-arrival intervals.
    delay_n: u64,
    delay_mean: f64,
    delay_m2: f64,
    delay_min: f64,
    delay_max: f64,
}

impl Stats {
    fn note_arrival(&mut self, now: Instant) {
        if let Some(last) = self.last_packet {
            let interval = now.duration_since(last).as_secs_f64();
            self.delay_n += 1;
            let delta = interval - self.delay_mean;
            self.delay_mean += delta / self.delay_n as f64;
            self.delay_m2 += delta * (interval - self.delay_mean);
            if self.delay_n == 1 {
                self.delay_min = interval;
                self.delay_max = interval;
            } else {
                self.delay_min = self.delay_min.min(interval);
                self.delay_max = self.delay_max.max(interval);
            }
        }
        self.last_packet = Some(now);
        self.received += 1;
    }
}

struct Shared {
    socket: UdpSocket,
    stop: AtomicBool,
    running: AtomicBool,
    remote: Mutex<Option<SocketAddr>>,
    recv_type: Mutex<Option<ElementType>>,
    latest: Mutex<Option<(Vec<f64>, Instant)>>,
    stats: Mutex<Stats>,
    /// Arrival clock for the liveness watchdog, reset at start().
    liveness_epoch: Mutex<Instant>,
    shape: FrameShape,
    send_type: ElementType,
    max_age: Duration,
    local_id: u16,
}

/// One UDP endpoint of the datagram channel.
pub struct UdpSession {
    shared: Arc<Shared>,
    recv_thread: Option<JoinHandle<()>>,
    heartbeat_thread: Option<JoinHandle<()>>,
    is_server: bool,
}

impl UdpSession {
    /// Bind the vehicle-side endpoint on `0.0.0.0:port` and wait for the
    /// initiator.
    pub fn server(
        port: u16,
        shape: FrameShape,
        send_type: ElementType,
        max_age: Duration,
    ) -> Result<Self, SessionError> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        info!(port, "UDP session listening");
        Ok(Self::assemble(socket, None, shape, send_type, max_age, true))
    }

    /// Create the initiating endpoint aimed at `remote`.
    pub fn client(
        remote: impl ToSocketAddrs,
        shape: FrameShape,
        send_type: ElementType,
        max_age: Duration,
    ) -> Result<Self, SessionError> {
        let remote = remote
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SessionError::Io {
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address"),
            })?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        Ok(Self::assemble(socket, Some(remote), shape, send_type, max_age, false))
    }

    fn assemble(
        socket: UdpSocket,
        remote: Option<SocketAddr>,
        shape: FrameShape,
        send_type: ElementType,
        max_age: Duration,
        is_server: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                socket,
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                remote: Mutex::new(remote),
                recv_type: Mutex::new(None),
                latest: Mutex::new(None),
                stats: Mutex::new(Stats::default()),
                liveness_epoch: Mutex::new(Instant::now()),
                shape,
                send_type,
                max_age,
                local_id: std::process::id() as u16,
            }),
            recv_thread: None,
            heartbeat_thread: None,
            is_server,
        }
    }

    /// Exchange handshakes with the peer and cross-check frame shapes.
    ///
    /// The initiator sends first; the responder echoes back. Local
    /// outputs must equal peer inputs and vice versa.
    pub fn handshake(&self, timeout: Duration) -> Result<(), SessionError> {
        let shared = &self.shared;
        let ours = Handshake {
            local_id: shared.local_id,
            num_outputs: shared.shape.num_outputs,
            num_inputs: shared.shape.num_inputs,
            element_type: shared.send_type,
            max_age_ms: shared.max_age.as_millis().min(u128::from(u16::MAX)) as u16,
        }
        .encode();

        shared.socket.set_read_timeout(Some(timeout))?;
        let result = self.exchange_handshake(&ours);
        shared.socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let theirs = result?;

        if theirs.num_inputs != shared.shape.num_outputs {
            return Err(SessionError::HandshakeMismatch(format!(
                "peer expects {} inputs, we send {}",
                theirs.num_inputs, shared.shape.num_outputs
            )));
        }
        if theirs.num_outputs != shared.shape.num_inputs {
            return Err(SessionError::HandshakeMismatch(format!(
                "peer sends {} outputs, we expect {}",
                theirs.num_outputs, shared.shape.num_inputs
            )));
        }

        *shared.recv_type.lock() = Some(theirs.element_type);
        info!(
            peer_id = theirs.local_id,
            peer_max_age_ms = theirs.max_age_ms,
            "handshake complete"
        );
        Ok(())
    }

    fn exchange_handshake(&self, ours: &[u8; HANDSHAKE_LEN]) -> Result<Handshake, SessionError> {
        let shared = &self.shared;
        let mut buf = [0u8; HANDSHAKE_LEN];
        if self.is_server {
            debug!("waiting for handshake...");
            let (len, addr) = shared.socket.recv_from(&mut buf).map_err(map_timeout)?;
            *shared.remote.lock() = Some(addr);
            shared.socket.send_to(ours, addr)?;
            Handshake::decode(&buf[..len]).map_err(Into::into)
        } else {
            let remote = shared.remote.lock().ok_or(SessionError::NotRunning)?;
            shared.socket.send_to(ours, remote)?;
            let (len, addr) = shared.socket.recv_from(&mut buf).map_err(map_timeout)?;
            *shared.remote.lock() = Some(addr);
            Handshake::decode(&buf[..len]).map_err(Into::into)
        }
    }

    /// Start the receive loop and, when inbound frames are expected, the
    /// liveness watchdog.
    pub fn start(&mut self, fatal: FailureHook) -> Result<(), SessionError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.shared.liveness_epoch.lock() = Instant::now();

        let shared = Arc::clone(&self.shared);
        let hook = Arc::clone(&fatal);
        self.recv_thread = Some(std::thread::spawn(move || receive_loop(&shared, &hook)));

        if self.shared.shape.num_inputs > 0 {
            let shared = Arc::clone(&self.shared);
            self.heartbeat_thread =
                Some(std::thread::spawn(move || liveness_loop(&shared, &fatal)));
        }
        info!("UDP session started");
        Ok(())
    }

    /// Send one vector to the peer.
    pub fn send(&self, values: &[f64]) -> Result<(), SessionError> {
        let shared = &self.shared;
        let remote = shared.remote.lock().ok_or(SessionError::NotRunning)?;
        if values.len() != usize::from(shared.shape.num_outputs) {
            return Err(SessionError::WrongValueCount {
                expected: usize::from(shared.shape.num_outputs),
                got: values.len(),
            });
        }
        let frame = encode_frame(values, shared.send_type);
        shared.socket.send_to(&frame, remote)?;
        shared.stats.lock().sent += 1;
        Ok(())
    }

    /// Take the latest received vector, if it is fresh enough.
    ///
    /// A returned sample is consumed; the same sample is never handed
    /// out twice. A stale sample stays buffered but only bumps the
    /// expired counter.
    pub fn get_latest(&self) -> Option<Vec<f64>> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return None;
        }
        let mut latest = self.shared.latest.lock();
        let (_, stamp) = latest.as_ref()?;
        if stamp.elapsed() > self.shared.max_age {
            self.shared.stats.lock().expired += 1;
            return None;
        }
        latest.take().map(|(values, _)| values)
    }

    /// Point-in-time statistics snapshot.
    pub fn status(&self) -> SessionStatus {
        let shared = &self.shared;
        eprintln!("DEBUG: status() before latest.lock()");
        // Same acquisition order as get_latest (latest before stats).
        let latest = shared.latest.lock();
        eprintln!("DEBUG: status() got latest lock");
        let stats = shared.stats.lock();
        eprintln!("DEBUG: status() got stats lock");
        SessionStatus {
            running: shared.running.load(Ordering::SeqCst),
            packets_received: stats.received,
            packets_sent: stats.sent,
            packets_expired: stats.expired,
            packets_corrupted: stats.corrupted,
            packets_malformed: stats.malformed,
            time_since_last_packet: stats.last_packet.map(|t| t.elapsed().as_secs_f64()),
            data_age_seconds: latest.as_ref().map(|(_, t)| t.elapsed().as_secs_f64()),
            has_data: latest.is_some(),
            send_type: char::from(shared.send_type.code()).to_string(),
            receive_type: shared
                .recv_type
                .lock()
                .map(|t| char::from(t.code()).to_string()),
            num_inputs: shared.shape.num_inputs,
            num_outputs: shared.shape.num_outputs,
        }
    }

    /// Orderly close: tell the peer (zero-byte datagram), stop the
    /// loops and join them. Safe to call from a session thread itself.
    pub fn close(&mut self) {
        let shared = &self.shared;
        if shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(remote) = *shared.remote.lock() {
            let _ = shared.socket.send_to(&[], remote);
        }
        shared.running.store(false, Ordering::SeqCst);

        let current = std::thread::current().id();
        for handle in [self.recv_thread.take(), self.heartbeat_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        let stats = shared.stats.lock();
        if stats.delay_n > 1 {
            let variance = stats.delay_m2 / (stats.delay_n - 1) as f64;
            debug!(
                mean_ms = stats.delay_mean * 1000.0,
                std_dev_ms = variance.sqrt() * 1000.0,
                min_ms = stats.delay_min * 1000.0,
                max_ms = stats.delay_max * 1000.0,
                "inter-arrival statistics"
            );
        }
        info!("UDP session closed");
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn map_timeout(e: std::io::Error) -> SessionError {
    if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) {
        SessionError::HandshakeTimeout
    } else {
        SessionError::Io { source: e }
    }
}

fn receive_loop(shared: &Shared, fatal: &FailureHook) {
    let recv_type = match *shared.recv_type.lock() {
        Some(t) if shared.shape.num_inputs > 0 => t,
        // Send-only endpoints still run a loop so a peer hangup is
        // observed promptly.
        _ => {
            drain_loop(shared);
            return;
        }
    };
    let expected = frame_len(usize::from(shared.shape.num_inputs), recv_type);
    let mut buf = vec![0u8; expected + 64];

    while !shared.stop.load(Ordering::SeqCst) {
        let (len, addr) = match shared.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                error!("receive loop failed: {e}");
                fatal("udp_receive");
                break;
            }
        };
        if shared.remote.lock().is_none() {
            *shared.remote.lock() = Some(addr);
        }
        if len == 0 {
            info!(peer = %addr, "peer hung up");
            break;
        }

        match decode_frame(&buf[..len], usize::from(shared.shape.num_inputs), recv_type) {
            Ok(values) => {
                let now = Instant::now();
                *shared.latest.lock() = Some((values, now));
                *shared.liveness_epoch.lock() = now;
                shared.stats.lock().note_arrival(now);
            }
            Err(WireError::BadCrc) => {
                // Silently drop; the operator resends at the next tick.
                shared.stats.lock().corrupted += 1;
            }
            Err(_) => {
                warn!(len, expected, "wrong frame size");
                shared.stats.lock().malformed += 1;
            }
        }
    }
    shared.running.store(false, Ordering::SeqCst);
    debug!("receive loop exited");
}

/// Receive loop variant for shapes with no inputs.
fn drain_loop(shared: &Shared) {
    let mut buf = [0u8; 64];
    while !shared.stop.load(Ordering::SeqCst) {
        match shared.socket.recv_from(&mut buf) {
            Ok((0, addr)) => {
                info!(peer = %addr, "peer hung up");
                break;
            }
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                error!("drain loop failed: {e}");
                break;
            }
        }
    }
    debug!("drain loop exited");
}

fn liveness_loop(shared: &Shared, fatal: &FailureHook) {
    let timeout = Duration::from_secs(SESSION_LIVENESS_TIMEOUT_S);
    while !shared.stop.load(Ordering::SeqCst) {
        let age = shared.liveness_epoch.lock().elapsed();
        if age > timeout {
            error!(age_s = age.as_secs_f64(), "session liveness timeout");
            fatal("udp_liveness");
            break;
        }
        std::thread::sleep(Duration::from_secs(2));
    }
    debug!("liveness loop exited");
}
