//! WebSocket control channel.
//!
//! Server role on the vehicle. Every inbound frame is one JSON message
//! `{"action": <name>, ...params}`; every outbound frame carries an
//! `event` field. Parsing and validation happen on the connection's
//! reader thread, dispatch runs on a worker thread so heavy actions
//! never stall the channel.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tungstenite::{Message, WebSocket};

pub mod actions;
pub mod validate;

pub use actions::{Action, ActionError};

/// Receives parsed actions and connection lifecycle notifications.
pub trait ActionSink: Send + Sync {
    /// Handle one validated action from `client`.
    fn dispatch(&self, action: Action, client: ClientHandle);

    /// A client's connection is gone; clean up as if it sent a stop.
    fn client_disconnected(&self, client_id: u64);

    /// Currently configured channel names, for request validation.
    fn channel_names(&self) -> Vec<String>;
}

struct ClientInner {
    id: u64,
    peer: String,
    ws: Mutex<WebSocket<TcpStream>>,
    alive: AtomicBool,
}

/// Cloneable handle for sending events to one connected operator.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

impl ClientHandle {
    /// Connection id, unique for the server's lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the connection was still up at the last transfer.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Send one JSON document. Returns `false` when the connection is
    /// gone; the caller decides whether that matters.
    pub fn send_json(&self, value: &Value) -> bool {
        if !self.is_alive() {
            return false;
        }
        let text = value.to_string();
        let mut ws = self.inner.ws.lock();
        match ws.send(Message::Text(text)) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %self.inner.peer, "send failed: {e}");
                self.inner.alive.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Send a bare `{"event": ...}` frame.
    pub fn send_event(&self, event: &str) -> bool {
        self.send_json(&json!({ "event": event }))
    }

    /// Send an error event with message and context.
    pub fn send_error(&self, message: &str, context: &str) -> bool {
        self.send_json(&json!({
            "event": "error",
            "error": { "message": message, "context": context }
        }))
    }

    /// Send a configuration response for `target`.
    pub fn send_configuration(&self, target: &str, context: &str, config: &Value) -> bool {
        self.send_json(&json!({
            "event": "configuration",
            "message": "Configuration Succeeded",
            "target": target,
            "context": context,
            "config": config.to_string(),
        }))
    }

    /// Send a status snapshot for `target`.
    pub fn send_status(&self, target: &str, status: Value) -> bool {
        self.send_json(&json!({ "event": "status", "target": target, "status": status }))
    }
}

/// The WebSocket control server.
pub struct ControlServer {
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `ip:port` and serve until [`ControlServer::shutdown`].
    pub fn start(ip: &str, port: u16, sink: Arc<dyn ActionSink>) -> std::io::Result<Self> {
        let listener = TcpListener::bind((ip, port))?;
        listener.set_nonblocking(true)?;
        info!(ip, port, "control channel listening");

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let accept_thread =
            Some(std::thread::spawn(move || accept_loop(&listener, &stop_flag, &sink)));
        Ok(Self { stop, accept_thread })
    }

    /// Stop accepting, let connection threads drain, join the acceptor.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        info!("control channel shut down");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &TcpListener, stop: &Arc<AtomicBool>, sink: &Arc<dyn ActionSink>) {
    let next_id = AtomicU64::new(1);
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let sink = Arc::clone(sink);
                let stop = Arc::clone(stop);
                std::thread::spawn(move || {
                    serve_connection(stream, peer.to_string(), id, &sink, &stop);
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!("accept failed: {e}");
                break;
            }
        }
    }
    debug!("accept loop exited");
}

fn serve_connection(
    stream: TcpStream,
    peer: String,
    id: u64,
    sink: &Arc<dyn ActionSink>,
    stop: &AtomicBool,
) {
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    let ws = match tungstenite::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "websocket handshake failed: {e}");
            return;
        }
    };
    // Short read timeout bounds how long the reader holds the socket
    // lock, so server-initiated events interleave with reads.
    if ws
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(100)))
        .is_err()
    {
        return;
    }
    info!(%peer, id, "operator connected");

    let client = ClientHandle {
        inner: Arc::new(ClientInner {
            id,
            peer: peer.clone(),
            ws: Mutex::new(ws),
            alive: AtomicBool::new(true),
        }),
    };

    while client.is_alive() && !stop.load(Ordering::SeqCst) {
        let message = {
            let mut ws = client.inner.ws.lock();
            ws.read()
        };
        match message {
            Ok(Message::Text(text)) => handle_message(&text, &client, sink),
            Ok(Message::Close(_)) => {
                info!(%peer, "operator closed the channel");
                break;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                info!(%peer, "operator disconnected");
                break;
            }
            Err(e) => {
                warn!(%peer, "channel read failed: {e}");
                break;
            }
        }
    }

    client.inner.alive.store(false, Ordering::SeqCst);
    info!(%peer, id, "cleaning up operator connection");
    sink.client_disconnected(id);
}

fn handle_message(text: &str, client: &ClientHandle, sink: &Arc<dyn ActionSink>) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            client.send_error("Command must be valid JSON", "unknown");
            return;
        }
    };
    match Action::parse(&raw, &sink.channel_names()) {
        Ok(action) => {
            debug!(action = action.name(), "dispatching");
            let sink = Arc::clone(sink);
            let client = client.clone();
            // Heavy work never runs on the reader thread.
            std::thread::spawn(move || sink.dispatch(action, client));
        }
        Err(e) => {
            client.send_error(&e.message, &e.context);
        }
    }
}
