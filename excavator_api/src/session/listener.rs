//! Companion service listener.
//!
//! External language bindings of the datagram subsystem report their
//! liveness over a plain TCP connection to this single-peer listener.
//! An unexpected close of the peer is treated like any other
//! session-fatal event: the failure hook fires and the coordinator
//! tears the active operation down.

use crate::session::FailureHook;
use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The single-peer liveness listener.
pub struct ServiceListener {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    port: u16,
}

impl ServiceListener {
    /// Bind `127.0.0.1:port` and start accepting in the background.
    pub fn start(
        port: u16,
        service_name: &str,
        fatal: FailureHook,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        info!(port, service = service_name, "service listener bound");

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let name = service_name.to_string();
        let thread = std::thread::spawn(move || listen_loop(&listener, &stop_flag, &name, &fatal));
        Ok(Self { stop, thread: Some(thread), port })
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and join the listener thread.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        info!("service listener closed");
    }
}

impl Drop for ServiceListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn listen_loop(
    listener: &TcpListener,
    stop: &AtomicBool,
    service_name: &str,
    fatal: &FailureHook,
) {
    // Accept a single client, then read until hangup or stop.
    let stream = loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(service = service_name, %peer, "service connected");
                break stream;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                warn!(service = service_name, "accept failed: {e}");
                return;
            }
        }
    };

    let mut stream = stream;
    if stream.set_read_timeout(Some(Duration::from_secs(1))).is_err() {
        return;
    }
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => {
                warn!(service = service_name, "service peer disconnected");
                fatal("service_listener");
                break;
            }
            Ok(n) => {
                debug!(service = service_name, bytes = n, "service message");
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                warn!(service = service_name, "service read failed: {e}");
                fatal("service_listener");
                break;
            }
        }
    }
    debug!(service = service_name, "listener loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    fn free_port() -> u16 {
        TcpListener::bind(("127.0.0.1", 0)).unwrap().local_addr().unwrap().port()
    }

    #[test]
    fn peer_disconnect_fires_fatal() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let hook: FailureHook = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let port = free_port();
        let mut listener = ServiceListener::start(port, "udp_socket", hook).unwrap();

        {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"alive").unwrap();
            std::thread::sleep(Duration::from_millis(300));
        } // dropped → disconnect

        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        listener.close();
    }

    #[test]
    fn close_without_client_is_clean() {
        let hook: FailureHook = Arc::new(|_| {});
        let mut listener = ServiceListener::start(free_port(), "udp_socket", hook).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        listener.close();
    }
}
