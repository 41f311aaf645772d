//! # Datagram Session Integration Tests
//!
//! Two real `UdpSession` endpoints over loopback: handshake, framed
//! exchange, CRC rejection, freshness gating and orderly hangup.

use excavator_api::session::wire::{encode_frame, ElementType};
use excavator_api::session::{FailureHook, FrameShape, SessionError, UdpSession};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn noop_hook() -> FailureHook {
    Arc::new(|_| {})
}

/// Spawn the vehicle side: handshake then start receiving.
fn vehicle_side(
    port: u16,
    shape: FrameShape,
    max_age: Duration,
) -> std::thread::JoinHandle<Result<UdpSession, SessionError>> {
    std::thread::spawn(move || {
        let mut session = UdpSession::server(port, shape, ElementType::F64, max_age)?;
        session.handshake(Duration::from_secs(5))?;
        session.start(noop_hook())?;
        Ok(session)
    })
}

fn operator_side(port: u16, shape: FrameShape) -> UdpSession {
    UdpSession::client(("127.0.0.1", port), shape, ElementType::F64, Duration::from_secs(1))
        .expect("client socket")
}

fn wait_latest(session: &UdpSession, timeout: Duration) -> Option<Vec<f64>> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(values) = session.get_latest() {
            return Some(values);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

#[test]
fn handshake_frame_flow_and_consume_once() {
    let port = 47_101;
    let server = vehicle_side(
        port,
        FrameShape { num_outputs: 0, num_inputs: 3 },
        Duration::from_secs(2),
    );
    std::thread::sleep(Duration::from_millis(150));

    let mut client = operator_side(port, FrameShape { num_outputs: 3, num_inputs: 0 });
    client.handshake(Duration::from_secs(5)).expect("client handshake");
    client.start(noop_hook()).unwrap();

    let mut vehicle = server.join().unwrap().expect("vehicle handshake");

    client.send(&[0.5, -0.25, 1.0]).unwrap();
    let values = wait_latest(&vehicle, Duration::from_secs(2)).expect("fresh sample");
    assert_eq!(values, vec![0.5, -0.25, 1.0]);

    // Consumed samples are gone; the same vector is never read twice.
    assert!(vehicle.get_latest().is_none());

    let status = vehicle.status();
    assert!(status.running);
    assert_eq!(status.packets_received, 1);
    assert_eq!(status.receive_type.as_deref(), Some("d"));
    assert_eq!(status.num_inputs, 3);

    client.close();
    vehicle.close();
}

#[test]
fn shape_mismatch_fails_both_handshakes() {
    let port = 47_103;
    // Vehicle: sends 3, expects 1. Operator: sends 2, expects 3.
    // 2 ≠ 1 → both sides must refuse to enter running.
    let server = vehicle_side(
        port,
        FrameShape { num_outputs: 3, num_inputs: 1 },
        Duration::from_secs(1),
    );
    std::thread::sleep(Duration::from_millis(150));

    let client = operator_side(port, FrameShape { num_outputs: 2, num_inputs: 3 });
    let client_result = client.handshake(Duration::from_secs(5));
    let server_result = server.join().unwrap();

    assert!(matches!(client_result, Err(SessionError::HandshakeMismatch(_))));
    assert!(matches!(server_result, Err(SessionError::HandshakeMismatch(_))));
    assert!(!client.status().running);
}

#[test]
fn handshake_times_out_without_a_peer() {
    let mut session = UdpSession::server(
        47_105,
        FrameShape { num_outputs: 0, num_inputs: 1 },
        ElementType::F64,
        Duration::from_secs(1),
    )
    .unwrap();
    let err = session.handshake(Duration::from_millis(300)).unwrap_err();
    assert!(matches!(err, SessionError::HandshakeTimeout));
    session.close();
}

#[test]
fn corrupted_and_malformed_frames_are_counted_not_stored() {
    let port = 47_107;
    let server = vehicle_side(
        port,
        FrameShape { num_outputs: 0, num_inputs: 3 },
        Duration::from_secs(2),
    );
    std::thread::sleep(Duration::from_millis(150));

    let mut client = operator_side(port, FrameShape { num_outputs: 3, num_inputs: 0 });
    client.handshake(Duration::from_secs(5)).unwrap();
    client.start(noop_hook()).unwrap();
    let mut vehicle = server.join().unwrap().unwrap();

    // A raw socket impersonates the peer with a corrupted frame.
    let raw = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
    let mut frame = encode_frame(&[1.0, 2.0, 3.0], ElementType::F64);
    let last = frame.len() - 3;
    frame[last] ^= 0x01; // flip one payload bit
    raw.send_to(&frame, ("127.0.0.1", port)).unwrap();

    // And a frame of the wrong size.
    raw.send_to(&frame[..frame.len() - 4], ("127.0.0.1", port)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let status = vehicle.status();
        if status.packets_corrupted >= 1 && status.packets_malformed >= 1 {
            assert!(!status.has_data, "corrupt frames must not populate the latest slot");
            assert_eq!(status.packets_received, 0);
            break;
        }
        assert!(Instant::now() < deadline, "counters never moved: {status:?}");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(vehicle.get_latest().is_none());

    client.close();
    vehicle.close();
}

#[test]
fn freshness_gating_expires_old_samples() {
    let port = 47_109;
    let server = vehicle_side(
        port,
        FrameShape { num_outputs: 0, num_inputs: 2 },
        Duration::from_millis(300),
    );
    std::thread::sleep(Duration::from_millis(150));

    let mut client = operator_side(port, FrameShape { num_outputs: 2, num_inputs: 0 });
    client.handshake(Duration::from_secs(5)).unwrap();
    client.start(noop_hook()).unwrap();
    let mut vehicle = server.join().unwrap().unwrap();

    client.send(&[0.1, 0.2]).unwrap();
    // Let the frame land, then let it age past the 300 ms budget.
    std::thread::sleep(Duration::from_millis(700));

    let expired_before = vehicle.status().packets_expired;
    assert!(vehicle.get_latest().is_none(), "stale sample must not be handed out");
    assert_eq!(vehicle.status().packets_expired, expired_before + 1);

    client.close();
    vehicle.close();
}

#[test]
fn zero_byte_datagram_ends_the_receive_loop() {
    let port = 47_111;
    let server = vehicle_side(
        port,
        FrameShape { num_outputs: 0, num_inputs: 1 },
        Duration::from_secs(2),
    );
    std::thread::sleep(Duration::from_millis(150));

    let mut client = operator_side(port, FrameShape { num_outputs: 1, num_inputs: 0 });
    client.handshake(Duration::from_secs(5)).unwrap();
    client.start(noop_hook()).unwrap();
    let mut vehicle = server.join().unwrap().unwrap();

    client.close(); // sends the zero-byte hangup

    let deadline = Instant::now() + Duration::from_secs(3);
    while vehicle.status().running {
        assert!(Instant::now() < deadline, "receive loop should exit on hangup");
        std::thread::sleep(Duration::from_millis(50));
    }
    vehicle.close();
}
