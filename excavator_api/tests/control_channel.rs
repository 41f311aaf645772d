//! # Control Channel Integration Tests
//!
//! Full stack over loopback: a tungstenite operator client drives the
//! WebSocket server, the coordinator runs a real mirroring operation
//! against simulated hardware, and the datagram channel carries real
//! orientation frames.

use excavator_api::control::{ActionSink, ControlServer};
use excavator_api::coordinator::{Excavator, Operation, Settings};
use excavator_api::session::wire::ElementType;
use excavator_api::session::{FrameShape, UdpSession};
use excavator_common::config::servo::{ChannelConfig, PumpConfig, ServoConfig};
use excavator_common::config::{ConfigFile, ScreenConfig, TrackerConfig, VehicleConfig};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

const CONTROL_PORT: u16 = 47_210;
const SERVICE_PORT: u16 = 47_212;

fn seed_config(dir: &Path) {
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
    TrackerConfig {
        gyro_data_rate: 104,
        accel_data_rate: 104,
        gyro_range: 250,
        accel_range: 2,
        tracking_rate: 100,
        enable_lpf2: false,
        enable_simple_lpf: false,
        alpha: 0.5,
        orientation_format: Default::default(),
    }
    .store(dir)
    .unwrap();
    ScreenConfig { render_time: 0.5, font_size_header: 12, font_size_body: 9 }
        .store(dir)
        .unwrap();
    VehicleConfig { has_screen: false }.store(dir).unwrap();
}

type WsClient = WebSocket<MaybeTlsStream<TcpStream>>;

fn connect_operator() -> WsClient {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match tungstenite::connect(format!("ws://127.0.0.1:{CONTROL_PORT}")) {
            Ok((ws, _response)) => {
                if let MaybeTlsStream::Plain(stream) = ws.get_ref() {
                    stream.set_read_timeout(Some(Duration::from_secs(20))).unwrap();
                }
                return ws;
            }
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => panic!("could not connect operator client: {e}"),
        }
    }
}

fn send_action(ws: &mut WsClient, action: Value) {
    ws.send(Message::Text(action.to_string())).unwrap();
}

fn next_event(ws: &mut WsClient) -> Value {
    loop {
        match ws.read().expect("event within the read timeout") {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

/// Read events until one matches `event`, returning it.
fn wait_for_event(ws: &mut WsClient, event: &str) -> Value {
    for _ in 0..32 {
        let message = next_event(ws);
        if message["event"] == event {
            return message;
        }
    }
    panic!("event {event} never arrived");
}

#[test]
fn mirroring_over_the_full_stack() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
    let dir = tempfile::tempdir().unwrap();
    seed_config(dir.path());

    let excavator = Excavator::new(Settings {
        control_ip: "127.0.0.1".to_string(),
        control_port: CONTROL_PORT,
        service_listener_port: SERVICE_PORT,
        config_dir: dir.path().to_path_buf(),
        simulate: true,
        ..Settings::default()
    })
    .unwrap();
    let sink: Arc<dyn ActionSink> = excavator.clone();
    let mut server = ControlServer::start("127.0.0.1", CONTROL_PORT, sink).unwrap();

    let mut ws = connect_operator();

    // Malformed and unknown messages come back as error events.
    ws.send(Message::Text("{not json".to_string())).unwrap();
    let err = next_event(&mut ws);
    assert_eq!(err["event"], "error");
    assert_eq!(err["error"]["message"], "Command must be valid JSON");

    send_action(&mut ws, json!({"action": "levitate"}));
    let err = next_event(&mut ws);
    assert_eq!(err["event"], "error");

    // Configuration queries work while idle.
    send_action(&mut ws, json!({"action": "get_excavator_config"}));
    let config = wait_for_event(&mut ws, "configuration");
    assert_eq!(config["target"], "excavator");

    // The operator-side datagram endpoint handshakes as soon as the
    // vehicle announces readiness.
    let udp_client = std::thread::spawn(|| {
        let mut session = UdpSession::client(
            ("127.0.0.1", CONTROL_PORT - 1),
            FrameShape { num_outputs: 0, num_inputs: 3 },
            ElementType::F64,
            Duration::from_secs(1),
        )
        .unwrap();
        for attempt in 0..10 {
            match session.handshake(Duration::from_secs(2)) {
                Ok(()) => {
                    session.start(Arc::new(|_| {})).unwrap();
                    return session;
                }
                Err(e) if attempt < 9 => {
                    eprintln!("handshake attempt {attempt} failed: {e}");
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(e) => panic!("operator handshake never succeeded: {e}"),
            }
        }
        unreachable!()
    });

    send_action(&mut ws, json!({"action": "start_mirroring", "orientation_send_rate": 50}));
    wait_for_event(&mut ws, "handshake");
    wait_for_event(&mut ws, "started_mirroring");
    assert_eq!(excavator.current_operation(), Operation::Mirroring);

    // Orientation frames arrive at the operator.
    let mut session = udp_client.join().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let sample = loop {
        if let Some(values) = session.get_latest() {
            break values;
        }
        assert!(Instant::now() < deadline, "no orientation frames arrived");
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(sample.len(), 3);

    // A second operation while mirroring runs is rejected with context.
    send_action(
        &mut ws,
        json!({
            "action": "start_driving",
            "channel_names": ["lift_boom"],
            "data_sending_rate": 10,
        }),
    );
    let err = wait_for_event(&mut ws, "error");
    assert_eq!(err["error"]["context"], "start_driving");
    assert!(err["error"]["message"]
        .as_str()
        .unwrap()
        .contains("already underway"));

    // Configuration edits are rejected mid-operation.
    send_action(&mut ws, json!({"action": "configure_excavator", "has_screen": true}));
    let err = wait_for_event(&mut ws, "error");
    assert_eq!(err["error"]["context"], "configure_excavator");

    // Session status is visible while running.
    send_action(&mut ws, json!({"action": "status_udp"}));
    let status = wait_for_event(&mut ws, "status");
    assert_eq!(status["target"], "udp");
    assert_eq!(status["status"]["running"], true);

    send_action(&mut ws, json!({"action": "stop_mirroring"}));
    wait_for_event(&mut ws, "stopped_mirroring");
    assert_eq!(excavator.current_operation(), Operation::None);

    // Stop is idempotent: a second stop still answers stopped_*.
    send_action(&mut ws, json!({"action": "stop_mirroring"}));
    wait_for_event(&mut ws, "stopped_mirroring");

    session.close();
    let _ = ws.close(None);
    server.shutdown();
    excavator.shutdown();
}
