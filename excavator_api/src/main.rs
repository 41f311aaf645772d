//! # Excavator Control Daemon Binary
//!
//! Long-running on-vehicle server. Binds the WebSocket control channel,
//! builds the coordinator and runs until SIGINT, at which point the
//! active operation is stopped, PWM outputs return to center and the
//! pump to its minimum before the process exits.
//!
//! # Usage
//!
//! ```bash
//! # Run against real hardware
//! excavator_api --config-dir /home/excavator/config
//!
//! # Bench run with simulated PWM and IMU
//! excavator_api -c ./config --simulate -v
//! ```

#![deny(warnings)]

use clap::Parser;
use excavator_api::control::ControlServer;
use excavator_api::coordinator::{Excavator, Settings};
use excavator_common::consts::{DEFAULT_CONTROL_PORT, DEFAULT_SERVICE_LISTENER_PORT};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Excavator control daemon - tele-operation server for the vehicle
#[derive(Parser, Debug)]
#[command(name = "excavator_api")]
#[command(version)]
#[command(about = "On-vehicle control server: driving, mirroring, configuration")]
struct Args {
    /// Control channel bind address
    #[arg(long, default_value = "0.0.0.0")]
    ip: String,

    /// Control channel port (datagram channel binds to port - 1)
    #[arg(short, long, default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,

    /// Service listener port for external datagram helpers
    #[arg(long, default_value_t = DEFAULT_SERVICE_LISTENER_PORT)]
    service_port: u16,

    /// Directory holding the YAML configuration files
    #[arg(short, long, default_value = "config")]
    config_dir: PathBuf,

    /// Disable the PWM driver (orientation-only bench setups)
    #[arg(long)]
    no_pwm: bool,

    /// Substitute simulation devices for all hardware
    #[arg(short, long)]
    simulate: bool,

    /// I2C bus number for PWM and IMU
    #[arg(long, default_value_t = 1)]
    i2c_bus: u8,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("daemon startup failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("excavator daemon v{} starting...", env!("CARGO_PKG_VERSION"));

    let settings = Settings {
        control_ip: args.ip.clone(),
        control_port: args.port,
        service_listener_port: args.service_port,
        config_dir: args.config_dir.clone(),
        pwm_enabled: !args.no_pwm,
        simulate: args.simulate,
        i2c_bus: args.i2c_bus,
        ..Settings::default()
    };

    let excavator = Excavator::new(settings)?;
    let sink: Arc<dyn excavator_api::control::ActionSink> = excavator.clone();
    let mut server = ControlServer::start(&args.ip, args.port, sink)?;

    let running = Arc::new(AtomicBool::new(true));
    let running_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        running_flag.store(false, Ordering::SeqCst);
    })?;

    info!(ip = %args.ip, port = args.port, "excavator daemon is ready");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    // Reverse of startup: operators first, then the engines.
    server.shutdown();
    excavator.shutdown();

    info!("excavator daemon shutdown complete");
    Ok(())
}
