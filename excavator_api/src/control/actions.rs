//! Inbound action parsing.
//!
//! Every accepted control message becomes one [`Action`] variant with
//! typed, validated arguments. The dispatcher downstream is a single
//! match — no name-based lookup survives past this point.

use crate::control::validate::{parse_bool, parse_number, validate_channel_names, validate_rate};
use excavator_common::consts::{
    ACCEL_RANGES, COMMAND_RECEIVE_MAX_RATE, DATA_RATES, FONT_SIZE_MAX, FONT_SIZE_MIN,
    GYRO_RANGES, ORIENTATION_SEND_MAX_RATE, RENDER_TIME_MAX_S, RENDER_TIME_MIN_S,
    TRACKING_RATE_MAX, TRACKING_RATE_MIN,
};
use serde_json::{json, Map, Value};

/// Default mirroring cadence when the operator does not name one [Hz].
const DEFAULT_ORIENTATION_SEND_RATE: f64 = 50.0;

/// A rejected control message: sent back as an `error` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    /// Human-readable reason.
    pub message: String,
    /// Originating action name, or "unknown".
    pub context: String,
}

impl ActionError {
    fn new(message: impl Into<String>, context: &str) -> Self {
        Self { message: message.into(), context: context.to_string() }
    }
}

/// What kind of output `add_pwm_channel` creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// The pump block.
    Pump,
    /// A named valve channel.
    Valve,
}

/// One validated control action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Show a message on the status screen.
    ScreenMessage {
        /// Header line.
        header: String,
        /// Body text.
        body: String,
        /// Seconds one render stays visible.
        render_time: f64,
        /// How many times to render.
        render_count: i64,
    },
    /// Start the status screen.
    StartScreen,
    /// Stop the status screen.
    StopScreen,
    /// Start the mirroring operation.
    StartMirroring {
        /// Orientation send cadence [Hz].
        send_rate: f64,
    },
    /// Stop the mirroring operation.
    StopMirroring,
    /// Start the driving operation.
    StartDriving {
        /// Channels the operator will stream, in slot order.
        channel_names: Vec<String>,
        /// Command apply cadence [Hz].
        receive_rate: f64,
    },
    /// Stop the driving operation.
    StopDriving,
    /// Start driving and mirroring simultaneously.
    StartDrivingAndMirroring {
        /// Channels the operator will stream, in slot order.
        channel_names: Vec<String>,
        /// Command apply cadence [Hz].
        receive_rate: f64,
        /// Orientation send cadence [Hz].
        send_rate: f64,
    },
    /// Stop the combined operation.
    StopDrivingAndMirroring,
    /// Add a PWM output to the servo configuration.
    AddPwmChannel {
        /// New channel name (lowercased).
        name: String,
        /// Pump block or valve channel.
        kind: ChannelKind,
        /// Raw config document, validated by the registry.
        config: Value,
    },
    /// Remove a PWM output from the servo configuration.
    RemovePwmChannel {
        /// Existing channel name (lowercased).
        name: String,
    },
    /// Patch the servo configuration.
    ConfigurePwmController {
        /// Pump patch, if given.
        pump: Option<Value>,
        /// Per-channel patches, if given.
        channels: Option<Value>,
    },
    /// Patch the screen configuration.
    ConfigureScreen {
        /// Validated field patch.
        patch: Value,
    },
    /// Patch the orientation tracker configuration.
    ConfigureOrientationTracker {
        /// Validated field patch.
        patch: Value,
    },
    /// Patch the vehicle configuration.
    ConfigureExcavator {
        /// Validated field patch.
        patch: Value,
    },
    /// Return the tracker configuration.
    GetOrientationTrackerConfig,
    /// Return the vehicle configuration.
    GetExcavatorConfig,
    /// Return the screen configuration.
    GetScreenConfig,
    /// Return the servo configuration.
    GetPwmConfig,
    /// Return the screen status.
    StatusScreen,
    /// Return the vehicle status.
    StatusExcavator,
    /// Return the tracker status.
    StatusOrientationTracker,
    /// Return the datagram session status.
    StatusUdp,
}

impl Action {
    /// The wire name of this action, used as error context.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScreenMessage { .. } => "screen_message",
            Self::StartScreen => "start_screen",
            Self::StopScreen => "stop_screen",
            Self::StartMirroring { .. } => "start_mirroring",
            Self::StopMirroring => "stop_mirroring",
            Self::StartDriving { .. } => "start_driving",
            Self::StopDriving => "stop_driving",
            Self::StartDrivingAndMirroring { .. } => "start_driving_and_mirroring",
            Self::StopDrivingAndMirroring => "stop_driving_and_mirroring",
            Self::AddPwmChannel { .. } => "add_pwm_channel",
            Self::RemovePwmChannel { .. } => "remove_pwm_channel",
            Self::ConfigurePwmController { .. } => "configure_pwm_controller",
            Self::ConfigureScreen { .. } => "configure_screen",
            Self::ConfigureOrientationTracker { .. } => "configure_orientation_tracker",
            Self::ConfigureExcavator { .. } => "configure_excavator",
            Self::GetOrientationTrackerConfig => "get_orientation_tracker_config",
            Self::GetExcavatorConfig => "get_excavator_config",
            Self::GetScreenConfig => "get_screen_config",
            Self::GetPwmConfig => "get_pwm_config",
            Self::StatusScreen => "status_screen",
            Self::StatusExcavator => "status_excavator",
            Self::StatusOrientationTracker => "status_orientation_tracker",
            Self::StatusUdp => "status_udp",
        }
    }

    /// Parse and validate one inbound message.
    ///
    /// `existing_channels` is the currently configured channel-name list
    /// used for existence checks.
    pub fn parse(raw: &Value, existing_channels: &[String]) -> Result<Self, ActionError> {
        let action = raw
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::new("No action provided", "unknown"))?;

        match action {
            "screen_message" => parse_screen_message(raw),
            "start_screen" => Ok(Self::StartScreen),
            "stop_screen" => Ok(Self::StopScreen),
            "start_mirroring" => parse_start_mirroring(raw),
            "stop_mirroring" => Ok(Self::StopMirroring),
            "start_driving" => parse_start_driving(raw, existing_channels),
            "stop_driving" => Ok(Self::StopDriving),
            "start_driving_and_mirroring" => {
                parse_start_driving_and_mirroring(raw, existing_channels)
            }
            "stop_driving_and_mirroring" => Ok(Self::StopDrivingAndMirroring),
            "add_pwm_channel" => parse_add_pwm_channel(raw, existing_channels),
            "remove_pwm_channel" => parse_remove_pwm_channel(raw, existing_channels),
            "configure_pwm_controller" => parse_configure_pwm(raw),
            "configure_screen" => parse_configure_screen(raw),
            "configure_orientation_tracker" => parse_configure_tracker(raw),
            "configure_excavator" => parse_configure_excavator(raw),
            "get_orientation_tracker_config" => Ok(Self::GetOrientationTrackerConfig),
            "get_excavator_config" => Ok(Self::GetExcavatorConfig),
            "get_screen_config" => Ok(Self::GetScreenConfig),
            "get_pwm_config" => Ok(Self::GetPwmConfig),
            "status_screen" => Ok(Self::StatusScreen),
            "status_excavator" => Ok(Self::StatusExcavator),
            "status_orientation_tracker" => Ok(Self::StatusOrientationTracker),
            "status_udp" => Ok(Self::StatusUdp),
            other => Err(ActionError::new(format!("Action {other} does not exist"), "unknown")),
        }
    }
}

fn parse_screen_message(raw: &Value) -> Result<Action, ActionError> {
    const CTX: &str = "screen_message";
    let header = raw.get("header").and_then(Value::as_str);
    let body = raw.get("body").and_then(Value::as_str);
    let (Some(header), Some(body)) = (header, body) else {
        return Err(ActionError::new(
            "Give all needed message parameters <header,body,render_time,render_count>",
            CTX,
        ));
    };
    let render_time = raw
        .get("render_time")
        .map(|v| parse_number(v, "render_time"))
        .transpose()
        .map_err(|m| ActionError::new(m, CTX))?
        .ok_or_else(|| ActionError::new("render_time is required", CTX))?;
    let render_count = raw
        .get("render_count")
        .and_then(Value::as_i64)
        .ok_or_else(|| ActionError::new("render_count is required", CTX))?;
    if render_time <= 0.0 || render_count <= 0 {
        return Err(ActionError::new("render_time has to be positive", CTX));
    }
    Ok(Action::ScreenMessage {
        header: header.to_string(),
        body: body.to_string(),
        render_time,
        render_count,
    })
}

fn parse_start_mirroring(raw: &Value) -> Result<Action, ActionError> {
    const CTX: &str = "start_mirroring";
    let send_rate = match raw.get("orientation_send_rate") {
        Some(value) => {
            let rate = parse_number(value, "orientation_send_rate")
                .and_then(|r| {
                    validate_rate(r, "orientation_send_rate", Some(ORIENTATION_SEND_MAX_RATE))
                })
                .map_err(|m| ActionError::new(m, CTX))?;
            rate
        }
        None => DEFAULT_ORIENTATION_SEND_RATE,
    };
    Ok(Action::StartMirroring { send_rate })
}

fn parse_start_driving(raw: &Value, existing: &[String]) -> Result<Action, ActionError> {
    const CTX: &str = "start_driving";
    let (Some(names), Some(rate)) = (raw.get("channel_names"), raw.get("data_sending_rate"))
    else {
        return Err(ActionError::new(
            "start driving parameters missing, both channel_names and data_sending_rate \
             have to be provided",
            CTX,
        ));
    };
    let channel_names =
        validate_channel_names(names, existing).map_err(|m| ActionError::new(m, CTX))?;
    let receive_rate = parse_number(rate, "data_sending_rate")
        .and_then(|r| validate_rate(r, "data_sending_rate", Some(COMMAND_RECEIVE_MAX_RATE)))
        .map_err(|m| ActionError::new(m, CTX))?;
    Ok(Action::StartDriving { channel_names, receive_rate })
}

fn parse_start_driving_and_mirroring(
    raw: &Value,
    existing: &[String],
) -> Result<Action, ActionError> {
    const CTX: &str = "start_driving_and_mirroring";
    let (Some(names), Some(send), Some(receive)) = (
        raw.get("channel_names"),
        raw.get("data_sending_rate"),
        raw.get("data_receiving_rate"),
    ) else {
        return Err(ActionError::new(
            "start driving&mirroring parameters missing, all have to be provided",
            CTX,
        ));
    };
    let channel_names =
        validate_channel_names(names, existing).map_err(|m| ActionError::new(m, CTX))?;
    // Rate names are from the operator's point of view: they send
    // commands and receive orientation.
    let receive_rate = parse_number(send, "data_sending_rate")
        .and_then(|r| validate_rate(r, "data_sending_rate", Some(COMMAND_RECEIVE_MAX_RATE)))
        .map_err(|m| ActionError::new(m, CTX))?;
    let send_rate = parse_number(receive, "data_receiving_rate")
        .and_then(|r| validate_rate(r, "data_receiving_rate", Some(ORIENTATION_SEND_MAX_RATE)))
        .map_err(|m| ActionError::new(m, CTX))?;
    Ok(Action::StartDrivingAndMirroring { channel_names, receive_rate, send_rate })
}

fn parse_add_pwm_channel(raw: &Value, existing: &[String]) -> Result<Action, ActionError> {
    const CTX: &str = "add_pwm_channel";
    let name = raw
        .get("channel_name")
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::new("No channel_name provided.", CTX))?
        .to_ascii_lowercase();
    let kind = match raw.get("channel_type").and_then(Value::as_str) {
        Some("pump") => ChannelKind::Pump,
        Some("channel_config") => ChannelKind::Valve,
        Some(other) => {
            return Err(ActionError::new(format!("Unknown channel type: {other}"), CTX));
        }
        None => return Err(ActionError::new("No channel_type provided.", CTX)),
    };
    if kind == ChannelKind::Valve && existing.contains(&name) {
        return Err(ActionError::new(format!("Channel name {name} already exists"), CTX));
    }
    let config = raw
        .get("config")
        .filter(|c| c.is_object())
        .cloned()
        .ok_or_else(|| ActionError::new("No config object provided.", CTX))?;
    for required in ["output_channel", "pulse_min", "pulse_max"] {
        if config.get(required).is_none() {
            return Err(ActionError::new(format!("config is missing {required}"), CTX));
        }
    }
    Ok(Action::AddPwmChannel { name, kind, config })
}

fn parse_remove_pwm_channel(raw: &Value, existing: &[String]) -> Result<Action, ActionError> {
    const CTX: &str = "remove_pwm_channel";
    let name = raw
        .get("channel_name")
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::new("No channel_name provided.", CTX))?
        .to_ascii_lowercase();
    let known = name == "pump" || existing.contains(&name);
    if !known {
        return Err(ActionError::new(
            format!(
                "Channel name {name} does not exist. Here are all the channels: {},pump",
                existing.join(",")
            ),
            CTX,
        ));
    }
    Ok(Action::RemovePwmChannel { name })
}

fn parse_configure_pwm(raw: &Value) -> Result<Action, ActionError> {
    const CTX: &str = "configure_pwm_controller";
    let configs = raw
        .get("channel_configs")
        .and_then(Value::as_object)
        .ok_or_else(|| ActionError::new("No channel_configs parameter provided.", CTX))?;
    let mut channels = configs.clone();
    let pump = channels.remove("pump");
    if let Some(pump) = &pump {
        if !pump.is_object() {
            return Err(ActionError::new("Pump has to be a dictionary", CTX));
        }
    }
    for (name, config) in &channels {
        if !config.is_object() {
            return Err(ActionError::new(format!("channel {name} has to be a dictionary"), CTX));
        }
    }
    let channels = if channels.is_empty() { None } else { Some(Value::Object(channels)) };
    Ok(Action::ConfigurePwmController { pump, channels })
}

fn parse_configure_screen(raw: &Value) -> Result<Action, ActionError> {
    const CTX: &str = "configure_screen";
    let mut patch = Map::new();

    if let Some(value) = raw.get("render_time") {
        let render_time =
            parse_number(value, "render_time").map_err(|m| ActionError::new(m, CTX))?;
        if !(render_time > RENDER_TIME_MIN_S && render_time < RENDER_TIME_MAX_S) {
            return Err(ActionError::new(
                format!("render_time must be between {RENDER_TIME_MIN_S}-{RENDER_TIME_MAX_S}"),
                CTX,
            ));
        }
        patch.insert("render_time".into(), json!(render_time));
    }
    for field in ["font_size_header", "font_size_body"] {
        if let Some(value) = raw.get(field) {
            let size = parse_number(value, field).map_err(|m| ActionError::new(m, CTX))? as i64;
            if !(size > FONT_SIZE_MIN && size < FONT_SIZE_MAX) {
                return Err(ActionError::new(
                    format!("{field} must be between {FONT_SIZE_MIN}-{FONT_SIZE_MAX}"),
                    CTX,
                ));
            }
            patch.insert(field.into(), json!(size));
        }
    }
    if patch.is_empty() {
        return Err(ActionError::new(
            "No screen config parameters provided. Give at least one.",
            CTX,
        ));
    }
    Ok(Action::ConfigureScreen { patch: Value::Object(patch) })
}

fn parse_configure_tracker(raw: &Value) -> Result<Action, ActionError> {
    const CTX: &str = "configure_orientation_tracker";
    let mut patch = Map::new();

    for field in ["gyro_data_rate", "accel_data_rate"] {
        if let Some(value) = raw.get(field) {
            let rate = parse_number(value, field).map_err(|m| ActionError::new(m, CTX))? as u32;
            if !DATA_RATES.contains(&rate) {
                return Err(ActionError::new(
                    format!("{field}: {rate} is not valid. Valid rates: {}", join(&DATA_RATES)),
                    CTX,
                ));
            }
            patch.insert(field.into(), json!(rate));
        }
    }
    if let Some(value) = raw.get("gyro_range") {
        let range = parse_number(value, "gyro_range").map_err(|m| ActionError::new(m, CTX))? as u32;
        if !GYRO_RANGES.contains(&range) {
            return Err(ActionError::new(
                format!("gyro_range: {range} is not valid. Valid ranges: {}", join(&GYRO_RANGES)),
                CTX,
            ));
        }
        patch.insert("gyro_range".into(), json!(range));
    }
    if let Some(value) = raw.get("accel_range") {
        let range =
            parse_number(value, "accel_range").map_err(|m| ActionError::new(m, CTX))? as u32;
        if !ACCEL_RANGES.contains(&range) {
            return Err(ActionError::new(
                format!(
                    "accel_range: {range} is not valid. Valid ranges: {}",
                    join(&ACCEL_RANGES)
                ),
                CTX,
            ));
        }
        patch.insert("accel_range".into(), json!(range));
    }
    if let Some(value) = raw.get("tracking_rate") {
        let rate =
            parse_number(value, "tracking_rate").map_err(|m| ActionError::new(m, CTX))? as u32;
        if !(TRACKING_RATE_MIN..=TRACKING_RATE_MAX).contains(&rate) {
            return Err(ActionError::new(
                format!(
                    "tracking_rate must be between {TRACKING_RATE_MIN}-{TRACKING_RATE_MAX}"
                ),
                CTX,
            ));
        }
        patch.insert("tracking_rate".into(), json!(rate));
    }
    if let Some(value) = raw.get("alpha") {
        let alpha = parse_number(value, "alpha").map_err(|m| ActionError::new(m, CTX))?;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(ActionError::new("Alpha must be between 0-1", CTX));
        }
        patch.insert("alpha".into(), json!(alpha));
    }
    for field in ["enable_lpf2", "enable_simple_lpf"] {
        if let Some(value) = raw.get(field) {
            let flag = parse_bool(value, field).map_err(|m| ActionError::new(m, CTX))?;
            patch.insert(field.into(), json!(flag));
        }
    }
    if patch.is_empty() {
        return Err(ActionError::new(
            "No orientation tracker parameters provided. Give at least one.",
            CTX,
        ));
    }
    Ok(Action::ConfigureOrientationTracker { patch: Value::Object(patch) })
}

fn parse_configure_excavator(raw: &Value) -> Result<Action, ActionError> {
    const CTX: &str = "configure_excavator";
    let mut patch = Map::new();
    if let Some(value) = raw.get("has_screen") {
        let flag = parse_bool(value, "has_screen").map_err(|m| ActionError::new(m, CTX))?;
        patch.insert("has_screen".into(), json!(flag));
    }
    if patch.is_empty() {
        return Err(ActionError::new("No excavator parameters provided.", CTX));
    }
    Ok(Action::ConfigureExcavator { patch: Value::Object(patch) })
}

fn join(values: &[u32]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
}
