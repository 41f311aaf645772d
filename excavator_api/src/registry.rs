//! Per-subject configuration registry.
//!
//! Serializes access to the four persisted config subjects with a busy
//! flag each, so a query and an edit can never overlap. A replace is
//! load → patch-merge → validate → persist → hand back the typed
//! document for the live reload; nothing invalid ever reaches disk.

use excavator_common::config::{
    ChannelConfig, ConfigError, ConfigFile, PumpConfig, ServoConfig,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;

/// A configuration subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    /// `servo_config.yaml` (PWM channels + pump).
    Servo,
    /// `orientation_tracker_config.yaml`.
    Tracker,
    /// `screen_config.yaml`.
    Screen,
    /// `excavator_config.yaml`.
    Vehicle,
}

impl Subject {
    /// Response `target` name of this subject.
    pub const fn target(self) -> &'static str {
        match self {
            Self::Servo => "pwm_controller",
            Self::Tracker => "orientation_tracker",
            Self::Screen => "screen",
            Self::Vehicle => "excavator",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Servo => 0,
            Self::Tracker => 1,
            Self::Screen => 2,
            Self::Vehicle => 3,
        }
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another query/edit of the same subject is underway.
    #[error("{0} configuration already underway, wait a moment.")]
    Busy(&'static str),

    /// The patch contained nothing new.
    #[error("no values were new")]
    NoChange,

    /// Load, validation or persistence failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Releases the subject's busy flag on drop.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The per-subject config registry.
pub struct ConfigRegistry {
    dir: PathBuf,
    busy: [AtomicBool; 4],
}

impl ConfigRegistry {
    /// Registry over the given config directory.
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            busy: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
        }
    }

    /// The config directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn claim(&self, subject: Subject) -> Result<BusyGuard<'_>, RegistryError> {
        let flag = &self.busy[subject.index()];
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RegistryError::Busy(subject.target()));
        }
        Ok(BusyGuard { flag })
    }

    /// Load `subject`'s document under its busy guard.
    pub fn get<T: ConfigFile>(&self, subject: Subject) -> Result<T, RegistryError> {
        let _guard = self.claim(subject)?;
        Ok(T::load(&self.dir)?)
    }

    /// Patch-merge `subject`, validate, persist and return the new
    /// document. Only fields the document already has are touched;
    /// an effect-free patch is rejected.
    pub fn replace<T: ConfigFile>(
        &self,
        subject: Subject,
        patch: &Value,
    ) -> Result<T, RegistryError> {
        let _guard = self.claim(subject)?;
        let current = T::load(&self.dir)?;
        let mut doc = to_doc(&current)?;
        if !merge_flat(&mut doc, patch) {
            return Err(RegistryError::NoChange);
        }
        let updated: T = from_doc(doc)?;
        updated.store(&self.dir)?;
        info!(target = subject.target(), "configuration updated");
        Ok(updated)
    }

    /// Patch the servo document: a flat pump patch plus per-channel
    /// patches for existing channels.
    pub fn replace_servo(
        &self,
        pump_patch: Option<&Value>,
        channel_patches: Option<&Value>,
    ) -> Result<ServoConfig, RegistryError> {
        let _guard = self.claim(Subject::Servo)?;
        let mut config = ServoConfig::load(&self.dir)?;
        let mut changed = false;

        if let Some(patch) = pump_patch {
            let mut doc = to_doc(&config.pump)?;
            if merge_flat(&mut doc, patch) {
                config.pump = from_doc(doc)?;
                changed = true;
            }
        }
        if let Some(Value::Object(patches)) = channel_patches {
            for (name, patch) in patches {
                let Some(channel) = config.channels.get(name) else {
                    return Err(RegistryError::Config(ConfigError::Validation(format!(
                        "channel {name} does not exist"
                    ))));
                };
                let mut doc = to_doc(channel)?;
                if merge_flat(&mut doc, patch) {
                    config.channels.insert(name.clone(), from_doc(doc)?);
                    changed = true;
                }
            }
        }
        if !changed {
            return Err(RegistryError::NoChange);
        }
        config.store(&self.dir)?;
        info!("servo configuration updated");
        Ok(config)
    }

    /// Add a valve channel to the servo document.
    pub fn add_channel(&self, name: &str, config: &Value) -> Result<ServoConfig, RegistryError> {
        let _guard = self.claim(Subject::Servo)?;
        let mut servo = ServoConfig::load(&self.dir)?;
        let channel: ChannelConfig = from_doc(config.clone())?;
        servo.channels.insert(name.to_string(), channel);
        servo.store(&self.dir)?;
        info!(channel = name, "PWM channel added");
        Ok(servo)
    }

    /// Replace the pump block of the servo document.
    pub fn replace_pump(&self, config: &Value) -> Result<ServoConfig, RegistryError> {
        let _guard = self.claim(Subject::Servo)?;
        let mut servo = ServoConfig::load(&self.dir)?;
        let pump: PumpConfig = from_doc(config.clone())?;
        servo.pump = pump;
        servo.store(&self.dir)?;
        info!("pump configuration replaced");
        Ok(servo)
    }

    /// Remove a valve channel from the servo document. The pump block
    /// is load-bearing and cannot be removed.
    pub fn remove_channel(&self, name: &str) -> Result<ServoConfig, RegistryError> {
        let _guard = self.claim(Subject::Servo)?;
        if name == "pump" {
            return Err(RegistryError::Config(ConfigError::Validation(
                "the pump block cannot be removed".to_string(),
            )));
        }
        let mut servo = ServoConfig::load(&self.dir)?;
        if servo.channels.remove(name).is_none() {
            return Err(RegistryError::Config(ConfigError::Validation(format!(
                "channel {name} does not exist"
            ))));
        }
        servo.store(&self.dir)?;
        info!(channel = name, "PWM channel removed");
        Ok(servo)
    }
}

fn to_doc<T: serde::Serialize>(value: &T) -> Result<Value, RegistryError> {
    serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()).into())
}

fn from_doc<T: DeserializeOwned>(doc: Value) -> Result<T, RegistryError> {
    serde_json::from_value(doc).map_err(|e| ConfigError::Parse(e.to_string()).into())
}

/// Merge `patch` into `current` at the top level: only keys `current`
/// already carries are updated, nulls are skipped, and `true` is
/// returned when anything actually changed.
fn merge_flat(current: &mut Value, patch: &Value) -> bool {
    let (Value::Object(current), Value::Object(patch)) = (current, patch) else {
        return false;
    };
    let mut changed = false;
    for (key, new_value) in patch {
        if new_value.is_null() {
            continue;
        }
        if let Some(old_value) = current.get_mut(key) {
            if old_value != new_value {
                *old_value = new_value.clone();
                changed = true;
            }
        }
    }
    changed
}
