//! Configuration types, YAML persistence and validation.
//!
//! Each configurable subject (servo/PWM, orientation tracker, screen,
//! vehicle) owns one human-editable YAML file under the config directory.
//! All types parse strictly (`deny_unknown_fields`) and expose a
//! `validate()` that collects every violation before failing, so an
//! operator sees the whole list at once.

use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod screen;
pub mod servo;
pub mod tracker;
pub mod vehicle;

pub use screen::ScreenConfig;
pub use servo::{ChannelConfig, PumpConfig, ServoConfig};
pub use tracker::TrackerConfig;
pub use vehicle::VehicleConfig;

/// Error type for configuration loading and storing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found at the expected path.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// Full path that was probed.
        path: PathBuf,
    },

    /// YAML parsing failed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Semantic validation failed. The message lists every violation.
    #[error("configuration validation failed:\n{0}")]
    Validation(String),

    /// Underlying filesystem error.
    #[error("config I/O error: {source}")]
    Io {
        /// Source I/O error.
        #[from]
        source: std::io::Error,
    },
}

/// A configuration subject persisted as one YAML file.
///
/// # Contract
///
/// - `load` returns [`ConfigError::FileNotFound`] if the file is absent,
///   [`ConfigError::Parse`] on YAML syntax errors and
///   [`ConfigError::Validation`] when semantic validation fails.
/// - `store` validates before writing; an invalid document never reaches
///   disk.
pub trait ConfigFile: Sized + Serialize + DeserializeOwned {
    /// File name inside the config directory, e.g. `servo_config.yaml`.
    const FILE_NAME: &'static str;

    /// Semantic validation. Implementations collect all violations into
    /// one [`ConfigError::Validation`].
    fn validate(&self) -> Result<(), ConfigError>;

    /// Full path of this subject's file inside `dir`.
    fn path_in(dir: &Path) -> PathBuf {
        dir.join(Self::FILE_NAME)
    }

    /// Load and validate this subject from `dir`.
    fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_in(dir);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound { path: path.clone() }
            } else {
                ConfigError::Io { source: e }
            }
        })?;
        let parsed: Self =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate and persist this subject into `dir`.
    fn store(&self, dir: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let body =
            serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(Self::path_in(dir), body)?;
        Ok(())
    }
}

/// Turn a list of collected violations into a validation error, or `Ok`
/// when the list is empty.
pub(crate) fn violations(errors: Vec<String>) -> Result<(), ConfigError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_missing_file_is_file_not_found() {
        let dir = tempdir().unwrap();
        let err = VehicleConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let cfg = VehicleConfig { has_screen: true };
        cfg.store(dir.path()).unwrap();
        let loaded = VehicleConfig::load(dir.path()).unwrap();
        assert!(loaded.has_screen);
    }

    #[test]
    fn parse_error_on_garbage() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(VehicleConfig::FILE_NAME), ": {{not yaml").unwrap();
        let err = VehicleConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(VehicleConfig::FILE_NAME),
            "has_screen: false\nextra_field: 1\n",
        )
        .unwrap();
        assert!(VehicleConfig::load(dir.path()).is_err());
    }
}
