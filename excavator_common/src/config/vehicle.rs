//! Top-level vehicle configuration (`excavator_config.yaml`).

use super::{ConfigError, ConfigFile};
use serde::{Deserialize, Serialize};

/// Vehicle-level switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleConfig {
    /// Whether an OLED status screen is fitted.
    pub has_screen: bool,
}

impl ConfigFile for VehicleConfig {
    const FILE_NAME: &'static str = "excavator_config.yaml";

    fn validate(&self) -> Result<(), ConfigError> {
        // A lone boolean; serde already guarantees the type.
        Ok(())
    }
}
