//! Status screen configuration (`screen_config.yaml`).

use super::{violations, ConfigError, ConfigFile};
use crate::consts::{FONT_SIZE_MAX, FONT_SIZE_MIN, RENDER_TIME_MAX_S, RENDER_TIME_MIN_S};
use serde::{Deserialize, Serialize};

/// OLED status view settings. The renderer itself lives outside this
/// workspace; only the validated document is owned here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScreenConfig {
    /// How long one view stays on screen [s].
    pub render_time: f64,
    /// Header font size [pt].
    pub font_size_header: i64,
    /// Body font size [pt].
    pub font_size_body: i64,
}

impl ConfigFile for ScreenConfig {
    const FILE_NAME: &'static str = "screen_config.yaml";

    fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if !(self.render_time > RENDER_TIME_MIN_S && self.render_time < RENDER_TIME_MAX_S) {
            errors.push(format!(
                "render_time {} outside ({RENDER_TIME_MIN_S}, {RENDER_TIME_MAX_S})",
                self.render_time
            ));
        }
        for (label, size) in [("font_size_header", self.font_size_header),
                              ("font_size_body", self.font_size_body)] {
            if !(size > FONT_SIZE_MIN && size < FONT_SIZE_MAX) {
                errors.push(format!("{label} {size} outside ({FONT_SIZE_MIN}, {FONT_SIZE_MAX})"));
            }
        }
        violations(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_exclusive() {
        let cfg = ScreenConfig { render_time: 0.1, font_size_header: 10, font_size_body: 8 };
        assert!(cfg.validate().is_err());

        let cfg = ScreenConfig { render_time: 0.5, font_size_header: 30, font_size_body: 8 };
        assert!(cfg.validate().is_err());

        let cfg = ScreenConfig { render_time: 0.5, font_size_header: 12, font_size_body: 8 };
        cfg.validate().unwrap();
    }
}
