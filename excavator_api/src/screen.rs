//! Status screen boundary.
//!
//! The OLED view and its renderer live outside this workspace; the
//! daemon only needs a start/stop/show surface. The headless
//! implementation keeps every screen action well-defined on vehicles
//! without a display.

use excavator_common::config::ScreenConfig;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// One message for the screen's render queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenMessage {
    /// Header line.
    pub header: String,
    /// Body text.
    pub body: String,
    /// Seconds one render stays visible.
    pub render_time: f64,
    /// How many times to render.
    pub render_count: i64,
}

/// The screen surface the coordinator drives.
pub trait StatusScreen: Send + Sync {
    /// Enqueue a message for rendering.
    fn show(&self, message: ScreenMessage);

    /// Apply a new configuration.
    fn reload_config(&self, config: ScreenConfig);

    /// Status snapshot for `status_screen`.
    fn status(&self) -> Value;
}

/// No-display implementation: logs instead of rendering.
#[derive(Default)]
pub struct HeadlessScreen {
    messages_shown: AtomicU64,
}

impl StatusScreen for HeadlessScreen {
    fn show(&self, message: ScreenMessage) {
        self.messages_shown.fetch_add(1, Ordering::Relaxed);
        info!(header = %message.header, body = %message.body, "screen message (headless)");
    }

    fn reload_config(&self, _config: ScreenConfig) {}

    fn status(&self) -> Value {
        json!({
            "headless": true,
            "messages_shown": self.messages_shown.load(Ordering::Relaxed),
        })
    }
}
