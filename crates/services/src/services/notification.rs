//! User-visible, non-blocking alerts raised by the task engine.

use parking_lot::Mutex;
use tracing::warn;

pub trait AlertSink: Send + Sync {
    fn alert(&self, title: &str, message: &str);
}

/// Default sink: alerts only go to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, title: &str, message: &str) {
        warn!(title = %title, "{}", message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub title: String,
    pub message: String,
}

/// Keeps every alert so a presentation layer (or a test) can drain them.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn take(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }
}

impl AlertSink for RecordingAlertSink {
    fn alert(&self, title: &str, message: &str) {
        self.alerts.lock().push(Alert {
            title: title.to_string(),
            message: message.to_string(),
        });
    }
}
