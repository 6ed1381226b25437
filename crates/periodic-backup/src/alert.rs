//! Telling operators about failed backups
//!

use chrono::{DateTime, Utc};
use tracing::error;

/// A failed backup operators should look at.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub database: String,
    pub task_id: u64,
    pub task_name: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Alert {
    /// The title shown to operators.
    pub fn title(&self) -> String {
        format!("Periodic Backup task: '{}'", self.task_name)
    }
}

/// Where alerts are raised.
pub trait AlertSink: Send + Sync {
    /// Raise an alert.
    fn raise(&self, alert: Alert);
}

/// Raises alerts as error log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: Alert) {
        error!(
            "[{}] {}: {} (at {})",
            alert.database,
            alert.title(),
            alert.message,
            alert.at.to_rfc3339()
        );
    }
}
