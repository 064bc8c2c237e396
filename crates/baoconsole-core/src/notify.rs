//! Toast-style notifications raised by background components.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: Option<String>,
}

impl Notification {
    pub fn new(level: NotificationLevel, title: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.title, message),
            None => f.write_str(&self.title),
        }
    }
}

/// Displays notifications to whoever is watching.
pub trait Notifier: Send + Sync {
    fn emit(&self, notification: Notification);
}

/// Notifier that writes to the log. The default for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn emit(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Info | NotificationLevel::Success => info!(%notification, "Notification"),
            NotificationLevel::Warning => warn!(%notification, "Notification"),
            NotificationLevel::Error => error!(%notification, "Notification"),
        }
    }
}
