use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event types written to the external event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    SystemStartup,
    IntruderDetected,
    SystemReset,
    SystemArmed,
    SystemDisarmed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SystemStartup => "SYSTEM_STARTUP",
            EventKind::IntruderDetected => "INTRUDER_DETECTED",
            EventKind::SystemReset => "SYSTEM_RESET",
            EventKind::SystemArmed => "SYSTEM_ARMED",
            EventKind::SystemDisarmed => "SYSTEM_DISARMED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable event-log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub details: Option<String>,
    pub image_path: Option<PathBuf>,
}

impl SystemEvent {
    pub fn new(kind: EventKind, details: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            details,
            image_path: None,
        }
    }

    pub fn with_image(mut self, image_path: Option<PathBuf>) -> Self {
        self.image_path = image_path;
        self
    }
}

/// What the alert channels are told about a confirmed intrusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: EventKind,
    pub subject_name: String,
    pub image_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn intruder(subject_name: impl Into<String>, image_path: Option<PathBuf>) -> Self {
        Self {
            kind: EventKind::IntruderDetected,
            subject_name: subject_name.into(),
            image_path,
            timestamp: Utc::now(),
        }
    }
}
