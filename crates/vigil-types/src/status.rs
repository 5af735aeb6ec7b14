use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::VigilError;

/// Armed/disarmed switch owned by the external status store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemStatus {
    Armed,
    Disarmed,
}

impl SystemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemStatus::Armed => "ARMED",
            SystemStatus::Disarmed => "DISARMED",
        }
    }

    pub fn is_armed(self) -> bool {
        matches!(self, SystemStatus::Armed)
    }
}

impl Default for SystemStatus {
    fn default() -> Self {
        SystemStatus::Armed
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemStatus {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ARMED" => Ok(SystemStatus::Armed),
            "DISARMED" => Ok(SystemStatus::Disarmed),
            other => Err(VigilError::Ops(format!("unrecognised system status '{other}'"))),
        }
    }
}
