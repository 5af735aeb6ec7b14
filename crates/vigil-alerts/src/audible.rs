use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::{process::Command, time::Duration};
use tracing::{info, warn};
use vigil_types::{config::AudibleConfig, events::AlertEvent};

use crate::{AlertChannel, AlertError};

/// Plays a sound file through an external player such as `aplay`.
#[derive(Debug, Clone)]
pub struct AudibleChannel {
    sound_file: PathBuf,
    player: String,
    cooldown: Duration,
}

impl AudibleChannel {
    pub fn from_config(config: &AudibleConfig) -> Self {
        Self {
            sound_file: PathBuf::from(&config.sound_file),
            player: config.player.clone(),
            cooldown: Duration::from_secs(config.cooldown_secs),
        }
    }
}

#[async_trait]
impl AlertChannel for AudibleChannel {
    fn name(&self) -> &'static str {
        "audible"
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn fire(&self, _event: &AlertEvent) -> Result<(), AlertError> {
        // A missing sound file still uses up the cooldown.
        if !self.sound_file.exists() {
            warn!(path = ?self.sound_file, "Alert sound file not found");
            return Ok(());
        }

        info!("Playing beep alert");
        let status = Command::new(&self.player)
            .arg(&self.sound_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(AlertError::Channel(format!(
                "{} exited with {status}",
                self.player
            )));
        }
        Ok(())
    }
}
