use std::{
    ffi::OsString,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;
use vigil_types::{status::SystemStatus, Result};

/// Persistent armed/disarmed switch shared with the operator.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get_status(&self) -> Result<SystemStatus>;
    async fn set_status(&self, status: SystemStatus) -> Result<()>;
}

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Single-word text file. Created as `ARMED` on first read.
///
/// Writes go to a sibling staging file that is then renamed over the real
/// one, so a concurrent reader sees either the old word or the new one.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    path: PathBuf,
}

impl FileStatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("status"));
        name.push(format!(
            ".{}-{}.tmp",
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn get_status(&self) -> Result<SystemStatus> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw.parse(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?self.path, "Status file missing, initialising as ARMED");
                self.set_status(SystemStatus::Armed).await?;
                Ok(SystemStatus::Armed)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn set_status(&self, status: SystemStatus) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.staging_path();
        tokio::fs::write(&staging, status.as_str()).await?;
        if let Err(err) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStatusStore {
    status: Arc<RwLock<SystemStatus>>,
}

impl MemoryStatusStore {
    pub fn new(status: SystemStatus) -> Self {
        Self {
            status: Arc::new(RwLock::new(status)),
        }
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get_status(&self) -> Result<SystemStatus> {
        Ok(*self.status.read().await)
    }

    async fn set_status(&self, status: SystemStatus) -> Result<()> {
        *self.status.write().await = status;
        Ok(())
    }
}
