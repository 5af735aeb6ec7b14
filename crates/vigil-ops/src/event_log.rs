use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;
use vigil_types::{events::SystemEvent, Result};

use crate::ops_error;

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: SystemEvent) -> Result<()>;

    /// Up to `limit` most recent events, newest first.
    async fn latest(&self, limit: usize) -> Result<Vec<SystemEvent>>;
}

/// Newline-delimited JSON file, one event per line.
#[derive(Clone)]
pub struct JsonlEventLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: SystemEvent) -> Result<()> {
        let mut line = serde_json::to_string(&event)
            .map_err(|err| ops_error(format!("event encode failed: {err}")))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn latest(&self, limit: usize) -> Result<Vec<SystemEvent>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut events = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SystemEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => warn!(line = line_no + 1, error = %err, "Skipping malformed event"),
            }
        }
        Ok(events.into_iter().rev().take(limit).collect())
    }
}

/// In-memory event log for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryEventLog {
    events: Arc<Mutex<Vec<SystemEvent>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event recorded so far, oldest first.
    pub async fn snapshot(&self) -> Vec<SystemEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: SystemEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn latest(&self, limit: usize) -> Result<Vec<SystemEvent>> {
        let events = self.events.lock().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::events::EventKind;

    fn scratch_file() -> PathBuf {
        std::env::temp_dir()
            .join(format!("vigil-events-{}", uuid::Uuid::new_v4()))
            .join("security_events.jsonl")
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let log = JsonlEventLog::new(scratch_file());
        assert!(log.latest(20).await.expect("latest").is_empty());
    }

    #[tokio::test]
    async fn latest_returns_newest_first() {
        let path = scratch_file();
        let log = JsonlEventLog::new(&path);
        log.append(SystemEvent::new(
            EventKind::SystemStartup,
            Some("Security system started.".into()),
        ))
        .await
        .expect("append");
        log.append(
            SystemEvent::new(
                EventKind::IntruderDetected,
                Some("Unknown person confirmed.".into()),
            )
            .with_image(Some("intruders/intruder_x.jpg".into())),
        )
        .await
        .expect("append");
        log.append(SystemEvent::new(EventKind::SystemReset, None))
            .await
            .expect("append");

        let latest = log.latest(2).await.expect("latest");
        let kinds: Vec<EventKind> = latest.iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![EventKind::SystemReset, EventKind::IntruderDetected]);
        assert_eq!(
            latest[1].image_path.as_deref(),
            Some(std::path::Path::new("intruders/intruder_x.jpg"))
        );

        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let path = scratch_file();
        let log = JsonlEventLog::new(&path);
        log.append(SystemEvent::new(EventKind::SystemArmed, None))
            .await
            .expect("append");
        let mut raw = std::fs::read_to_string(&path).expect("read back");
        raw.push_str("{not json}\n");
        std::fs::write(&path, raw).expect("corrupt log");

        let latest = log.latest(20).await.expect("latest");
        assert_eq!(latest.len(), 1);

        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[tokio::test]
    async fn memory_log_limits_results() {
        let log = MemoryEventLog::new();
        for _ in 0..5 {
            log.append(SystemEvent::new(EventKind::SystemReset, None))
                .await
                .expect("append");
        }
        assert_eq!(log.latest(3).await.expect("latest").len(), 3);
        assert_eq!(log.snapshot().await.len(), 5);
    }
}
