//! Operational helpers: logging setup and the event/status stores.

mod event_log;
mod status_store;

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use vigil_types::{
    config::OpsConfig,
    events::{EventKind, SystemEvent},
    status::SystemStatus,
    Result, VigilError,
};

pub use event_log::{EventLog, JsonlEventLog, MemoryEventLog};
pub use status_store::{FileStatusStore, MemoryStatusStore, StatusStore};

pub fn init_tracing(config: &OpsConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| ops_error(format!("failed to create log filter: {err}")))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| ops_error(format!("tracing init error: {err}")))?;
    Ok(())
}

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = path.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)
        .map_err(|err| ops_error(format!("failed to create {:?}: {err}", dir)))?;
    info!("Directory ready at {:?}", dir);
    Ok(dir)
}

/// Appends `event`, logging instead of returning a failure.
pub async fn record_event<L: EventLog + ?Sized>(log: &L, event: SystemEvent) {
    let kind = event.kind;
    if let Err(err) = log.append(event).await {
        warn!(kind = %kind, error = %err, "Could not write event log entry");
    }
}

/// Reads the armed flag, falling back to armed when the store is unreadable.
pub async fn current_status<S: StatusStore + ?Sized>(store: &S) -> SystemStatus {
    match store.get_status().await {
        Ok(status) => status,
        Err(err) => {
            warn!(error = %err, "Could not read system status, assuming ARMED");
            SystemStatus::Armed
        }
    }
}

/// Persists a new armed flag and records the change. `origin` names where
/// the request came from, e.g. "command line".
pub async fn change_status<S, L>(
    store: &S,
    log: &L,
    status: SystemStatus,
    origin: &str,
) -> Result<()>
where
    S: StatusStore + ?Sized,
    L: EventLog + ?Sized,
{
    store.set_status(status).await?;
    let kind = match status {
        SystemStatus::Armed => EventKind::SystemArmed,
        SystemStatus::Disarmed => EventKind::SystemDisarmed,
    };
    let details = format!(
        "System {} from {origin}.",
        status.as_str().to_ascii_lowercase()
    );
    record_event(log, SystemEvent::new(kind, Some(details))).await;
    info!(status = %status, "System status changed");
    Ok(())
}

pub fn ops_error(message: impl Into<String>) -> VigilError {
    VigilError::Ops(message.into())
}
