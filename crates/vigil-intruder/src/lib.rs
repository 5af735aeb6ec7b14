//! Debounced intruder confirmation and decay.

mod window;

use tokio::time::{Duration, Instant};
use tracing::info;
use vigil_types::{config::IntruderConfig, status::SystemStatus};

pub use window::IntruderWindow;

pub const INTRUDER_STATUS_TEXT: &str = "Status: INTRUDER ALERT!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntruderState {
    Idle,
    /// Alarm active and the intruder was seen on the latest cycle.
    Confirmed,
    /// Alarm active but the intruder has not been seen since `since`.
    PendingReset { since: Instant },
}

impl IntruderState {
    pub fn is_alarmed(&self) -> bool {
        !matches!(self, IntruderState::Idle)
    }
}

/// State change produced by one cycle, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Idle to alarmed. The caller snapshots the frame, logs and alerts.
    Confirmed,
    /// The intruder stayed out of sight for the whole patience interval.
    Cleared,
    /// Disarming cancelled an active alarm.
    Disarmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub transition: Option<Transition>,
    pub status_text: String,
    /// Empty unless a reset countdown is running.
    pub patience_text: String,
}

pub struct IntruderStateMachine {
    window: IntruderWindow,
    state: IntruderState,
    patience: Duration,
}

impl IntruderStateMachine {
    pub fn new(threshold_frames: usize, patience: Duration) -> Self {
        Self {
            window: IntruderWindow::new(threshold_frames),
            state: IntruderState::Idle,
            patience,
        }
    }

    /// Out-of-range patience is clamped to `[0, MAX_PATIENCE_SECS]`; NaN
    /// becomes zero.
    pub fn from_config(config: &IntruderConfig) -> Self {
        let secs = config
            .patience_secs
            .clamp(0.0, IntruderConfig::MAX_PATIENCE_SECS);
        Self::new(
            config.threshold_frames,
            Duration::try_from_secs_f64(secs).unwrap_or_default(),
        )
    }

    pub fn state(&self) -> IntruderState {
        self.state
    }

    pub fn window(&self) -> &IntruderWindow {
        &self.window
    }

    /// Folds one processed frame into the machine. `status` is read fresh
    /// by the caller every cycle, so a disarm takes effect immediately.
    pub fn step(&mut self, unknown_seen: bool, status: SystemStatus, now: Instant) -> StepOutcome {
        let mut transition = None;
        self.window.push(unknown_seen);

        if self.window.all_true() && !self.state.is_alarmed() && status.is_armed() {
            info!(frames = self.window.capacity(), "Intruder confirmed while armed");
            self.state = IntruderState::Confirmed;
            transition = Some(Transition::Confirmed);
        } else if !status.is_armed() && self.state.is_alarmed() {
            info!("System disarmed, clearing intruder alarm");
            self.clear();
            transition = Some(Transition::Disarmed);
        }

        if self.state.is_alarmed() {
            if unknown_seen {
                self.state = IntruderState::Confirmed;
            } else {
                let since = match self.state {
                    IntruderState::PendingReset { since } => since,
                    _ => now,
                };
                self.state = IntruderState::PendingReset { since };
                if now.saturating_duration_since(since) >= self.patience {
                    info!(
                        patience_secs = self.patience.as_secs_f64(),
                        "Intruder no longer seen, resetting"
                    );
                    self.clear();
                    transition = Some(Transition::Cleared);
                }
            }
        }

        StepOutcome {
            transition,
            status_text: self.status_text(status),
            patience_text: self.patience_text(now),
        }
    }

    fn clear(&mut self) {
        self.state = IntruderState::Idle;
        self.window.reset();
    }

    fn status_text(&self, status: SystemStatus) -> String {
        if self.state.is_alarmed() {
            INTRUDER_STATUS_TEXT.to_string()
        } else {
            format!("Status: {status}")
        }
    }

    fn patience_text(&self, now: Instant) -> String {
        match self.state {
            IntruderState::PendingReset { since } => {
                let left = self
                    .patience
                    .saturating_sub(now.saturating_duration_since(since));
                format!("Resetting in: {:.1}s", left.as_secs_f64())
            }
            _ => String::new(),
        }
    }
}
