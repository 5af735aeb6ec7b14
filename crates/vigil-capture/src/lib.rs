//! Camera acquisition: frame sources and the reconnecting capture loop.

mod ffmpeg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_types::{
    config::CameraConfig, frame::Frame, shared::SharedFrameState, Result, VigilError,
};

pub use ffmpeg::FfmpegSource;

/// Blocking-style access to a camera device.
#[async_trait]
pub trait FrameSource: Send {
    async fn open(&mut self) -> Result<()>;
    async fn capture(&mut self) -> Result<Frame>;
    async fn release(&mut self);
    fn describe(&self) -> String;

    /// Releases the device, waits out `backoff`, then opens it again.
    async fn reconnect(&mut self, backoff: Duration) -> Result<()> {
        self.release().await;
        sleep(backoff).await;
        self.open().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub backoff: Duration,
    pub max_attempts: u8,
}

impl ReconnectPolicy {
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            backoff: Duration::from_millis(config.reconnect_backoff_ms),
            max_attempts: config.max_reconnect_attempts.max(1),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&CameraConfig::default())
    }
}

/// Counters kept by the acquisition loop.
#[derive(Debug, Default, Clone)]
pub struct CaptureMetrics {
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub reconnects: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionExit {
    /// The stop signal fired.
    Stopped,
    /// Reconnection gave up; the shared state keeps serving the last frame.
    DeviceLost,
}

#[derive(Debug, Clone)]
pub struct AcquisitionReport {
    pub exit: AcquisitionExit,
    pub metrics: CaptureMetrics,
}

/// Captures frames until cancelled or until the device is irrecoverably lost,
/// publishing each one into `shared`. The device is always released on exit.
pub async fn run_acquisition<S>(
    source: &mut S,
    shared: SharedFrameState,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) -> AcquisitionReport
where
    S: FrameSource + ?Sized,
{
    info!(source = %source.describe(), "Acquisition task started");
    let mut metrics = CaptureMetrics::default();

    let exit = loop {
        let captured = tokio::select! {
            _ = cancel.cancelled() => break AcquisitionExit::Stopped,
            captured = source.capture() => captured,
        };

        match captured {
            Ok(frame) => {
                metrics.frames_captured += 1;
                metrics.last_frame_at = Some(frame.captured_at);
                shared.publish_frame(frame);
            }
            Err(err) => {
                metrics.capture_failures += 1;
                warn!(error = %err, "Frame not received, reconnecting");
                match recover(source, policy, &cancel, &mut metrics).await {
                    Some(exit) => break exit,
                    None => continue,
                }
            }
        }
    };

    source.release().await;
    match exit {
        AcquisitionExit::Stopped => info!(
            frames = metrics.frames_captured,
            "Acquisition task stopped"
        ),
        AcquisitionExit::DeviceLost => error!(
            frames = metrics.frames_captured,
            failures = metrics.capture_failures,
            "Could not reconnect to camera, acquisition task exiting"
        ),
    }
    AcquisitionReport { exit, metrics }
}

/// Returns `None` once the device is back, or the reason the loop must end.
async fn recover<S>(
    source: &mut S,
    policy: ReconnectPolicy,
    cancel: &CancellationToken,
    metrics: &mut CaptureMetrics,
) -> Option<AcquisitionExit>
where
    S: FrameSource + ?Sized,
{
    for attempt in 1..=policy.max_attempts {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Some(AcquisitionExit::Stopped),
            result = source.reconnect(policy.backoff) => result,
        };
        match result {
            Ok(()) => {
                metrics.reconnects += 1;
                info!(attempt, "Camera reconnected");
                return None;
            }
            Err(err) => warn!(
                attempt,
                max = policy.max_attempts,
                error = %err,
                "Reconnect attempt failed"
            ),
        }
    }
    Some(AcquisitionExit::DeviceLost)
}

/// Deterministic in-process source: a bright square sweeping across a dark
/// background. Failures can be scripted for exercising the reconnect path.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    seq: u64,
    frame_interval: Duration,
    is_open: bool,
    capture_failures: u32,
    open_failures: u32,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            seq: 0,
            frame_interval: Duration::from_millis(33),
            is_open: false,
            capture_failures: 0,
            open_failures: 0,
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// The next `count` captures fail.
    pub fn failing_captures(mut self, count: u32) -> Self {
        self.capture_failures = count;
        self
    }

    /// The next `count` open attempts fail.
    pub fn failing_opens(mut self, count: u32) -> Self {
        self.open_failures = count;
        self
    }

    fn render(&self) -> Result<Frame> {
        let side = (self.width.min(self.height) / 4).max(1);
        let span = self.width.saturating_sub(side).max(1);
        let x0 = ((self.seq * 4) % span as u64) as u32;
        let y0 = (self.height - side) / 2;
        let mut data = vec![16u8; Frame::buffer_len(self.width, self.height)];
        for y in y0..y0 + side {
            for x in x0..(x0 + side).min(self.width) {
                let idx = ((y * self.width + x) as usize) * 3;
                data[idx..idx + 3].copy_from_slice(&[240, 240, 240]);
            }
        }
        Frame::from_rgb(self.seq, self.width, self.height, data)
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn open(&mut self) -> Result<()> {
        if self.open_failures > 0 {
            self.open_failures -= 1;
            return Err(capture_error("synthetic device refused to open"));
        }
        debug!("Synthetic source opened ({}x{})", self.width, self.height);
        self.is_open = true;
        Ok(())
    }

    async fn capture(&mut self) -> Result<Frame> {
        if !self.is_open {
            return Err(capture_error("synthetic device is not open"));
        }
        sleep(self.frame_interval).await;
        if self.capture_failures > 0 {
            self.capture_failures -= 1;
            return Err(capture_error("synthetic frame dropped"));
        }
        self.seq += 1;
        self.render()
    }

    async fn release(&mut self) {
        self.is_open = false;
    }

    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }
}

/// Generate an error aligned with capture semantics.
pub fn capture_error(message: impl Into<String>) -> VigilError {
    VigilError::Capture(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u8) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: Duration::from_secs(2),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_frames_until_cancelled() {
        let shared = SharedFrameState::new();
        let cancel = CancellationToken::new();
        let mut source = SyntheticSource::new(32, 24);
        source.open().await.expect("open");

        let stopper = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            stopper.cancel();
        });

        let report = run_acquisition(&mut source, shared.clone(), fast_policy(3), cancel).await;
        assert_eq!(report.exit, AcquisitionExit::Stopped);
        assert!(report.metrics.frames_captured > 5);
        let latest = shared.latest_frame().expect("frame published");
        assert_eq!(latest.seq, report.metrics.frames_captured);
        assert!(!source.is_open, "device released on exit");
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_a_dropped_frame() {
        let shared = SharedFrameState::new();
        let cancel = CancellationToken::new();
        let mut source = SyntheticSource::new(16, 16).failing_captures(1);
        source.open().await.expect("open");

        let stopper = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        let report = run_acquisition(&mut source, shared.clone(), fast_policy(3), cancel).await;
        assert_eq!(report.exit, AcquisitionExit::Stopped);
        assert_eq!(report.metrics.capture_failures, 1);
        assert_eq!(report.metrics.reconnects, 1);
        assert!(shared.latest_frame().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_repeated_reopen_failures() {
        let shared = SharedFrameState::new();
        let mut source = SyntheticSource::new(16, 16);
        source.open().await.expect("open");
        let first = source.capture().await.expect("first frame");
        shared.publish_frame(first);

        let mut source = source.failing_captures(1).failing_opens(3);
        let report = run_acquisition(
            &mut source,
            shared.clone(),
            fast_policy(3),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(report.exit, AcquisitionExit::DeviceLost);
        assert_eq!(report.metrics.reconnects, 0);
        // The stale frame stays available to viewers.
        assert_eq!(shared.latest_frame().map(|f| f.seq), Some(1));
    }
}
