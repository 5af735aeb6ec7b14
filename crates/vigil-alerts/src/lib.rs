//! Cooldown-gated, non-blocking alert fan-out.
//!
//! [`AlertDispatcher`] hands events to a single worker task over a bounded
//! queue. The worker owns each channel's last-fired instant and spawns one
//! short-lived task per firing, so a slow or failing transport never holds up
//! the caller or the other channels.

mod audible;
mod email;
mod sms;

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_types::{config::AlertsConfig, events::AlertEvent};

pub use audible::AudibleChannel;
pub use email::{EmailChannel, EmailError};
pub use sms::SmsChannel;

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected the alert ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Email(#[from] EmailError),

    #[error("alert I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Channel(String),
}

/// One way of telling someone about an intrusion.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Minimum spacing between two firings of this channel.
    fn cooldown(&self) -> Duration;

    async fn fire(&self, event: &AlertEvent) -> Result<(), AlertError>;
}

/// Every channel whose configuration is complete.
pub fn channels_from_config(config: &AlertsConfig) -> Vec<Arc<dyn AlertChannel>> {
    let mut channels: Vec<Arc<dyn AlertChannel>> =
        vec![Arc::new(AudibleChannel::from_config(&config.audible))];

    match SmsChannel::from_config(&config.sms) {
        Some(channel) => channels.push(Arc::new(channel)),
        None => info!("SMS alerts disabled (Twilio not configured or no admin number)"),
    }
    match EmailChannel::from_config(&config.email) {
        Some(channel) => channels.push(Arc::new(channel)),
        None => info!("Email alerts disabled (credentials not set)"),
    }
    channels
}

/// Handle for queueing alerts. Dropping every handle stops the worker once
/// in-flight firings finish.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<AlertEvent>,
}

impl AlertDispatcher {
    pub fn spawn(
        channels: Vec<Arc<dyn AlertChannel>>,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let worker = DispatchWorker {
            slots: channels
                .into_iter()
                .map(|channel| ChannelSlot {
                    channel,
                    last_fired: None,
                })
                .collect(),
            rx,
            cancel,
        };
        let handle = tokio::spawn(worker.run());
        (Self { tx }, handle)
    }

    /// Queues an intruder alert without waiting. Returns `false` if the queue
    /// is full or the worker has stopped; the alert is dropped in that case.
    pub fn dispatch(&self, subject_name: &str, image_path: Option<PathBuf>) -> bool {
        self.dispatch_event(AlertEvent::intruder(subject_name, image_path))
    }

    pub fn dispatch_event(&self, event: AlertEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Alert queue full, dropping alert");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Alert dispatcher stopped, dropping alert");
                false
            }
        }
    }
}

struct ChannelSlot {
    channel: Arc<dyn AlertChannel>,
    last_fired: Option<Instant>,
}

impl ChannelSlot {
    /// Claims the channel if its cooldown has elapsed. The stamp is taken at
    /// attempt time, so a failed attempt still starts a cooldown.
    fn try_claim(&mut self, now: Instant) -> bool {
        let ready = self
            .last_fired
            .map_or(true, |at| now.saturating_duration_since(at) > self.channel.cooldown());
        if ready {
            self.last_fired = Some(now);
        }
        ready
    }
}

struct DispatchWorker {
    slots: Vec<ChannelSlot>,
    rx: mpsc::Receiver<AlertEvent>,
    cancel: CancellationToken,
}

impl DispatchWorker {
    async fn run(mut self) {
        info!(channels = self.slots.len(), "Alert dispatcher started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    in_flight.shutdown().await;
                    break;
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                event = self.rx.recv() => match event {
                    Some(event) => self.fan_out(&event, &mut in_flight),
                    None => {
                        while in_flight.join_next().await.is_some() {}
                        break;
                    }
                },
            }
        }
        info!("Alert dispatcher stopped");
    }

    fn fan_out(&mut self, event: &AlertEvent, in_flight: &mut JoinSet<()>) {
        let now = Instant::now();
        for slot in &mut self.slots {
            let name = slot.channel.name();
            if !slot.try_claim(now) {
                debug!(channel = name, "Alert channel in cooldown, skipping");
                continue;
            }
            let channel = slot.channel.clone();
            let event = event.clone();
            in_flight.spawn(async move {
                match channel.fire(&event).await {
                    Ok(()) => info!(channel = name, subject = %event.subject_name, "Alert sent"),
                    Err(err) => warn!(channel = name, error = %err, "Alert channel failed"),
                }
            });
        }
    }
}

/// Channel that records what it was asked to send. Used to observe dispatch
/// behaviour without real transports.
pub struct RecordingChannel {
    name: &'static str,
    cooldown: Duration,
    fail: bool,
    fired: Arc<Mutex<Vec<AlertEvent>>>,
}

impl RecordingChannel {
    pub fn new(name: &'static str, cooldown: Duration) -> Self {
        Self {
            name,
            cooldown,
            fail: false,
            fired: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every firing returns an error after being recorded.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Shared view of the recorded events, usable after the channel has been
    /// handed to a dispatcher.
    pub fn log(&self) -> Arc<Mutex<Vec<AlertEvent>>> {
        self.fired.clone()
    }

    pub fn count(log: &Mutex<Vec<AlertEvent>>) -> usize {
        log.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl AlertChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        self.name
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn fire(&self, event: &AlertEvent) -> Result<(), AlertError> {
        self.fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        if self.fail {
            return Err(AlertError::Channel(format!("{} refused the alert", self.name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_dispatch_within_cooldown_is_dropped() {
        let beep = RecordingChannel::new("beep", Duration::from_secs(10));
        let beeps = beep.log();
        let (dispatcher, _worker) =
            AlertDispatcher::spawn(vec![Arc::new(beep)], 8, CancellationToken::new());

        assert!(dispatcher.dispatch("Unknown person", None));
        assert!(dispatcher.dispatch("Unknown person", None));
        settle().await;
        assert_eq!(RecordingChannel::count(&beeps), 1);

        sleep(Duration::from_secs(11)).await;
        assert!(dispatcher.dispatch("Unknown person", None));
        settle().await;
        assert_eq!(RecordingChannel::count(&beeps), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn channels_keep_independent_cooldowns() {
        let beep = RecordingChannel::new("beep", Duration::from_secs(10));
        let sms = RecordingChannel::new("sms", Duration::from_secs(300));
        let (beeps, texts) = (beep.log(), sms.log());
        let (dispatcher, _worker) = AlertDispatcher::spawn(
            vec![Arc::new(beep), Arc::new(sms)],
            8,
            CancellationToken::new(),
        );

        dispatcher.dispatch("Unknown person", Some("intruders/a.jpg".into()));
        settle().await;
        sleep(Duration::from_secs(60)).await;
        dispatcher.dispatch("Unknown person", Some("intruders/b.jpg".into()));
        settle().await;

        assert_eq!(RecordingChannel::count(&beeps), 2);
        assert_eq!(RecordingChannel::count(&texts), 1);
        let first = texts.lock().expect("log")[0].clone();
        assert_eq!(first.image_path, Some(PathBuf::from("intruders/a.jpg")));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_channel_does_not_block_the_others() {
        let broken = RecordingChannel::new("sms", Duration::from_secs(300)).failing();
        let beep = RecordingChannel::new("beep", Duration::from_secs(10));
        let (attempts, beeps) = (broken.log(), beep.log());
        let (dispatcher, _worker) = AlertDispatcher::spawn(
            vec![Arc::new(broken), Arc::new(beep)],
            8,
            CancellationToken::new(),
        );

        dispatcher.dispatch("Unknown person", None);
        settle().await;
        assert_eq!(RecordingChannel::count(&attempts), 1);
        assert_eq!(RecordingChannel::count(&beeps), 1);

        // A failed attempt is not retried and still starts the cooldown.
        dispatcher.dispatch("Unknown person", None);
        settle().await;
        assert_eq!(RecordingChannel::count(&attempts), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_exits_when_handles_are_dropped() {
        let beep = RecordingChannel::new("beep", Duration::from_secs(10));
        let (dispatcher, worker) =
            AlertDispatcher::spawn(vec![Arc::new(beep)], 1, CancellationToken::new());
        dispatcher.dispatch("Unknown person", None);
        drop(dispatcher);
        worker.await.expect("worker joins");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_dispatcher_rejects_new_alerts() {
        let cancel = CancellationToken::new();
        let (dispatcher, worker) = AlertDispatcher::spawn(Vec::new(), 1, cancel.clone());
        cancel.cancel();
        worker.await.expect("worker joins");
        assert!(!dispatcher.dispatch("Unknown person", None));
    }

    #[test]
    fn unconfigured_remote_channels_are_skipped() {
        let channels = channels_from_config(&AlertsConfig::default());
        let names: Vec<&str> = channels.iter().map(|channel| channel.name()).collect();
        assert_eq!(names, vec!["audible"]);
    }
}
