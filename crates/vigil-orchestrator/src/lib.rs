//! Wires capture, detection, intruder tracking and alerting into the two
//! long-running monitor tasks.

use std::{path::PathBuf, sync::Arc};

use chrono::Local;
use tokio::{
    task::JoinHandle,
    time::{sleep, timeout, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_alerts::{AlertChannel, AlertDispatcher};
use vigil_capture::{run_acquisition, AcquisitionReport, FrameSource, ReconnectPolicy};
use vigil_intruder::{IntruderStateMachine, Transition};
use vigil_ops::{current_status, record_event, EventLog, StatusStore};
use vigil_types::{
    config::{DetectionConfig, VigilConfig},
    events::{EventKind, SystemEvent},
    frame::Frame,
    shared::SharedFrameState,
    Result, VigilError,
};
use vigil_vision::{
    save_intruder_snapshot, DetectionPipeline, FaceAnalyzer, KnownFaceDatabase, KnownFaceStore,
};

/// How long shutdown waits for in-flight alerts before abandoning them.
const ALERT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The external stores the monitor reads from and writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub status: Arc<dyn StatusStore>,
    pub events: Arc<dyn EventLog>,
}

pub struct Monitor<A>
where
    A: FaceAnalyzer + Clone + 'static,
{
    config: VigilConfig,
    source: Box<dyn FrameSource>,
    analyzer: A,
    collaborators: Collaborators,
    channels: Vec<Arc<dyn AlertChannel>>,
    shared: SharedFrameState,
    cancel: CancellationToken,
}

impl<A> Monitor<A>
where
    A: FaceAnalyzer + Clone + 'static,
{
    pub fn new(
        config: VigilConfig,
        source: Box<dyn FrameSource>,
        analyzer: A,
        collaborators: Collaborators,
        channels: Vec<Arc<dyn AlertChannel>>,
    ) -> Self {
        Self {
            config,
            source,
            analyzer,
            collaborators,
            channels,
            shared: SharedFrameState::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// State shared with live viewers.
    pub fn shared(&self) -> SharedFrameState {
        self.shared.clone()
    }

    /// Process-wide stop signal; cancelling it stops every monitor task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Logs startup, loads enrolled faces, opens the camera and spawns the
    /// acquisition, processing and alert tasks.
    pub async fn start(self, face_store: &dyn KnownFaceStore) -> Result<MonitorHandle> {
        let Monitor {
            config,
            mut source,
            analyzer,
            collaborators,
            channels,
            shared,
            cancel,
        } = self;

        record_event(
            collaborators.events.as_ref(),
            SystemEvent::new(
                EventKind::SystemStartup,
                Some("Security system started.".into()),
            ),
        )
        .await;

        let known = face_store.load_database(&analyzer)?;
        info!(known_faces = known.len(), "Known face database ready");

        source.open().await.map_err(|err| {
            orchestrator_error(format!("cannot open video stream or webcam: {err}"))
        })?;

        let alerts_cancel = CancellationToken::new();
        let (dispatcher, alerts) = AlertDispatcher::spawn(
            channels,
            config.alerts.queue_capacity,
            alerts_cancel.clone(),
        );

        let policy = ReconnectPolicy::from_config(&config.camera);
        let acquisition = tokio::spawn({
            let shared = shared.clone();
            let cancel = cancel.clone();
            async move { run_acquisition(source.as_mut(), shared, policy, cancel).await }
        });

        let processing = ProcessingLoop {
            pipeline: None,
            detection: config.detection.clone(),
            analyzer,
            known,
            machine: IntruderStateMachine::from_config(&config.intruder),
            shared,
            collaborators,
            dispatcher,
            intruder_dir: PathBuf::from(&config.storage.intruder_dir),
            subject_name: config.intruder.subject_name.clone(),
            idle: Duration::from_millis(config.detection.idle_poll_ms.max(1)),
            error_pause: Duration::from_millis(config.detection.error_pause_ms),
            last_seq: None,
        };
        let processing = tokio::spawn(processing.run(cancel.clone()));

        info!("Monitor started");
        Ok(MonitorHandle {
            cancel,
            alerts_cancel,
            acquisition,
            processing,
            alerts,
        })
    }
}

/// Running monitor. Dropping it leaves the tasks running until the cancel
/// token fires.
pub struct MonitorHandle {
    cancel: CancellationToken,
    alerts_cancel: CancellationToken,
    acquisition: JoinHandle<AcquisitionReport>,
    processing: JoinHandle<()>,
    alerts: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals every task to stop and waits for them. Alerts already being
    /// sent get a short grace period.
    pub async fn shutdown(self) -> Result<AcquisitionReport> {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the tasks to finish after the cancel token fires elsewhere.
    pub async fn join(self) -> Result<AcquisitionReport> {
        let report = self
            .acquisition
            .await
            .map_err(|err| orchestrator_error(format!("acquisition task failed: {err}")))?;
        self.processing
            .await
            .map_err(|err| orchestrator_error(format!("processing task failed: {err}")))?;

        let mut alerts = self.alerts;
        if timeout(ALERT_DRAIN_TIMEOUT, &mut alerts).await.is_err() {
            warn!("Alerts still in flight at shutdown, abandoning them");
            self.alerts_cancel.cancel();
            let _ = alerts.await;
        }
        info!("Monitor stopped");
        Ok(report)
    }
}

/// Detection and intruder tracking over the most recently captured frame.
struct ProcessingLoop<A>
where
    A: FaceAnalyzer + Clone + 'static,
{
    /// Taken while a frame is analysed on the blocking pool. Built on
    /// first use and again after a detection worker panics.
    pipeline: Option<DetectionPipeline<A>>,
    detection: DetectionConfig,
    analyzer: A,
    known: KnownFaceDatabase,
    machine: IntruderStateMachine,
    shared: SharedFrameState,
    collaborators: Collaborators,
    dispatcher: AlertDispatcher,
    intruder_dir: PathBuf,
    subject_name: String,
    idle: Duration,
    error_pause: Duration,
    last_seq: Option<u64>,
}

impl<A> ProcessingLoop<A>
where
    A: FaceAnalyzer + Clone + 'static,
{
    async fn run(mut self, cancel: CancellationToken) {
        info!("Processing task started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let pause = match self.cycle().await {
                Ok(true) => continue,
                Ok(false) => self.idle,
                Err(err) => {
                    error!(error = %err, "Frame processing failed");
                    self.error_pause
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }
        info!("Processing task stopped");
    }

    /// Processes the newest frame if it has not been seen yet. Returns
    /// whether a frame was processed.
    async fn cycle(&mut self) -> Result<bool> {
        let Some(frame) = self.shared.latest_frame() else {
            return Ok(false);
        };
        if self.last_seq == Some(frame.seq) {
            return Ok(false);
        }
        self.last_seq = Some(frame.seq);

        let status = current_status(self.collaborators.status.as_ref()).await;

        let mut pipeline = match self.pipeline.take() {
            Some(pipeline) => pipeline,
            None => self.fresh_pipeline(),
        };
        let input = frame.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let detection = pipeline.process(&input);
            (pipeline, detection)
        })
        .await;
        let (pipeline, detection) = match joined {
            Ok(done) => done,
            Err(err) => {
                // The pipeline went down with the worker; the next cycle
                // starts over with a fresh background model.
                warn!(error = %err, "Detection worker died, rebuilding the pipeline");
                return Err(orchestrator_error(format!("detection worker failed: {err}")));
            }
        };
        self.pipeline = Some(pipeline);
        let detection = detection?;

        let outcome = self
            .machine
            .step(detection.has_unknown(), status, Instant::now());
        match outcome.transition {
            Some(Transition::Confirmed) => self.on_confirmed(frame).await,
            Some(Transition::Cleared) => {
                record_event(
                    self.collaborators.events.as_ref(),
                    SystemEvent::new(
                        EventKind::SystemReset,
                        Some("Intruder no longer seen.".into()),
                    ),
                )
                .await;
            }
            Some(Transition::Disarmed) => info!("Alarm cleared by disarm"),
            None => {}
        }

        self.shared
            .publish_overlay(detection, outcome.status_text, outcome.patience_text);
        Ok(true)
    }

    fn fresh_pipeline(&self) -> DetectionPipeline<A> {
        DetectionPipeline::new(
            self.detection.clone(),
            self.analyzer.clone(),
            self.known.clone(),
        )
    }

    async fn on_confirmed(&self, frame: Arc<Frame>) {
        let dir = self.intruder_dir.clone();
        let saved = tokio::task::spawn_blocking(move || {
            save_intruder_snapshot(&frame, &dir, Local::now())
        })
        .await;
        let image_path = match saved {
            Ok(Ok(path)) => {
                info!(path = ?path, "Saved intruder image");
                Some(path)
            }
            Ok(Err(err)) => {
                warn!(error = %err, "Error saving intruder image");
                None
            }
            Err(err) => {
                warn!(error = %err, "Intruder image worker failed");
                None
            }
        };

        self.dispatcher
            .dispatch(&self.subject_name, image_path.clone());
        record_event(
            self.collaborators.events.as_ref(),
            SystemEvent::new(
                EventKind::IntruderDetected,
                Some("Unknown person confirmed.".into()),
            )
            .with_image(image_path),
        )
        .await;
    }
}

pub fn orchestrator_error(message: impl Into<String>) -> VigilError {
    VigilError::Orchestrator(message.into())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use image::RgbImage;
    use vigil_alerts::RecordingChannel;
    use vigil_capture::{AcquisitionExit, SyntheticSource};
    use vigil_ops::{MemoryEventLog, MemoryStatusStore};
    use vigil_types::{
        detection::BoundingBox,
        events::AlertEvent,
        shared::FrameSnapshot,
        status::SystemStatus,
    };
    use vigil_vision::{vision_error, FaceEncoding, ScriptedFaceAnalyzer, StaticFaceStore};

    /// Scripted analyzer that panics, then fails, a set number of times
    /// before behaving.
    #[derive(Default)]
    struct FaultyAnalyzer {
        inner: ScriptedFaceAnalyzer,
        panics: AtomicUsize,
        failures: AtomicUsize,
    }

    impl FaultyAnalyzer {
        fn set_faces(&self, faces: Vec<(BoundingBox, FaceEncoding)>) {
            self.inner.set_faces(faces);
        }

        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        }

        fn faults_left(&self) -> usize {
            self.panics.load(Ordering::SeqCst) + self.failures.load(Ordering::SeqCst)
        }
    }

    impl FaceAnalyzer for FaultyAnalyzer {
        fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>> {
            if Self::take(&self.panics) {
                panic!("face model crashed");
            }
            if Self::take(&self.failures) {
                return Err(vision_error("face model returned garbage"));
            }
            self.inner.locate(image)
        }

        fn encode(&self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<FaceEncoding>> {
            self.inner.encode(image, faces)
        }
    }

    struct Rig {
        config: VigilConfig,
        analyzer: Arc<FaultyAnalyzer>,
        events: MemoryEventLog,
        status: MemoryStatusStore,
        alerts: Arc<std::sync::Mutex<Vec<AlertEvent>>>,
        channel: Option<RecordingChannel>,
        intruder_dir: PathBuf,
    }

    impl Rig {
        fn new(status: SystemStatus) -> Self {
            Self::with_faults(status, 0, 0)
        }

        fn with_faults(status: SystemStatus, panics: usize, failures: usize) -> Self {
            let intruder_dir =
                std::env::temp_dir().join(format!("vigil-monitor-{}", uuid::Uuid::new_v4()));
            let mut config = VigilConfig::default();
            config.detection.min_contour_area = 4;
            config.detection.face_rec_frame_skip = 1;
            config.detection.idle_poll_ms = 2;
            config.detection.error_pause_ms = 20;
            config.intruder.threshold_frames = 3;
            config.intruder.patience_secs = 0.3;
            config.storage.intruder_dir = intruder_dir.to_string_lossy().into_owned();

            let analyzer = Arc::new(FaultyAnalyzer {
                panics: AtomicUsize::new(panics),
                failures: AtomicUsize::new(failures),
                ..FaultyAnalyzer::default()
            });
            analyzer.set_faces(vec![(
                BoundingBox::new(4, 4, 10, 12),
                FaceEncoding::new(vec![9.0, 9.0]),
            )]);
            let channel = RecordingChannel::new("beep", Duration::from_secs(10));

            Self {
                config,
                analyzer,
                events: MemoryEventLog::new(),
                status: MemoryStatusStore::new(status),
                alerts: channel.log(),
                channel: Some(channel),
                intruder_dir,
            }
        }

        async fn start(&mut self) -> (MonitorHandle, SharedFrameState) {
            let source =
                SyntheticSource::new(160, 120).with_frame_interval(Duration::from_millis(5));
            let channel = self.channel.take().expect("rig started once");
            let monitor = Monitor::new(
                self.config.clone(),
                Box::new(source),
                self.analyzer.clone(),
                Collaborators {
                    status: Arc::new(self.status.clone()),
                    events: Arc::new(self.events.clone()),
                },
                vec![Arc::new(channel)],
            );
            let shared = monitor.shared();
            let handle = monitor
                .start(&StaticFaceStore::default())
                .await
                .expect("monitor starts");
            (handle, shared)
        }

        async fn count(&self, kind: EventKind) -> usize {
            self.events
                .snapshot()
                .await
                .iter()
                .filter(|event| event.kind == kind)
                .count()
        }

        async fn wait_for_events(&self, kind: EventKind, expected: usize) -> bool {
            for _ in 0..500 {
                if self.count(kind).await == expected {
                    return true;
                }
                sleep(Duration::from_millis(10)).await;
            }
            false
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.intruder_dir).ok();
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn overlay_shows(shared: &SharedFrameState, check: impl Fn(&FrameSnapshot) -> bool) -> bool {
        shared.snapshot().is_some_and(|snapshot| check(&snapshot))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn confirms_alerts_and_resets_an_intrusion() {
        let mut rig = Rig::new(SystemStatus::Armed);
        let (handle, shared) = rig.start().await;

        assert!(rig.wait_for_events(EventKind::IntruderDetected, 1).await);
        assert_eq!(rig.count(EventKind::SystemStartup).await, 1);
        assert!(wait_until(|| RecordingChannel::count(&rig.alerts) == 1).await);

        let events = rig.events.snapshot().await;
        let detected = events
            .iter()
            .find(|event| event.kind == EventKind::IntruderDetected)
            .expect("intruder event");
        let image = detected.image_path.clone().expect("snapshot saved");
        assert!(image.exists());
        assert!(image.starts_with(&rig.intruder_dir));
        let alert = rig.alerts.lock().expect("alerts")[0].clone();
        assert_eq!(alert.subject_name, "Unknown person");
        assert_eq!(alert.image_path, Some(image));

        assert!(
            wait_until(|| overlay_shows(&shared, |s| s.status_text == "Status: INTRUDER ALERT!"))
                .await
        );

        // The stranger leaves; the alarm clears after the patience interval.
        rig.analyzer.set_faces(Vec::new());
        assert!(rig.wait_for_events(EventKind::SystemReset, 1).await);
        assert_eq!(rig.count(EventKind::IntruderDetected).await, 1);

        let report = handle.shutdown().await.expect("shutdown");
        assert_eq!(report.exit, AcquisitionExit::Stopped);
        assert!(report.metrics.frames_captured > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disarmed_system_only_reports_status() {
        let mut rig = Rig::new(SystemStatus::Disarmed);
        let (handle, shared) = rig.start().await;

        assert!(
            wait_until(|| overlay_shows(&shared, |s| {
                s.status_text == "Status: DISARMED" && s.detection.has_unknown()
            }))
            .await
        );
        sleep(Duration::from_millis(200)).await;
        assert_eq!(rig.count(EventKind::IntruderDetected).await, 0);
        assert_eq!(RecordingChannel::count(&rig.alerts), 0);

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disarm_clears_an_active_alarm() {
        let mut rig = Rig::new(SystemStatus::Armed);
        let (handle, shared) = rig.start().await;
        assert!(rig.wait_for_events(EventKind::IntruderDetected, 1).await);

        rig.status
            .set_status(SystemStatus::Disarmed)
            .await
            .expect("disarm");
        assert!(
            wait_until(|| overlay_shows(&shared, |s| s.status_text == "Status: DISARMED")).await
        );
        // Disarming is not a patience timeout.
        assert_eq!(rig.count(EventKind::SystemReset).await, 0);

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_analyzer_is_replaced_and_monitoring_continues() {
        let mut rig = Rig::with_faults(SystemStatus::Armed, 1, 0);
        let (handle, shared) = rig.start().await;

        assert!(rig.wait_for_events(EventKind::IntruderDetected, 1).await);
        assert_eq!(rig.analyzer.faults_left(), 0);
        assert!(
            wait_until(|| overlay_shows(&shared, |s| s.status_text == "Status: INTRUDER ALERT!"))
                .await
        );

        handle.shutdown().await.expect("processing task survives the panic");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn analyzer_error_skips_one_frame_only() {
        let mut rig = Rig::with_faults(SystemStatus::Armed, 0, 1);
        let (handle, _shared) = rig.start().await;

        assert!(rig.wait_for_events(EventKind::IntruderDetected, 1).await);
        assert_eq!(rig.analyzer.faults_left(), 0);
        assert!(wait_until(|| RecordingChannel::count(&rig.alerts) == 1).await);

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn unopenable_camera_fails_start() {
        let source = SyntheticSource::new(32, 24).failing_opens(1);
        let monitor = Monitor::new(
            VigilConfig::default(),
            Box::new(source),
            Arc::new(ScriptedFaceAnalyzer::new()),
            Collaborators {
                status: Arc::new(MemoryStatusStore::default()),
                events: Arc::new(MemoryEventLog::new()),
            },
            Vec::new(),
        );
        let err = monitor
            .start(&StaticFaceStore::default())
            .await
            .err()
            .expect("start fails");
        assert!(matches!(err, VigilError::Orchestrator(_)));
    }
}
