//! Hand-off point between acquisition, detection and the live-view encoders.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{detection::DetectionResult, frame::Frame};

/// Consistent copy of everything a live viewer needs to render one frame.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub frame: Arc<Frame>,
    pub detection: Arc<DetectionResult>,
    pub status_text: String,
    pub patience_text: String,
}

#[derive(Debug, Default)]
struct Inner {
    frame: Option<Arc<Frame>>,
    detection: Arc<DetectionResult>,
    status_text: String,
    patience_text: String,
}

/// One lock guards every field. Writers replace whole fields and never edit in
/// place, so readers only hold the lock long enough to clone a few `Arc`s and
/// strings.
#[derive(Debug, Clone, Default)]
pub struct SharedFrameState {
    inner: Arc<Mutex<Inner>>,
}

impl SharedFrameState {
    pub fn new() -> Self {
        Self::default()
    }

    // Every write is a whole-field swap, so a panicked writer cannot leave a
    // half-updated field behind.
    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish_frame(&self, frame: Frame) {
        let frame = Arc::new(frame);
        self.guard().frame = Some(frame);
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.guard().frame.clone()
    }

    pub fn publish_overlay(
        &self,
        detection: DetectionResult,
        status_text: String,
        patience_text: String,
    ) {
        let detection = Arc::new(detection);
        let mut guard = self.guard();
        guard.detection = detection;
        guard.status_text = status_text;
        guard.patience_text = patience_text;
    }

    /// Returns `None` until the first frame has been published.
    pub fn snapshot(&self) -> Option<FrameSnapshot> {
        let guard = self.guard();
        let frame = guard.frame.clone()?;
        Some(FrameSnapshot {
            frame,
            detection: guard.detection.clone(),
            status_text: guard.status_text.clone(),
            patience_text: guard.patience_text.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, FaceMatch};

    #[test]
    fn snapshot_requires_a_frame() {
        let shared = SharedFrameState::new();
        shared.publish_overlay(DetectionResult::default(), "Status: ARMED".into(), String::new());
        assert!(shared.snapshot().is_none());

        shared.publish_frame(Frame::filled(1, 2, 2, [0, 0, 0]));
        let snapshot = shared.snapshot().expect("snapshot after frame");
        assert_eq!(snapshot.frame.seq, 1);
        assert_eq!(snapshot.status_text, "Status: ARMED");
    }

    #[test]
    fn newer_frame_replaces_older() {
        let shared = SharedFrameState::new();
        shared.publish_frame(Frame::filled(1, 2, 2, [0, 0, 0]));
        let held = shared.latest_frame().expect("first frame");
        shared.publish_frame(Frame::filled(2, 2, 2, [9, 9, 9]));

        assert_eq!(held.seq, 1);
        assert_eq!(shared.latest_frame().map(|f| f.seq), Some(2));
    }

    #[test]
    fn overlay_is_replaced_as_a_whole() {
        let shared = SharedFrameState::new();
        let mut result = DetectionResult::default();
        result.faces.push(FaceMatch::unknown(BoundingBox::new(0, 0, 4, 4)));
        shared.publish_overlay(result, "Status: INTRUDER ALERT!".into(), "Resetting in: 3.0s".into());
        shared.publish_frame(Frame::filled(1, 2, 2, [0, 0, 0]));

        let snapshot = shared.snapshot().expect("snapshot");
        assert!(snapshot.detection.has_unknown());
        assert_eq!(snapshot.patience_text, "Resetting in: 3.0s");

        shared.publish_overlay(DetectionResult::default(), "Status: ARMED".into(), String::new());
        let snapshot = shared.snapshot().expect("snapshot");
        assert!(snapshot.detection.faces.is_empty());
        assert!(snapshot.patience_text.is_empty());
    }
}
