//! Per-frame detection: motion, face recognition and intruder snapshots.

pub mod faces;
mod model;
pub mod motion;
mod snapshot;
mod store;

use image::{
    imageops::{self, FilterType},
    RgbImage,
};
use tracing::{debug, trace};
use vigil_types::{
    config::DetectionConfig,
    detection::{DetectionResult, FaceMatch},
    frame::Frame,
    Result, VigilError,
};

pub use faces::{
    FaceAnalyzer, FaceEncoding, KnownFace, KnownFaceDatabase, NullFaceAnalyzer,
    ScriptedFaceAnalyzer,
};
pub use model::{build_face_analyzer, ModelFaceAnalyzer};
pub use motion::BackgroundModel;
pub use snapshot::{save_intruder_snapshot, snapshot_file_name};
pub use store::{DirectoryFaceStore, KnownFaceStore, StaticFaceStore};

/// Motion-gated recognition over successive frames.
///
/// Frames are shrunk by the configured scale before any analysis, and every
/// coordinate in the returned [`DetectionResult`] stays in that reduced
/// space. Faces are only searched for on frames with motion, and only on
/// every `face_rec_frame_skip`-th frame; in between the previous faces are
/// carried forward while motion persists.
pub struct DetectionPipeline<A> {
    config: DetectionConfig,
    analyzer: A,
    known: KnownFaceDatabase,
    background: BackgroundModel,
    frame_count: u64,
    last_faces: Vec<FaceMatch>,
}

impl<A: FaceAnalyzer> DetectionPipeline<A> {
    pub fn new(config: DetectionConfig, analyzer: A, known: KnownFaceDatabase) -> Self {
        let background = BackgroundModel::from_config(&config);
        Self {
            config,
            analyzer,
            known,
            background,
            frame_count: 0,
            last_faces: Vec::new(),
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn process(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let small = downscale(frame, self.config.scale)?;
        self.frame_count += 1;

        let gray = imageops::grayscale(&small);
        let mask = self.background.apply(&gray);
        let binary = motion::threshold(&mask, self.config.foreground_threshold);
        let motion_regions = motion::find_motion_regions(&binary, self.config.min_contour_area);

        let faces = if motion_regions.is_empty() {
            Vec::new()
        } else if self.frame_count % u64::from(self.config.face_rec_frame_skip.max(1)) == 0 {
            self.recognize(&small)?
        } else {
            self.last_faces.clone()
        };
        self.last_faces = faces.clone();

        trace!(
            frame = self.frame_count,
            regions = motion_regions.len(),
            faces = faces.len(),
            "Frame analysed"
        );
        Ok(DetectionResult {
            motion_regions,
            faces,
        })
    }

    fn recognize(&self, image: &RgbImage) -> Result<Vec<FaceMatch>> {
        let locations = self.analyzer.locate(image)?;
        if locations.is_empty() {
            return Ok(Vec::new());
        }
        let encodings = self.analyzer.encode(image, &locations)?;
        let tolerance = self.config.match_tolerance;
        let faces: Vec<FaceMatch> = locations
            .into_iter()
            .zip(encodings.iter())
            .map(|(bounds, encoding)| self.known.identify(bounds, encoding, tolerance))
            .collect();
        debug!(
            faces = faces.len(),
            unknown = faces.iter().filter(|face| face.is_unknown).count(),
            "Recognition pass"
        );
        Ok(faces)
    }
}

/// Resizes `frame` by `scale` on both axes, never below one pixel.
pub fn downscale(frame: &Frame, scale: f32) -> Result<RgbImage> {
    let Some(image) = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()) else {
        return Err(vision_error("frame buffer does not match its dimensions"));
    };
    if (scale - 1.0).abs() < f32::EPSILON {
        return Ok(image);
    }
    let width = ((frame.width as f32 * scale).round() as u32).max(1);
    let height = ((frame.height as f32 * scale).round() as u32).max(1);
    Ok(imageops::resize(&image, width, height, FilterType::Triangle))
}

/// Generate an error aligned with vision semantics.
pub fn vision_error(message: impl Into<String>) -> VigilError {
    VigilError::Vision(message.into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use vigil_types::detection::BoundingBox;

    const W: u32 = 160;
    const H: u32 = 120;

    fn config() -> DetectionConfig {
        DetectionConfig {
            min_contour_area: 20,
            ..DetectionConfig::default()
        }
    }

    fn background(seq: u64) -> Frame {
        Frame::filled(seq, W, H, [30, 30, 30])
    }

    /// Background with a bright block that moves with `seq`.
    fn with_intruder(seq: u64) -> Frame {
        let mut frame = background(seq);
        let x0 = 20 + (seq as u32 % 8) * 8;
        for y in 40..88 {
            for x in x0..x0 + 48 {
                let idx = ((y * W + x) * 3) as usize;
                frame.data[idx..idx + 3].copy_from_slice(&[250, 250, 250]);
            }
        }
        frame
    }

    fn pipeline(
        analyzer: Arc<ScriptedFaceAnalyzer>,
        known: Vec<KnownFace>,
    ) -> DetectionPipeline<Arc<ScriptedFaceAnalyzer>> {
        DetectionPipeline::new(config(), analyzer, KnownFaceDatabase::new(known))
    }

    fn stranger() -> (BoundingBox, FaceEncoding) {
        (BoundingBox::new(8, 10, 16, 20), FaceEncoding::new(vec![5.0, 5.0]))
    }

    #[test]
    fn downscale_quarters_each_axis() {
        let small = downscale(&background(1), 0.25).expect("downscale");
        assert_eq!(small.dimensions(), (40, 30));
    }

    #[test]
    fn still_scene_reports_nothing_and_skips_recognition() {
        let analyzer = Arc::new(ScriptedFaceAnalyzer::new());
        analyzer.set_faces(vec![stranger()]);
        let mut pipeline = pipeline(analyzer.clone(), Vec::new());

        for seq in 1..=10 {
            let result = pipeline.process(&background(seq)).expect("process");
            assert!(!result.motion_detected());
            assert!(result.faces.is_empty());
        }
        assert_eq!(analyzer.locate_calls(), 0);
        assert_eq!(pipeline.frame_count(), 10);
    }

    #[test]
    fn recognition_runs_on_every_fifth_frame_with_motion() {
        let analyzer = Arc::new(ScriptedFaceAnalyzer::new());
        analyzer.set_faces(vec![stranger()]);
        let mut pipeline = pipeline(analyzer.clone(), Vec::new());

        for seq in 1..=3 {
            pipeline.process(&background(seq)).expect("warm up");
        }
        // Frame 4 has motion but is not a recognition frame.
        let result = pipeline.process(&with_intruder(4)).expect("process");
        assert!(result.motion_detected());
        assert!(result.faces.is_empty());
        assert_eq!(analyzer.locate_calls(), 0);

        let recognised = pipeline.process(&with_intruder(5)).expect("process");
        assert_eq!(analyzer.locate_calls(), 1);
        assert_eq!(recognised.faces.len(), 1);
        assert!(recognised.has_unknown());

        // Frames 6..=9 reuse the stale faces while motion continues, even
        // though the analyzer would now find someone else.
        analyzer.set_faces(vec![(
            BoundingBox::new(30, 2, 38, 12),
            FaceEncoding::new(vec![-1.0, 7.0]),
        )]);
        for seq in 6..=9 {
            let result = pipeline.process(&with_intruder(seq)).expect("process");
            assert!(result.motion_detected());
            assert_eq!(result.faces, recognised.faces, "frame {seq} should carry forward");
        }
        assert_eq!(analyzer.locate_calls(), 1);

        analyzer.set_faces(Vec::new());
        let result = pipeline.process(&with_intruder(10)).expect("process");
        assert_eq!(analyzer.locate_calls(), 2);
        assert!(result.faces.is_empty());
    }

    #[test]
    fn motion_loss_clears_carried_faces() {
        let analyzer = Arc::new(ScriptedFaceAnalyzer::new());
        analyzer.set_faces(vec![stranger()]);
        let mut pipeline = pipeline(analyzer.clone(), Vec::new());

        for seq in 1..=4 {
            pipeline.process(&background(seq)).expect("warm up");
        }
        assert!(pipeline.process(&with_intruder(5)).expect("process").has_unknown());

        // The vacated area keeps reading as motion until the model settles.
        let settled = (6..80)
            .map(|seq| pipeline.process(&background(seq)).expect("process"))
            .find(|result| !result.motion_detected())
            .expect("background settles");
        assert!(settled.faces.is_empty());
    }

    #[test]
    fn enrolled_face_is_named() {
        let analyzer = Arc::new(ScriptedFaceAnalyzer::new());
        let (bounds, encoding) = stranger();
        analyzer.set_faces(vec![(bounds, encoding.clone())]);
        let mut pipeline = pipeline(analyzer, vec![KnownFace::new("alice", encoding)]);

        for seq in 1..=4 {
            pipeline.process(&background(seq)).expect("warm up");
        }
        let result = pipeline.process(&with_intruder(5)).expect("process");
        assert_eq!(result.faces.len(), 1);
        assert_eq!(result.faces[0].name, "alice");
        assert!(!result.has_unknown());
    }

    #[test]
    fn mismatched_buffer_is_an_error() {
        let frame = Frame {
            seq: 1,
            width: 4,
            height: 4,
            data: vec![0; 5],
            captured_at: chrono::Utc::now(),
        };
        assert!(downscale(&frame, 0.25).is_err());
    }
}
