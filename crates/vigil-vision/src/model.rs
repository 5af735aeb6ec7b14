//! Face analyzer backed by on-disk models: the SeetaFace frontal cascade
//! (`rustface`) finds faces and an ONNX embedding network (`tract`) encodes
//! them.

use std::{fs, path::Path, sync::Arc};

use image::{
    imageops::{self, FilterType},
    RgbImage,
};
use rustface::{Detector, ImageData};
use tract_onnx::prelude::*;
use tracing::{debug, info, warn};
use vigil_types::{
    config::{FaceBackend, FacesConfig},
    detection::BoundingBox,
    Result, VigilError,
};

use crate::{
    faces::{FaceAnalyzer, FaceEncoding, NullFaceAnalyzer},
    vision_error,
};

type EmbeddingPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Builds the analyzer selected by `[faces] backend`.
///
/// Missing or unreadable model files are a startup error; running without
/// recognition has to be asked for with `backend = "none"`.
pub fn build_face_analyzer(config: &FacesConfig) -> Result<Arc<dyn FaceAnalyzer>> {
    match config.backend {
        FaceBackend::Model => {
            let analyzer = ModelFaceAnalyzer::load(config)?;
            info!(
                detector = %config.detector_model,
                embedding = %config.embedding_model,
                "Face models loaded"
            );
            Ok(Arc::new(analyzer))
        }
        FaceBackend::None => {
            warn!("Face recognition disabled; motion is reported but no face will be located");
            Ok(Arc::new(NullFaceAnalyzer))
        }
    }
}

pub struct ModelFaceAnalyzer {
    detector: CascadeDetector,
    encoder: EmbeddingEncoder,
}

impl ModelFaceAnalyzer {
    pub fn load(config: &FacesConfig) -> Result<Self> {
        Ok(Self {
            detector: CascadeDetector::load(Path::new(&config.detector_model), config)?,
            encoder: EmbeddingEncoder::load(Path::new(&config.embedding_model), config)?,
        })
    }
}

impl FaceAnalyzer for ModelFaceAnalyzer {
    fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>> {
        self.detector.detect(image)
    }

    fn encode(&self, image: &RgbImage, locations: &[BoundingBox]) -> Result<Vec<FaceEncoding>> {
        locations
            .iter()
            .map(|bounds| self.encoder.encode(image, *bounds))
            .collect()
    }
}

/// The rustface detector keeps scratch state and takes `&mut self`, so only
/// the weights are kept and a detector is instantiated per call.
struct CascadeDetector {
    weights: Vec<u8>,
    min_face_size: u32,
    score_threshold: f64,
    pyramid_scale: f32,
    window_step: u32,
}

impl CascadeDetector {
    fn load(path: &Path, config: &FacesConfig) -> Result<Self> {
        let weights = read_model_file(path, "face detector")?;
        let detector = Self {
            weights,
            min_face_size: config.min_face_size,
            score_threshold: config.score_threshold,
            pyramid_scale: config.pyramid_scale,
            window_step: config.window_step,
        };
        // Fail at startup rather than on the first recognition frame.
        detector.instantiate()?;
        Ok(detector)
    }

    fn instantiate(&self) -> Result<Box<dyn Detector>> {
        let model = rustface::read_model(self.weights.as_slice())
            .map_err(|err| vision_error(format!("invalid face detector model: {err}")))?;
        let mut detector = rustface::create_detector_with_model(model);
        detector.set_min_face_size(self.min_face_size);
        detector.set_score_thresh(self.score_threshold);
        detector.set_pyramid_scale_factor(self.pyramid_scale);
        detector.set_slide_window_step(self.window_step, self.window_step);
        Ok(detector)
    }

    /// Highest-scoring face first.
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>> {
        let gray = imageops::grayscale(image);
        let (width, height) = gray.dimensions();
        let mut detector = self.instantiate()?;
        let mut faces = detector.detect(&ImageData::new(gray.as_raw(), width, height));
        faces.sort_by(|a, b| b.score().total_cmp(&a.score()));
        debug!(faces = faces.len(), "Cascade pass");

        Ok(faces
            .iter()
            .filter_map(|face| {
                let rect = face.bbox();
                clamp_to_image(rect.x(), rect.y(), rect.width(), rect.height(), width, height)
            })
            .collect())
    }
}

struct EmbeddingEncoder {
    plan: EmbeddingPlan,
    input_size: u32,
    pixel_mean: f32,
    pixel_std: f32,
    bgr: bool,
}

impl EmbeddingEncoder {
    fn load(path: &Path, config: &FacesConfig) -> Result<Self> {
        ensure_model_file(path, "face embedding")?;
        let side = config.input_size as usize;
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| model.with_input_fact(0, f32::fact([1, 3, side, side]).into()))
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|err| {
                vision_error(format!(
                    "cannot load face embedding model {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            plan,
            input_size: config.input_size,
            pixel_mean: config.pixel_mean,
            pixel_std: config.pixel_std,
            bgr: config.bgr,
        })
    }

    fn encode(&self, image: &RgbImage, bounds: BoundingBox) -> Result<FaceEncoding> {
        let input: Tensor = face_tensor(
            image,
            bounds,
            self.input_size,
            self.pixel_mean,
            self.pixel_std,
            self.bgr,
        )
        .into();
        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .map_err(|err| vision_error(format!("face embedding failed: {err}")))?;
        let output = outputs
            .first()
            .ok_or_else(|| vision_error("face embedding model produced no output"))?;
        let values = output
            .to_array_view::<f32>()
            .map_err(|err| vision_error(format!("unexpected face embedding output: {err}")))?
            .iter()
            .copied()
            .collect();
        Ok(FaceEncoding::new(l2_normalized(values)))
    }
}

fn ensure_model_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    Err(missing_model(path, what))
}

fn read_model_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    ensure_model_file(path, what)?;
    fs::read(path).map_err(|err| {
        vision_error(format!("cannot read {what} model {}: {err}", path.display()))
    })
}

fn missing_model(path: &Path, what: &str) -> VigilError {
    vision_error(format!(
        "{what} model not found at {}; install it or set faces.backend = \"none\" to run without recognition",
        path.display()
    ))
}

/// Converts a detector rectangle, which may hang over the frame edge, into
/// an inclusive box inside a `image_width` x `image_height` image.
fn clamp_to_image(
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    image_width: u32,
    image_height: u32,
) -> Option<BoundingBox> {
    if width == 0 || height == 0 || image_width == 0 || image_height == 0 {
        return None;
    }
    let left = i64::from(x).max(0);
    let top = i64::from(y).max(0);
    let right = (i64::from(x) + i64::from(width) - 1).min(i64::from(image_width) - 1);
    let bottom = (i64::from(y) + i64::from(height) - 1).min(i64::from(image_height) - 1);
    if left > right || top > bottom {
        return None;
    }
    Some(BoundingBox::new(
        left as u32,
        top as u32,
        right as u32,
        bottom as u32,
    ))
}

fn crop_face(image: &RgbImage, bounds: BoundingBox) -> RgbImage {
    let (image_width, image_height) = image.dimensions();
    let left = bounds.left.min(image_width.saturating_sub(1));
    let top = bounds.top.min(image_height.saturating_sub(1));
    let width = bounds.width().min(image_width - left).max(1);
    let height = bounds.height().min(image_height - top).max(1);
    imageops::crop_imm(image, left, top, width, height).to_image()
}

/// `1 x 3 x side x side` planes of `(value - mean) / std`.
fn face_tensor(
    image: &RgbImage,
    bounds: BoundingBox,
    side: u32,
    mean: f32,
    std: f32,
    bgr: bool,
) -> tract_ndarray::Array4<f32> {
    let face = imageops::resize(&crop_face(image, bounds), side, side, FilterType::Triangle);
    let side = side as usize;
    tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, plane, y, x)| {
        let channel = if bgr { 2 - plane } else { plane };
        let value = face.get_pixel(x as u32, y as u32)[channel];
        (f32::from(value) - mean) / std
    })
}

/// Unit-length copy of `values`; an all-zero vector is returned unchanged.
fn l2_normalized(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}
