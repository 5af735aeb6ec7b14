//! Face localisation, encoding and identity matching.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use vigil_types::{
    detection::{BoundingBox, FaceMatch},
    Result,
};

/// Fixed-length descriptor produced by a face encoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceEncoding(pub Vec<f32>);

impl FaceEncoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Euclidean distance. Encodings of different dimensions never match.
    pub fn distance(&self, other: &FaceEncoding) -> f32 {
        if self.0.len() != other.0.len() {
            return f32::INFINITY;
        }
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// Face detector and encoder backing the recognition step.
///
/// Implementations wrap whatever model is available on the host. Both calls
/// are CPU-bound and are made from a blocking worker.
pub trait FaceAnalyzer: Send + Sync {
    fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>>;

    /// One encoding per location, in the same order.
    fn encode(&self, image: &RgbImage, locations: &[BoundingBox]) -> Result<Vec<FaceEncoding>>;
}

impl<T: FaceAnalyzer + ?Sized> FaceAnalyzer for Arc<T> {
    fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>> {
        (**self).locate(image)
    }

    fn encode(&self, image: &RgbImage, locations: &[BoundingBox]) -> Result<Vec<FaceEncoding>> {
        (**self).encode(image, locations)
    }
}

/// Analyzer for hosts without a face model: motion is still reported but no
/// face is ever found.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFaceAnalyzer;

impl FaceAnalyzer for NullFaceAnalyzer {
    fn locate(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>> {
        Ok(Vec::new())
    }

    fn encode(&self, _image: &RgbImage, locations: &[BoundingBox]) -> Result<Vec<FaceEncoding>> {
        Ok(vec![FaceEncoding::default(); locations.len()])
    }
}

/// Analyzer returning a configurable set of faces, for wiring tests and demos.
#[derive(Debug, Default)]
pub struct ScriptedFaceAnalyzer {
    faces: Mutex<Vec<(BoundingBox, FaceEncoding)>>,
    locate_calls: AtomicUsize,
}

impl ScriptedFaceAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the faces reported from now on.
    pub fn set_faces(&self, faces: Vec<(BoundingBox, FaceEncoding)>) {
        *self.faces.lock().unwrap_or_else(PoisonError::into_inner) = faces;
    }

    pub fn locate_calls(&self) -> usize {
        self.locate_calls.load(Ordering::SeqCst)
    }
}

impl FaceAnalyzer for ScriptedFaceAnalyzer {
    fn locate(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>> {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        let faces = self.faces.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(faces.iter().map(|(bounds, _)| *bounds).collect())
    }

    fn encode(&self, _image: &RgbImage, locations: &[BoundingBox]) -> Result<Vec<FaceEncoding>> {
        let faces = self.faces.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(locations
            .iter()
            .map(|location| {
                faces
                    .iter()
                    .find(|(bounds, _)| bounds == location)
                    .map(|(_, encoding)| encoding.clone())
                    .unwrap_or_default()
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnownFace {
    pub name: String,
    pub encoding: FaceEncoding,
}

impl KnownFace {
    pub fn new(name: impl Into<String>, encoding: FaceEncoding) -> Self {
        Self {
            name: name.into(),
            encoding,
        }
    }
}

/// Enrolled identities. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct KnownFaceDatabase {
    faces: Vec<KnownFace>,
}

impl KnownFaceDatabase {
    pub fn new(faces: Vec<KnownFace>) -> Self {
        Self { faces }
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.faces.iter().map(|face| face.name.as_str())
    }

    /// Name of the closest enrolled face, if its distance is within
    /// `tolerance`. Ties resolve to the earliest enrolled face.
    pub fn best_match(&self, encoding: &FaceEncoding, tolerance: f32) -> Option<&str> {
        let mut best: Option<(&KnownFace, f32)> = None;
        for face in &self.faces {
            let distance = face.encoding.distance(encoding);
            if best.map_or(true, |(_, current)| distance < current) {
                best = Some((face, distance));
            }
        }
        best.filter(|(_, distance)| *distance <= tolerance)
            .map(|(face, _)| face.name.as_str())
    }

    pub fn identify(&self, bounds: BoundingBox, encoding: &FaceEncoding, tolerance: f32) -> FaceMatch {
        match self.best_match(encoding, tolerance) {
            Some(name) => FaceMatch::known(bounds, name),
            None => FaceMatch::unknown(bounds),
        }
    }
}
