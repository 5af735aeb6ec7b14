use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};
use vigil_types::Result;

use crate::{
    faces::{FaceAnalyzer, KnownFace, KnownFaceDatabase},
    vision_error,
};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Source of enrolled identities.
pub trait KnownFaceStore: Send + Sync {
    fn load_all(&self, analyzer: &dyn FaceAnalyzer) -> Result<Vec<KnownFace>>;

    fn load_database(&self, analyzer: &dyn FaceAnalyzer) -> Result<KnownFaceDatabase> {
        Ok(KnownFaceDatabase::new(self.load_all(analyzer)?))
    }
}

/// One reference photo per identity; the file stem is the name.
#[derive(Debug, Clone)]
pub struct DirectoryFaceStore {
    dir: PathBuf,
}

impl DirectoryFaceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn image_paths(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            vision_error(format!("cannot read known faces dir {:?}: {err}", self.dir))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn load_one(&self, path: &Path, analyzer: &dyn FaceAnalyzer) -> Result<Option<KnownFace>> {
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            return Ok(None);
        };
        let image = image::open(path)
            .map_err(|err| vision_error(format!("cannot decode {:?}: {err}", path)))?
            .to_rgb8();
        let locations = analyzer.locate(&image)?;
        let Some(first) = locations.first() else {
            return Ok(None);
        };
        let encoding = analyzer
            .encode(&image, std::slice::from_ref(first))?
            .into_iter()
            .next();
        Ok(encoding.map(|encoding| KnownFace::new(name, encoding)))
    }
}

impl KnownFaceStore for DirectoryFaceStore {
    fn load_all(&self, analyzer: &dyn FaceAnalyzer) -> Result<Vec<KnownFace>> {
        if !self.dir.is_dir() {
            warn!(dir = ?self.dir, "Known faces directory missing, every face will be unknown");
            return Ok(Vec::new());
        }

        let mut faces = Vec::new();
        for path in self.image_paths()? {
            match self.load_one(&path, analyzer) {
                Ok(Some(face)) => {
                    debug!(name = %face.name, "Loaded known face");
                    faces.push(face);
                }
                Ok(None) => warn!(path = ?path, "No face found in reference image, skipping"),
                Err(err) => warn!(path = ?path, error = %err, "Could not load reference image"),
            }
        }
        info!(count = faces.len(), "Known faces loaded");
        Ok(faces)
    }
}

/// Fixed set of identities held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticFaceStore {
    faces: Vec<KnownFace>,
}

impl StaticFaceStore {
    pub fn new(faces: Vec<KnownFace>) -> Self {
        Self { faces }
    }
}

impl KnownFaceStore for StaticFaceStore {
    fn load_all(&self, _analyzer: &dyn FaceAnalyzer) -> Result<Vec<KnownFace>> {
        Ok(self.faces.clone())
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
