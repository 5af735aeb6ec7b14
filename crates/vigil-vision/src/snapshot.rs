use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use image::RgbImage;
use vigil_types::{frame::Frame, Result};

use crate::vision_error;

/// Writes `frame` as a JPEG named after the local capture time and returns
/// the path. The directory is created on demand.
pub fn save_intruder_snapshot(frame: &Frame, dir: &Path, at: DateTime<Local>) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .map_err(|err| vision_error(format!("cannot create snapshot dir {:?}: {err}", dir)))?;
    let path = dir.join(snapshot_file_name(at));
    let Some(buffer) = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()) else {
        return Err(vision_error("frame buffer does not match its dimensions"));
    };
    buffer
        .save(&path)
        .map_err(|err| vision_error(format!("cannot save snapshot {:?}: {err}", path)))?;
    Ok(path)
}

pub fn snapshot_file_name(at: DateTime<Local>) -> String {
    format!("intruder_{}.jpg", at.format("%Y-%m-%d_%H-%M-%S"))
}
