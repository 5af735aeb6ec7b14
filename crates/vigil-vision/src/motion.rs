//! Background subtraction and foreground region extraction.

use std::collections::VecDeque;

use image::{GrayImage, Luma};
use vigil_types::{
    config::DetectionConfig,
    detection::{BoundingBox, MotionRegion, Point},
};

/// Mask value for confident foreground.
pub const FOREGROUND: u8 = 255;
/// Mask value for pixels explained as a shadow cast on the background.
pub const SHADOW: u8 = 127;

const INITIAL_VARIANCE: f32 = 15.0;
const MIN_VARIANCE: f32 = 4.0;
const MAX_VARIANCE: f32 = 75.0;
/// Lowest brightness ratio against the background still treated as shadow.
const SHADOW_RATIO: f32 = 0.5;

/// Running per-pixel Gaussian model of the scene luminance.
///
/// Each pixel keeps a mean and variance updated with a learning rate of
/// `1 / min(frames_seen, history)`. A pixel whose squared deviation exceeds
/// `variance_threshold` times its variance is foreground, unless shadow
/// detection is enabled and it is a uniformly darkened version of the
/// background.
pub struct BackgroundModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    frames_seen: u32,
    history: u32,
    variance_threshold: f32,
    detect_shadows: bool,
}

impl BackgroundModel {
    pub fn new(history: u32, variance_threshold: f32, detect_shadows: bool) -> Self {
        Self {
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
            frames_seen: 0,
            history: history.max(1),
            variance_threshold,
            detect_shadows,
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(
            config.background_history,
            config.variance_threshold,
            config.detect_shadows,
        )
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    fn reset(&mut self, gray: &GrayImage) {
        self.width = gray.width();
        self.height = gray.height();
        self.mean = gray.as_raw().iter().map(|&v| v as f32).collect();
        self.variance = vec![INITIAL_VARIANCE; self.mean.len()];
        self.frames_seen = 1;
    }

    /// Classifies every pixel of `gray` and folds it into the model.
    /// The first frame (or a frame of a new size) only seeds the model.
    pub fn apply(&mut self, gray: &GrayImage) -> GrayImage {
        let (width, height) = gray.dimensions();
        if self.frames_seen == 0 || width != self.width || height != self.height {
            self.reset(gray);
            return GrayImage::new(width, height);
        }

        self.frames_seen = self.frames_seen.saturating_add(1);
        let alpha = 1.0 / self.frames_seen.min(self.history) as f32;
        let mut mask = GrayImage::new(width, height);

        for (idx, (&value, out)) in gray.as_raw().iter().zip(mask.iter_mut()).enumerate() {
            let value = value as f32;
            let mean = self.mean[idx];
            let variance = self.variance[idx];
            let diff = value - mean;
            let dist2 = diff * diff;

            if dist2 > self.variance_threshold * variance {
                *out = if self.detect_shadows && is_shadow(value, mean) {
                    SHADOW
                } else {
                    FOREGROUND
                };
            }

            self.mean[idx] = mean + alpha * diff;
            self.variance[idx] =
                (variance + alpha * (dist2 - variance)).clamp(MIN_VARIANCE, MAX_VARIANCE);
        }
        mask
    }
}

fn is_shadow(value: f32, mean: f32) -> bool {
    if mean <= f32::EPSILON {
        return false;
    }
    let ratio = value / mean;
    (SHADOW_RATIO..1.0).contains(&ratio)
}

/// Binary threshold: strictly above `level` becomes 255, everything else 0.
pub fn threshold(mask: &GrayImage, level: u8) -> GrayImage {
    let mut out = mask.clone();
    for Luma([v]) in out.pixels_mut() {
        *v = if *v > level { FOREGROUND } else { 0 };
    }
    out
}

/// Clockwise 8-neighbourhood starting west, in image coordinates.
const RING: [(i64, i64); 8] = [
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
];

/// Extracts the 8-connected foreground components of a binary mask and
/// keeps those whose pixel count is strictly greater than `min_area`.
pub fn find_motion_regions(binary: &GrayImage, min_area: u32) -> Vec<MotionRegion> {
    let (width, height) = binary.dimensions();
    let raw = binary.as_raw();
    let mut labels = vec![0u32; raw.len()];
    let mut next_label = 0u32;
    let mut regions = Vec::new();
    let mut queue = VecDeque::new();

    for start_idx in 0..raw.len() {
        if raw[start_idx] == 0 || labels[start_idx] != 0 {
            continue;
        }
        next_label += 1;
        labels[start_idx] = next_label;
        queue.push_back(start_idx);

        let sx = (start_idx % width as usize) as u32;
        let sy = (start_idx / width as usize) as u32;
        let mut bounds = BoundingBox::new(sx, sy, sx, sy);
        let mut area = 0u32;

        while let Some(idx) = queue.pop_front() {
            area += 1;
            let x = (idx % width as usize) as i64;
            let y = (idx / width as usize) as i64;
            bounds.left = bounds.left.min(x as u32);
            bounds.right = bounds.right.max(x as u32);
            bounds.top = bounds.top.min(y as u32);
            bounds.bottom = bounds.bottom.max(y as u32);

            for (dx, dy) in RING {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                    continue;
                }
                let nidx = (ny as usize) * width as usize + nx as usize;
                if raw[nidx] != 0 && labels[nidx] == 0 {
                    labels[nidx] = next_label;
                    queue.push_back(nidx);
                }
            }
        }

        if area > min_area {
            let outline = trace_outline(&labels, width, height, next_label, (sx, sy), area);
            regions.push(MotionRegion {
                area,
                bounds,
                outline,
            });
        }
    }
    regions
}

/// Moore-neighbour boundary trace. `start` must be the component's first
/// pixel in raster order, so its west neighbour is background.
fn trace_outline(
    labels: &[u32],
    width: u32,
    height: u32,
    label: u32,
    start: (u32, u32),
    area: u32,
) -> Vec<Point> {
    let inside = |(x, y): (i64, i64)| {
        x >= 0
            && y >= 0
            && x < width as i64
            && y < height as i64
            && labels[(y as usize) * width as usize + x as usize] == label
    };
    let neighbour = |(x, y): (i64, i64), dir: usize| (x + RING[dir].0, y + RING[dir].1);

    let start = (start.0 as i64, start.1 as i64);
    let mut outline = vec![Point::new(start.0 as u32, start.1 as u32)];
    let mut current = start;
    let mut back = (start.0 - 1, start.1);
    let mut first_step = None;
    let max_steps = area as usize * 4 + 8;

    for _ in 0..max_steps {
        let Some(from) = (0..8).find(|&dir| neighbour(current, dir) == back) else {
            break;
        };
        let step = (1..=8).find_map(|offset| {
            let dir = (from + offset) % 8;
            let candidate = neighbour(current, dir);
            inside(candidate).then(|| (candidate, neighbour(current, (dir + 7) % 8)))
        });
        let Some((next, next_back)) = step else {
            break;
        };

        match first_step {
            None => first_step = Some(next),
            Some(first) if current == start && next == first => break,
            Some(_) => {}
        }
        if next != start {
            outline.push(Point::new(next.0 as u32, next.1 as u32));
        }
        current = next;
        back = next_back;
    }
    outline
}
