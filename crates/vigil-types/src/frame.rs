use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, VigilError};

/// Bytes per pixel of the packed RGB layout every source produces.
pub const RGB_CHANNELS: usize = 3;

/// A captured camera frame. Never mutated after capture; newer frames replace
/// older ones wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Capture ordinal assigned by the frame source, strictly increasing.
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    /// Packed RGB8 pixel buffer, row-major.
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn from_rgb(seq: u64, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = Self::buffer_len(width, height);
        if data.len() != expected {
            return Err(VigilError::Capture(format!(
                "frame buffer holds {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            seq,
            width,
            height,
            data,
            captured_at: Utc::now(),
        })
    }

    /// A uniformly coloured frame, mostly useful for synthetic sources.
    pub fn filled(seq: u64, width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * RGB_CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            seq,
            width,
            height,
            data,
            captured_at: Utc::now(),
        }
    }

    pub fn buffer_len(width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * RGB_CHANNELS
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y as usize) * (self.width as usize) + x as usize) * RGB_CHANNELS;
        self.data
            .get(idx..idx + RGB_CHANNELS)
            .map(|px| [px[0], px[1], px[2]])
    }
}
