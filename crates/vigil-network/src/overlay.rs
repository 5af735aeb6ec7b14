//! Draws the latest detection results onto a full-resolution frame.

use image::{Rgb, RgbImage};
use vigil_types::{
    detection::{BoundingBox, Point},
    shared::FrameSnapshot,
    Result,
};

use crate::{
    font::{self, ADVANCE, GLYPH_HEIGHT, GLYPH_WIDTH},
    network_error,
};

pub const MOTION_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
pub const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const ARMED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const DISARMED_COLOR: Rgb<u8> = Rgb([0, 200, 255]);
pub const INTRUDER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const COUNTDOWN_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

const FACE_BOX_THICKNESS: u32 = 2;
const LABEL_BAR_HEIGHT: u32 = 35;
const LABEL_SCALE: u32 = 2;
const STATUS_SCALE: u32 = 3;
const COUNTDOWN_SCALE: u32 = 2;

/// Copies the snapshot's frame and draws its overlay. Geometry in the
/// snapshot is in detection space and is mapped back with `1 / detection_scale`.
pub fn render_overlay(snapshot: &FrameSnapshot, detection_scale: f32) -> Result<RgbImage> {
    let frame = &snapshot.frame;
    let mut image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| network_error("frame buffer does not match its dimensions"))?;
    let upscale = if detection_scale > 0.0 {
        1.0 / detection_scale
    } else {
        1.0
    };

    for region in &snapshot.detection.motion_regions {
        let outline: Vec<Point> = region
            .outline
            .iter()
            .map(|point| point.scaled(upscale))
            .collect();
        draw_closed_polyline(&mut image, &outline, MOTION_COLOR);
    }

    for face in &snapshot.detection.faces {
        let color = if face.is_unknown {
            UNKNOWN_COLOR
        } else {
            KNOWN_COLOR
        };
        let bounds = face.bounds.scaled(upscale);
        draw_rect(&mut image, bounds, color, FACE_BOX_THICKNESS);
        let bar = BoundingBox::new(
            bounds.left,
            bounds.bottom.saturating_sub(LABEL_BAR_HEIGHT),
            bounds.right,
            bounds.bottom,
        );
        fill_rect(&mut image, bar, color);
        draw_text(
            &mut image,
            &face.name,
            bounds.left as i64 + 6,
            bounds.bottom as i64 - 6,
            LABEL_SCALE,
            LABEL_TEXT_COLOR,
        );
    }

    draw_text(
        &mut image,
        &snapshot.status_text,
        10,
        30,
        STATUS_SCALE,
        status_color(&snapshot.status_text),
    );
    draw_text(
        &mut image,
        &snapshot.patience_text,
        10,
        70,
        COUNTDOWN_SCALE,
        COUNTDOWN_COLOR,
    );
    Ok(image)
}

pub fn status_color(status_text: &str) -> Rgb<u8> {
    if status_text.contains("INTRUDER") {
        INTRUDER_COLOR
    } else if status_text.contains("DISARMED") {
        DISARMED_COLOR
    } else {
        ARMED_COLOR
    }
}

fn put(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && x < image.width() as i64 && y < image.height() as i64 {
        image.put_pixel(x as u32, y as u32, color);
    }
}

pub fn draw_line(image: &mut RgbImage, from: Point, to: Point, color: Rgb<u8>) {
    let (mut x, mut y) = (from.x as i64, from.y as i64);
    let (x1, y1) = (to.x as i64, to.y as i64);
    let dx = (x1 - x).abs();
    let dy = -(y1 - y).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let sy = if y < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put(image, x, y, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

pub fn draw_closed_polyline(image: &mut RgbImage, points: &[Point], color: Rgb<u8>) {
    match points {
        [] => {}
        [only] => put(image, only.x as i64, only.y as i64, color),
        _ => {
            for pair in points.windows(2) {
                draw_line(image, pair[0], pair[1], color);
            }
            if let (Some(first), Some(last)) = (points.first(), points.last()) {
                draw_line(image, *last, *first, color);
            }
        }
    }
}

/// Outline drawn inward from the box edges.
pub fn draw_rect(image: &mut RgbImage, bounds: BoundingBox, color: Rgb<u8>, thickness: u32) {
    for inset in 0..thickness {
        let left = bounds.left + inset;
        let top = bounds.top + inset;
        let right = bounds.right.saturating_sub(inset);
        let bottom = bounds.bottom.saturating_sub(inset);
        if left > right || top > bottom {
            break;
        }
        draw_line(image, Point::new(left, top), Point::new(right, top), color);
        draw_line(image, Point::new(right, top), Point::new(right, bottom), color);
        draw_line(image, Point::new(right, bottom), Point::new(left, bottom), color);
        draw_line(image, Point::new(left, bottom), Point::new(left, top), color);
    }
}

pub fn fill_rect(image: &mut RgbImage, bounds: BoundingBox, color: Rgb<u8>) {
    for y in bounds.top..=bounds.bottom {
        for x in bounds.left..=bounds.right {
            put(image, x as i64, y as i64, color);
        }
    }
}

/// Draws `text` with its baseline at `baseline_y`, each font pixel expanded to
/// a `scale` x `scale` block.
pub fn draw_text(
    image: &mut RgbImage,
    text: &str,
    x: i64,
    baseline_y: i64,
    scale: u32,
    color: Rgb<u8>,
) {
    let scale = scale.max(1) as i64;
    let top = baseline_y - GLYPH_HEIGHT as i64 * scale;
    for (index, ch) in text.chars().enumerate() {
        let origin_x = x + index as i64 * ADVANCE as i64 * scale;
        for (row, bits) in font::glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                let px = origin_x + col as i64 * scale;
                let py = top + row as i64 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        put(image, px + dx, py + dy, color);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use vigil_types::{
        detection::{DetectionResult, FaceMatch, MotionRegion},
        frame::Frame,
    };

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn snapshot(detection: DetectionResult, status: &str, patience: &str) -> FrameSnapshot {
        FrameSnapshot {
            frame: Arc::new(Frame::filled(1, 320, 240, [0, 0, 0])),
            detection: Arc::new(detection),
            status_text: status.to_string(),
            patience_text: patience.to_string(),
        }
    }

    #[test]
    fn status_colour_follows_the_text() {
        assert_eq!(status_color("Status: ARMED"), ARMED_COLOR);
        assert_eq!(status_color("Status: DISARMED"), DISARMED_COLOR);
        assert_eq!(status_color("Status: INTRUDER ALERT!"), INTRUDER_COLOR);
    }

    #[test]
    fn face_boxes_are_upscaled_and_coloured() {
        let mut detection = DetectionResult::default();
        detection
            .faces
            .push(FaceMatch::unknown(BoundingBox::new(10, 10, 30, 40)));
        detection
            .faces
            .push(FaceMatch::known(BoundingBox::new(40, 5, 60, 20), "alice"));

        let image = render_overlay(&snapshot(detection, "", ""), 0.25).expect("render");
        // Unknown face box spans (40,40)-(120,160) at full resolution.
        assert_eq!(*image.get_pixel(40, 60), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(120, 60), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(80, 60), BLACK);
        // Label bar is filled across the bottom of the box.
        assert_eq!(*image.get_pixel(118, 158), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(160, 30), KNOWN_COLOR);
    }

    #[test]
    fn motion_outline_is_drawn() {
        let mut detection = DetectionResult::default();
        detection.motion_regions.push(MotionRegion {
            area: 100,
            bounds: BoundingBox::new(50, 50, 59, 59),
            outline: vec![
                Point::new(50, 50),
                Point::new(59, 50),
                Point::new(59, 59),
                Point::new(50, 59),
            ],
        });
        let image = render_overlay(&snapshot(detection, "", ""), 0.25).expect("render");
        assert_eq!(*image.get_pixel(200, 200), MOTION_COLOR);
        assert_eq!(*image.get_pixel(236, 218), MOTION_COLOR);
        assert_eq!(*image.get_pixel(218, 218), BLACK);
    }

    #[test]
    fn status_and_countdown_text_are_painted() {
        let image = render_overlay(
            &snapshot(DetectionResult::default(), "Status: ARMED", "Resetting in: 6.5s"),
            0.25,
        )
        .expect("render");
        let status_band = (10..200).any(|x| (9..30).any(|y| *image.get_pixel(x, y) == ARMED_COLOR));
        let countdown_band =
            (10..200).any(|x| (56..70).any(|y| *image.get_pixel(x, y) == COUNTDOWN_COLOR));
        assert!(status_band);
        assert!(countdown_band);
    }

    #[test]
    fn drawing_is_clipped_at_the_edges() {
        let mut image = RgbImage::new(8, 8);
        fill_rect(&mut image, BoundingBox::new(4, 4, 40, 40), MOTION_COLOR);
        draw_text(&mut image, "WIDE TEXT", -10, 3, 3, KNOWN_COLOR);
        assert_eq!(*image.get_pixel(7, 7), MOTION_COLOR);
    }

    #[test]
    fn mismatched_frame_is_rejected() {
        let mut broken = snapshot(DetectionResult::default(), "", "");
        broken.frame = Arc::new(Frame {
            seq: 1,
            width: 4,
            height: 4,
            data: vec![0; 3],
            captured_at: chrono::Utc::now(),
        });
        assert!(render_overlay(&broken, 0.25).is_err());
    }
}
