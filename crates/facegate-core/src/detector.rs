//! Face localisation ahead of embedding extraction and liveness scoring.
//!
//! Both consumers require exactly one face: zero candidates and several
//! candidates are reported the same way, as [`Error::NoFaceDetected`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Axis-aligned face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

impl FaceRegion {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Grow the box by `padding * max(width, height)` on every side, clamped to the frame.
    pub fn padded(&self, padding: f32, frame_width: u32, frame_height: u32) -> FaceRegion {
        let pad = (padding.max(0.0) * self.width.max(self.height) as f32) as u32;
        let x0 = self.x.saturating_sub(pad);
        let y0 = self.y.saturating_sub(pad);
        let x1 = (self.x + self.width + pad).min(frame_width);
        let y1 = (self.y + self.height + pad).min(frame_height);
        FaceRegion {
            x: x0,
            y: y0,
            width: x1.saturating_sub(x0).max(1),
            height: y1.saturating_sub(y0).max(1),
            confidence: self.confidence,
        }
    }
}

/// Finds candidate face regions in a frame.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Candidates below this confidence are ignored.
    pub min_confidence: f32,
    /// Candidates narrower or shorter than this (pixels) are ignored.
    pub min_face_size: u32,
    /// Fraction of the larger box side added around the accepted face.
    pub padding: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            min_face_size: 20,
            padding: 0.1,
        }
    }
}

/// Run `detector` and return the single accepted face, padded.
pub fn locate_face(
    detector: &dyn FaceDetector,
    frame: &Frame,
    config: &DetectorConfig,
) -> Result<FaceRegion> {
    let candidates: Vec<FaceRegion> = detector
        .detect(frame)
        .into_iter()
        .filter(|r| {
            r.confidence >= config.min_confidence
                && r.width >= config.min_face_size
                && r.height >= config.min_face_size
        })
        .collect();

    match candidates.as_slice() {
        [face] => {
            tracing::debug!(
                x = face.x,
                y = face.y,
                width = face.width,
                height = face.height,
                confidence = face.confidence,
                "face located"
            );
            Ok(face.padded(config.padding, frame.width(), frame.height()))
        }
        [] => {
            tracing::debug!("no face candidate above threshold");
            Err(Error::NoFaceDetected { found: 0 })
        }
        many => {
            tracing::warn!(found = many.len(), "ambiguous detection: more than one face");
            Err(Error::NoFaceDetected { found: many.len() })
        }
    }
}

/// Treats the whole frame as the face. For callers that hand in pre-cropped faces.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion> {
        vec![FaceRegion {
            x: 0,
            y: 0,
            width: frame.width(),
            height: frame.height(),
            confidence: 1.0,
        }]
    }
}

/// Chroma-based detector: skin pixels in YCbCr space, grouped into
/// 4-connected blobs, each blob scored by how face-like its box is.
#[derive(Debug, Clone)]
pub struct SkinToneDetector {
    /// Longer side of the downsampled analysis copy.
    pub analysis_size: u32,
    /// Blobs smaller than this fraction of the frame are noise.
    pub min_area_fraction: f32,
}

impl Default for SkinToneDetector {
    fn default() -> Self {
        Self {
            analysis_size: 160,
            min_area_fraction: 0.01,
        }
    }
}

fn is_skin([r, g, b]: [u8; 3]) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cr = (r - y) * 0.713 + 128.0;
    let cb = (b - y) * 0.564 + 128.0;
    (133.0..=173.0).contains(&cr) && (77.0..=127.0).contains(&cb)
}

struct Blob {
    pixels: usize,
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
}

fn label_blobs(mask: &[bool], width: usize, height: usize) -> Vec<Blob> {
    let mut visited = vec![false; mask.len()];
    let mut blobs = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        let mut blob = Blob {
            pixels: 0,
            min_x: usize::MAX,
            min_y: usize::MAX,
            max_x: 0,
            max_y: 0,
        };

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % width, idx / width);
            blob.pixels += 1;
            blob.min_x = blob.min_x.min(x);
            blob.min_y = blob.min_y.min(y);
            blob.max_x = blob.max_x.max(x);
            blob.max_y = blob.max_y.max(y);

            let mut visit = |n: usize| {
                if mask[n] && !visited[n] {
                    visited[n] = true;
                    stack.push(n);
                }
            };
            if x > 0 {
                visit(idx - 1);
            }
            if x + 1 < width {
                visit(idx + 1);
            }
            if y > 0 {
                visit(idx - width);
            }
            if y + 1 < height {
                visit(idx + width);
            }
        }
        blobs.push(blob);
    }
    blobs
}

impl FaceDetector for SkinToneDetector {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion> {
        let small = frame.clone().limit_size(self.analysis_size);
        let (width, height) = (small.width() as usize, small.height() as usize);
        let scale_x = frame.width() as f32 / width as f32;
        let scale_y = frame.height() as f32 / height as f32;

        let mask: Vec<bool> = small.rgb().pixels().map(|px| is_skin(px.0)).collect();
        let min_pixels =
            ((self.min_area_fraction * (width * height) as f32).ceil() as usize).max(1);

        let mut regions: Vec<FaceRegion> = label_blobs(&mask, width, height)
            .into_iter()
            .filter(|blob| blob.pixels >= min_pixels)
            .map(|blob| {
                let box_w = blob.max_x - blob.min_x + 1;
                let box_h = blob.max_y - blob.min_y + 1;
                let fill = blob.pixels as f32 / (box_w * box_h) as f32;
                let aspect = box_h as f32 / box_w as f32;
                let aspect_factor = if (0.8..=2.0).contains(&aspect) { 1.0 } else { 0.5 };

                let x = (blob.min_x as f32 * scale_x) as u32;
                let y = (blob.min_y as f32 * scale_y) as u32;
                FaceRegion {
                    x,
                    y,
                    width: ((box_w as f32 * scale_x).ceil() as u32).min(frame.width() - x),
                    height: ((box_h as f32 * scale_y).ceil() as u32).min(frame.height() - y),
                    confidence: (fill * aspect_factor).clamp(0.0, 1.0),
                }
            })
            .collect();

        regions.sort_by(|a, b| b.area().cmp(&a.area()));
        tracing::debug!(candidates = regions.len(), "skin-tone detection");
        regions
    }
}
