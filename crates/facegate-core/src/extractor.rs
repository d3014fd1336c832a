//! Face embedding extraction.
//!
//! The matching side only sees [`EmbeddingExtractor`]; a learned model can
//! replace [`GradientHistogramExtractor`] without touching the index.

use std::f64::consts::PI;
use std::sync::Arc;

use crate::detector::{locate_face, DetectorConfig, FaceDetector};
use crate::embedding::Embedding;
use crate::error::Result;
use crate::frame::Frame;

/// Side of the square the face crop is resampled to before description.
const CANONICAL_SIZE: u32 = 64;
/// Cells per side of the histogram grid.
const GRID: usize = 4;
/// Unsigned orientation bins over [0, pi).
const ORIENTATION_BINS: usize = 8;

pub const GRADIENT_HISTOGRAM_DIM: usize = GRID * GRID * ORIENTATION_BINS;

/// Converts a frame into a fixed-length embedding.
pub trait EmbeddingExtractor: Send + Sync {
    /// Length of every embedding this extractor produces.
    fn dimension(&self) -> usize;

    /// Detect the single face in `frame` and embed it. Fails with
    /// `NoFaceDetected` when there is no face or more than one.
    fn extract(&self, frame: &Frame) -> Result<Embedding>;
}

/// Histogram-of-oriented-gradients descriptor over a canonical face crop.
pub struct GradientHistogramExtractor {
    detector: Arc<dyn FaceDetector>,
    config: DetectorConfig,
}

impl GradientHistogramExtractor {
    pub fn new(detector: Arc<dyn FaceDetector>, config: DetectorConfig) -> Self {
        Self { detector, config }
    }
}

impl EmbeddingExtractor for GradientHistogramExtractor {
    fn dimension(&self) -> usize {
        GRADIENT_HISTOGRAM_DIM
    }

    fn extract(&self, frame: &Frame) -> Result<Embedding> {
        let region = locate_face(self.detector.as_ref(), frame, &self.config)?;
        let face = frame.crop(&region);
        Ok(Embedding::new(gradient_histogram(&face)))
    }
}

/// L2-normalised gradient orientation histogram of `face`.
pub fn gradient_histogram(face: &Frame) -> Vec<f32> {
    let luma = face.resized(CANONICAL_SIZE, CANONICAL_SIZE).luma();
    let n = CANONICAL_SIZE as usize;
    let cell = n / GRID;
    let mut hist = vec![0.0f64; GRADIENT_HISTOGRAM_DIM];

    for y in 1..n - 1 {
        for x in 1..n - 1 {
            let gx = luma[[y, x + 1]] - luma[[y, x - 1]];
            let gy = luma[[y + 1, x]] - luma[[y - 1, x]];
            let magnitude = gx.hypot(gy);
            if magnitude == 0.0 {
                continue;
            }
            let mut angle = gy.atan2(gx);
            if angle < 0.0 {
                angle += PI;
            }
            let bin = ((angle / PI * ORIENTATION_BINS as f64) as usize).min(ORIENTATION_BINS - 1);
            let cell_index = (y / cell) * GRID + x / cell;
            hist[cell_index * ORIENTATION_BINS + bin] += magnitude;
        }
    }

    let norm = hist.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return vec![0.0; GRADIENT_HISTOGRAM_DIM];
    }
    hist.into_iter().map(|v| (v / norm) as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{FullFrameDetector, SkinToneDetector};
    use crate::embedding::Metric;
    use crate::error::Error;
    use image::{Rgb, RgbImage};

    /// Mid-gray canvas with dark rectangles standing in for facial features.
    fn pattern(features: &[(u32, u32, u32, u32)], gain: f32, offset: f32) -> Frame {
        let shade = |v: f32| (v * gain + offset).clamp(0.0, 255.0) as u8;
        let mut img = RgbImage::from_pixel(96, 96, Rgb([shade(150.0); 3]));
        for &(fx, fy, fw, fh) in features {
            for y in fy..fy + fh {
                for x in fx..fx + fw {
                    img.put_pixel(x, y, Rgb([shade(60.0); 3]));
                }
            }
        }
        Frame::from_rgb(img).unwrap()
    }

    const ALICE: &[(u32, u32, u32, u32)] = &[(20, 25, 16, 8), (60, 25, 16, 8), (36, 65, 24, 6)];
    const BOB: &[(u32, u32, u32, u32)] = &[(10, 40, 30, 20), (70, 10, 10, 40), (30, 80, 50, 4)];

    fn extractor() -> GradientHistogramExtractor {
        GradientHistogramExtractor::new(Arc::new(FullFrameDetector), DetectorConfig::default())
    }

    #[test]
    fn test_dimension_and_unit_norm() {
        let embedding = extractor().extract(&pattern(ALICE, 1.0, 0.0)).unwrap();
        assert_eq!(embedding.dimension(), GRADIENT_HISTOGRAM_DIM);
        let norm: f32 = embedding.values().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_lighting_change_closer_than_other_identity() {
        let ex = extractor();
        let alice = ex.extract(&pattern(ALICE, 1.0, 0.0)).unwrap();
        let alice_dim = ex.extract(&pattern(ALICE, 0.7, 20.0)).unwrap();
        let bob = ex.extract(&pattern(BOB, 1.0, 0.0)).unwrap();

        for metric in [Metric::L2, Metric::Cosine] {
            let same = metric.distance(alice.values(), alice_dim.values());
            let other = metric.distance(alice.values(), bob.values());
            assert!(same < other, "{metric:?}: same={same} other={other}");
        }
    }

    #[test]
    fn test_flat_face_yields_zero_vector() {
        let embedding = extractor().extract(&pattern(&[], 1.0, 0.0)).unwrap();
        assert!(embedding.values().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_no_face_propagates() {
        let ex = GradientHistogramExtractor::new(
            Arc::new(SkinToneDetector::default()),
            DetectorConfig::default(),
        );
        let blank = Frame::from_rgb(RgbImage::from_pixel(64, 64, Rgb([40, 60, 160])));
        let err = ex.extract(&blank.unwrap()).unwrap_err();
        assert!(matches!(err, Error::NoFaceDetected { .. }));
    }
}
