//! Passive single-frame liveness scoring.
//!
//! A printed photograph or a face replayed on a screen loses information that
//! a camera pointed at a live person captures: fine skin texture, natural
//! variation in skin tone, high-frequency detail, and focus. This module
//! measures each of those as an independent sub-score in [0, 1] and fuses
//! them with fixed weights into one `overall` score.
//!
//! Rough reading of `overall`: 0.7–1.0 very likely live, 0.5–0.7 probably
//! live, 0.3–0.5 uncertain, 0.0–0.3 likely spoof.
//!
//! # Threat Coverage
//!
//! - **Blocks:** flat prints, low-resolution screen replays, blurred
//!   photo-of-photo recaptures.
//! - **Does not block:** high-quality prints under good light, 3D masks, or
//!   anything that needs motion (blink or head-turn challenges).

use std::sync::Arc;

use image::RgbImage;
use ndarray::Array2;
use serde::Serialize;

use crate::detector::{locate_face, DetectorConfig, FaceDetector};
use crate::error::Result;
use crate::frame::Frame;

pub const TEXTURE_WEIGHT: f32 = 0.30;
pub const COLOR_WEIGHT: f32 = 0.25;
pub const FREQUENCY_WEIGHT: f32 = 0.25;
pub const SHARPNESS_WEIGHT: f32 = 0.20;

/// Default cutoff applied to `overall` by [`LivenessResult::is_live`].
pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.5;

/// Laplacian variance at which the face-region texture score saturates.
/// Live faces typically land in 100–10000, prints in 10–100.
const TEXTURE_SATURATION: f64 = 5000.0;
/// Laplacian variance at which the whole-frame sharpness score saturates.
const SHARPNESS_SATURATION: f64 = 500.0;
/// Entropy normalisers: log2 of the hue (180) and saturation (256) bin counts, rounded.
const HUE_ENTROPY_MAX: f64 = 7.0;
const SATURATION_ENTROPY_MAX: f64 = 8.0;
/// High-frequency ratio mapping: `(ratio - FLOOR) / SPAN`, clamped.
const FREQUENCY_FLOOR: f64 = 0.1;
const FREQUENCY_SPAN: f64 = 0.4;
/// Larger regions are point-sampled down to this side before the DFT.
const SPECTRUM_MAX_SIDE: usize = 128;

/// Fused liveness score and the sub-scores that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessResult {
    pub overall: f32,
    pub texture: f32,
    pub color: f32,
    pub frequency: f32,
    pub sharpness: f32,
}

impl LivenessResult {
    /// Clamp each sub-score to [0, 1] and fuse.
    pub fn from_sub_scores(texture: f32, color: f32, frequency: f32, sharpness: f32) -> Self {
        let texture = unit(texture);
        let color = unit(color);
        let frequency = unit(frequency);
        let sharpness = unit(sharpness);
        Self {
            overall: fuse(texture, color, frequency, sharpness),
            texture,
            color,
            frequency,
            sharpness,
        }
    }

    pub fn is_live(&self, threshold: f32) -> bool {
        self.overall >= threshold
    }

    /// `(is_spoof, spoof_confidence)` where confidence is `1 - overall`.
    pub fn spoof(&self) -> (bool, f32) {
        let confidence = 1.0 - self.overall;
        (confidence > 0.5, confidence)
    }
}

fn unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Weighted sum of the four sub-scores. The weights sum to 1.
pub fn fuse(texture: f32, color: f32, frequency: f32, sharpness: f32) -> f32 {
    TEXTURE_WEIGHT * texture
        + COLOR_WEIGHT * color
        + FREQUENCY_WEIGHT * frequency
        + SHARPNESS_WEIGHT * sharpness
}

/// Variance of the 4-neighbour Laplacian, borders reflected (`dcb|abcd|cba`).
pub fn laplacian_variance(luma: &Array2<f64>) -> f64 {
    let (rows, cols) = luma.dim();
    if rows == 0 || cols == 0 {
        return 0.0;
    }
    let reflect = |i: isize, n: usize| -> usize {
        if n == 1 {
            return 0;
        }
        let n = n as isize;
        let i = if i < 0 { -i } else { i };
        (if i >= n { 2 * (n - 1) - i } else { i }) as usize
    };

    let count = (rows * cols) as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for r in 0..rows {
        for c in 0..cols {
            let (ri, ci) = (r as isize, c as isize);
            let lap = luma[[reflect(ri - 1, rows), c]]
                + luma[[reflect(ri + 1, rows), c]]
                + luma[[r, reflect(ci - 1, cols)]]
                + luma[[r, reflect(ci + 1, cols)]]
                - 4.0 * luma[[r, c]];
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

/// Local skin texture over the face region.
pub fn texture_score(face_luma: &Array2<f64>) -> f32 {
    let (rows, cols) = face_luma.dim();
    if rows < 3 || cols < 3 {
        return 0.5;
    }
    (laplacian_variance(face_luma) / TEXTURE_SATURATION).min(1.0) as f32
}

/// Global focus of the whole frame.
pub fn sharpness_score(frame_luma: &Array2<f64>) -> f32 {
    (laplacian_variance(frame_luma) / SHARPNESS_SATURATION).min(1.0) as f32
}

/// 8-bit HSV with hue halved into [0, 180).
fn hue_saturation([r, g, b]: [u8; 3]) -> (usize, usize) {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { 255.0 * delta / max } else { 0.0 };
    let mut hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }
    (
        ((hue / 2.0).round() as usize) % 180,
        (saturation.round() as usize).min(255),
    )
}

fn entropy_bits(hist: &[u64], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    hist.iter()
        .filter(|&&n| n > 0)
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

/// Hue and saturation histogram entropy of the face region.
pub fn color_score(face: &RgbImage) -> f32 {
    let mut hue_hist = [0u64; 180];
    let mut sat_hist = [0u64; 256];
    for px in face.pixels() {
        let (h, s) = hue_saturation(px.0);
        hue_hist[h] += 1;
        sat_hist[s] += 1;
    }
    let total = face.width() as u64 * face.height() as u64;
    let hue = (entropy_bits(&hue_hist, total) / HUE_ENTROPY_MAX).min(1.0);
    let sat = (entropy_bits(&sat_hist, total) / SATURATION_ENTROPY_MAX).min(1.0);
    ((hue + sat) / 2.0) as f32
}

fn twiddles(n: usize) -> Vec<(f64, f64)> {
    (0..n)
        .map(|k| {
            let theta = 2.0 * std::f64::consts::PI * k as f64 / n as f64;
            (theta.cos(), theta.sin())
        })
        .collect()
}

/// Magnitude of the 2D DFT, computed as a row pass then a column pass.
fn dft_magnitude(input: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = input.dim();
    let row_tw = twiddles(cols);
    let mut re = Array2::<f64>::zeros((rows, cols));
    let mut im = Array2::<f64>::zeros((rows, cols));
    for r in 0..rows {
        for k in 0..cols {
            let (mut sr, mut si) = (0.0, 0.0);
            for n in 0..cols {
                let (c, s) = row_tw[(k * n) % cols];
                let v = input[[r, n]];
                sr += v * c;
                si -= v * s;
            }
            re[[r, k]] = sr;
            im[[r, k]] = si;
        }
    }

    let col_tw = twiddles(rows);
    let mut magnitude = Array2::<f64>::zeros((rows, cols));
    for k in 0..cols {
        for u in 0..rows {
            let (mut sr, mut si) = (0.0, 0.0);
            for n in 0..rows {
                let (c, s) = col_tw[(u * n) % rows];
                let (a, b) = (re[[n, k]], im[[n, k]]);
                sr += a * c + b * s;
                si += b * c - a * s;
            }
            magnitude[[u, k]] = sr.hypot(si);
        }
    }
    magnitude
}

/// Nearest-sample the plane down so neither side exceeds `max_side`.
/// Point sampling keeps fine detail as aliased energy rather than averaging it away.
fn point_sample(luma: &Array2<f64>, max_side: usize) -> Array2<f64> {
    let (rows, cols) = luma.dim();
    let step = rows.max(cols).div_ceil(max_side).max(1);
    if step == 1 {
        return luma.clone();
    }
    let out_rows = rows.div_ceil(step);
    let out_cols = cols.div_ceil(step);
    Array2::from_shape_fn((out_rows, out_cols), |(r, c)| luma[[r * step, c * step]])
}

/// Share of spectral energy outside a disc of radius `min(rows, cols) / 4`
/// around DC, mapped to [0, 1].
pub fn frequency_score(face_luma: &Array2<f64>) -> f32 {
    let sampled = point_sample(face_luma, SPECTRUM_MAX_SIDE);
    let (rows, cols) = sampled.dim();
    if rows == 0 || cols == 0 {
        return 0.0;
    }
    let magnitude = dft_magnitude(&sampled);
    let radius = (rows.min(cols) / 4) as f64;
    let signed = |i: usize, n: usize| -> f64 {
        if i <= n / 2 {
            i as f64
        } else {
            i as f64 - n as f64
        }
    };

    let mut total = 0.0;
    let mut high = 0.0;
    for ((u, v), m) in magnitude.indexed_iter() {
        total += m;
        if signed(u, rows).hypot(signed(v, cols)) > radius {
            high += m;
        }
    }
    let ratio = high / (total + 1e-10);
    ((ratio - FREQUENCY_FLOOR) / FREQUENCY_SPAN).clamp(0.0, 1.0) as f32
}

/// Scores a frame by locating its face and fusing the four sub-scores.
pub struct LivenessScorer {
    detector: Arc<dyn FaceDetector>,
    config: DetectorConfig,
}

impl LivenessScorer {
    pub fn new(detector: Arc<dyn FaceDetector>, config: DetectorConfig) -> Self {
        Self { detector, config }
    }

    pub fn score(&self, frame: &Frame) -> Result<LivenessResult> {
        let region = locate_face(self.detector.as_ref(), frame, &self.config)?;
        let face = frame.crop(&region);
        let face_luma = face.luma();

        let result = LivenessResult::from_sub_scores(
            texture_score(&face_luma),
            color_score(face.rgb()),
            frequency_score(&face_luma),
            sharpness_score(&frame.luma()),
        );
        tracing::debug!(
            overall = result.overall,
            texture = result.texture,
            color = result.color,
            frequency = result.frequency,
            sharpness = result.sharpness,
            "liveness scored"
        );
        Ok(result)
    }

    pub fn is_live(&self, frame: &Frame, threshold: f32) -> Result<bool> {
        Ok(self.score(frame)?.is_live(threshold))
    }

    pub fn is_spoof(&self, frame: &Frame) -> Result<(bool, f32)> {
        Ok(self.score(frame)?.spoof())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{FullFrameDetector, SkinToneDetector};
    use crate::error::Error;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn full_frame_scorer() -> LivenessScorer {
        LivenessScorer::new(Arc::new(FullFrameDetector), DetectorConfig::default())
    }

    fn uniform(color: [u8; 3]) -> Frame {
        Frame::from_rgb(RgbImage::from_pixel(96, 96, Rgb(color))).unwrap()
    }

    fn noise(seed: u64) -> Frame {
        let mut rng = StdRng::seed_from_u64(seed);
        Frame::from_rgb(RgbImage::from_fn(96, 96, |_, _| Rgb(rng.gen::<[u8; 3]>()))).unwrap()
    }

    #[test]
    fn test_weights_are_convex() {
        let sum = TEXTURE_WEIGHT + COLOR_WEIGHT + FREQUENCY_WEIGHT + SHARPNESS_WEIGHT;
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_fusion_stays_in_unit_interval() {
        let extremes = [-3.0, 0.0, 0.4, 1.0, 7.5, f32::NAN];
        for &t in &extremes {
            for &c in &extremes {
                for &f in &extremes {
                    for &s in &extremes {
                        let r = LivenessResult::from_sub_scores(t, c, f, s);
                        assert!((0.0..=1.0).contains(&r.overall), "{r:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_fusion_weights_applied() {
        let r = LivenessResult::from_sub_scores(1.0, 0.0, 0.0, 0.0);
        assert!((r.overall - 0.30).abs() < 1e-6);
        let r = LivenessResult::from_sub_scores(0.0, 0.0, 0.0, 1.0);
        assert!((r.overall - 0.20).abs() < 1e-6);
    }

    #[test]
    fn test_flat_image_scores_as_spoof() {
        let scorer = full_frame_scorer();
        let frame = uniform([224, 172, 140]);
        let result = scorer.score(&frame).unwrap();
        assert!(result.texture < 0.01);
        assert!(result.frequency < 0.01);
        assert!(result.overall < 0.3);
        assert!(!scorer.is_live(&frame, DEFAULT_LIVENESS_THRESHOLD).unwrap());

        let (spoof, confidence) = scorer.is_spoof(&frame).unwrap();
        assert!(spoof);
        assert!((confidence - (1.0 - result.overall)).abs() < 1e-6);
    }

    #[test]
    fn test_rich_noise_scores_as_live() {
        let scorer = full_frame_scorer();
        let frame = noise(7);
        let result = scorer.score(&frame).unwrap();
        assert!(result.texture > 0.9, "{result:?}");
        assert!(result.sharpness > 0.9, "{result:?}");
        assert!(result.frequency > 0.9, "{result:?}");
        assert!(result.overall > 0.7, "{result:?}");
        assert!(scorer.is_live(&frame, DEFAULT_LIVENESS_THRESHOLD).unwrap());
        assert!(!scorer.is_spoof(&frame).unwrap().0);
    }

    #[test]
    fn test_no_face_is_an_error_not_a_default() {
        let scorer = LivenessScorer::new(
            Arc::new(SkinToneDetector::default()),
            DetectorConfig::default(),
        );
        let err = scorer.score(&uniform([40, 60, 160])).unwrap_err();
        assert!(matches!(err, Error::NoFaceDetected { found: 0 }));
    }

    #[test]
    fn test_laplacian_variance_of_constant_is_zero() {
        let plane = Array2::from_elem((10, 12), 77.0);
        assert_eq!(laplacian_variance(&plane), 0.0);
    }

    #[test]
    fn test_laplacian_of_checkerboard() {
        // Reflected borders keep every pixel's neighbours opposite in sign,
        // so the response is a constant +/-1020.
        let plane =
            Array2::from_shape_fn((8, 8), |(r, c)| if (r + c) % 2 == 0 { 255.0 } else { 0.0 });
        let var = laplacian_variance(&plane);
        assert!((var - 1020.0 * 1020.0).abs() < 1e-6);
    }

    #[test]
    fn test_color_entropy_bounds() {
        assert_eq!(color_score(&RgbImage::from_pixel(8, 8, Rgb([200, 10, 10]))), 0.0);
        let rich = noise(3);
        assert!(color_score(rich.rgb()) > 0.8);
    }

    #[test]
    fn test_hue_conversion() {
        assert_eq!(hue_saturation([255, 0, 0]), (0, 255));
        assert_eq!(hue_saturation([0, 255, 0]), (60, 255));
        assert_eq!(hue_saturation([0, 0, 255]), (120, 255));
        assert_eq!(hue_saturation([90, 90, 90]), (0, 0));
    }

    #[test]
    fn test_frequency_low_for_smooth_gradient() {
        let plane = Array2::from_shape_fn((64, 64), |(_, c)| c as f64 * 2.0);
        assert!(frequency_score(&plane) < 0.5);
    }

    #[test]
    fn test_point_sample_caps_side() {
        let plane = Array2::<f64>::zeros((300, 200));
        let sampled = point_sample(&plane, 128);
        assert!(sampled.nrows() <= 128 && sampled.ncols() <= 128);
    }
}
