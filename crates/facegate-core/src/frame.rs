//! Decoded pixel buffers handed to the core by callers.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use ndarray::Array2;

use crate::detector::FaceRegion;
use crate::error::{Error, Result};

/// An RGB frame. Gray and RGBA inputs are converted on construction.
#[derive(Debug, Clone)]
pub struct Frame {
    rgb: RgbImage,
}

impl Frame {
    /// Fails with `InvalidImage` for a zero-sized buffer.
    pub fn from_rgb(rgb: RgbImage) -> Result<Self> {
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(Error::InvalidImage(format!(
                "empty frame ({}x{})",
                rgb.width(),
                rgb.height()
            )));
        }
        Ok(Self { rgb })
    }

    pub fn from_dynamic(image: DynamicImage) -> Result<Self> {
        Self::from_rgb(image.to_rgb8())
    }

    /// Build a frame from a raw interleaved buffer of `channels` bytes per pixel.
    pub fn from_raw(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidImage(format!(
                "empty frame ({width}x{height})"
            )));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(Error::InvalidImage(format!(
                "buffer holds {} bytes, expected {expected} for {width}x{height}x{channels}",
                data.len()
            )));
        }

        let rgb = match channels {
            1 => GrayImage::from_raw(width, height, data)
                .map(|gray| DynamicImage::ImageLuma8(gray).to_rgb8()),
            3 => RgbImage::from_raw(width, height, data),
            4 => RgbaImage::from_raw(width, height, data)
                .map(|rgba| DynamicImage::ImageRgba8(rgba).to_rgb8()),
            other => {
                return Err(Error::InvalidImage(format!(
                    "unsupported channel count {other}"
                )))
            }
        };

        let rgb =
            rgb.ok_or_else(|| Error::InvalidImage("buffer does not fit frame".to_string()))?;
        Self::from_rgb(rgb)
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    /// Downscale so that the longer side is at most `max_side`, keeping aspect.
    pub fn limit_size(self, max_side: u32) -> Self {
        let longest = self.width().max(self.height());
        if max_side == 0 || longest <= max_side {
            return self;
        }
        let scale = max_side as f64 / longest as f64;
        let width = ((self.width() as f64 * scale) as u32).max(1);
        let height = ((self.height() as f64 * scale) as u32).max(1);
        tracing::debug!(
            from_width = self.width(),
            from_height = self.height(),
            width,
            height,
            "downscaling oversized frame"
        );
        Self {
            rgb: imageops::resize(&self.rgb, width, height, FilterType::Triangle),
        }
    }

    /// Copy out the given region, clamped to the frame bounds.
    pub fn crop(&self, region: &FaceRegion) -> Frame {
        let x = region.x.min(self.width().saturating_sub(1));
        let y = region.y.min(self.height().saturating_sub(1));
        let width = region.width.clamp(1, self.width() - x);
        let height = region.height.clamp(1, self.height() - y);
        Self {
            rgb: imageops::crop_imm(&self.rgb, x, y, width, height).to_image(),
        }
    }

    pub fn resized(&self, width: u32, height: u32) -> Frame {
        Self {
            rgb: imageops::resize(&self.rgb, width, height, FilterType::Triangle),
        }
    }

    /// Luminance plane (BT.601 weights), indexed `[[row, col]]`.
    pub fn luma(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.height() as usize, self.width() as usize));
        for (x, y, px) in self.rgb.enumerate_pixels() {
            let [r, g, b] = px.0;
            out[[y as usize, x as usize]] =
                0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
        }
        out
    }
}
