use anyhow::{ensure, Context, Result};
use common::Resolution;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on pixels sampled by the variance check.
const VARIANCE_SAMPLE_PIXELS: usize = 65_536;

/// One decoded RGB24 frame. Cloning shares the pixel buffer.
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
    pub captured_at: Instant,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        ensure!(width > 0 && height > 0, "frame has zero dimension");
        let expected = width as usize * height as usize * 3;
        ensure!(
            data.len() == expected,
            "RGB24 frame {}x{} needs {} bytes, got {}",
            width,
            height,
            expected,
            data.len()
        );
        Ok(Self {
            width,
            height,
            data: data.into(),
            captured_at: Instant::now(),
        })
    }

    /// Uniformly colored frame.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let data: Vec<u8> = rgb.iter().copied().cycle().take(pixels * 3).collect();
        Self {
            width,
            height,
            data: data.into(),
            captured_at: Instant::now(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Variance of BT.601 luma over an evenly strided sample of pixels.
    pub fn luma_variance(&self) -> f64 {
        let pixels = self.data.len() / 3;
        if pixels == 0 {
            return 0.0;
        }
        let step = (pixels / VARIANCE_SAMPLE_PIXELS).max(1);

        let mut count = 0f64;
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        for px in self.data.chunks_exact(3).step_by(step) {
            let luma = 0.299 * f64::from(px[0]) + 0.587 * f64::from(px[1]) + 0.114 * f64::from(px[2]);
            count += 1.0;
            sum += luma;
            sum_sq += luma * luma;
        }
        let mean = sum / count;
        (sum_sq / count - mean * mean).max(0.0)
    }

    /// True for the flat gray/black frames some decoders emit at stream start.
    pub fn is_solid(&self, min_variance: f64) -> bool {
        self.luma_variance() < min_variance
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
            .context("JPEG encoding failed")?;
        Ok(out)
    }
}
