//! Captured frame pixel access.
//!
//! Frames are owned by the capture pipeline; the calibration engine borrows
//! them read-only and extracts per-channel `f32` planes for processing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("pixel buffer length {len} does not match {width}x{height}x{channels}")]
    BadDimensions {
        len: usize,
        width: u32,
        height: u32,
        channels: u8,
    },
    #[error("unsupported channel count {0} (expected 1 or 3)")]
    UnsupportedChannels(u8),
}

/// A captured frame: interleaved 8-bit pixels, one or three channels.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    channels: u8,
    data: Vec<u8>,
    /// Capture timestamp in milliseconds, as reported by the driver.
    pub timestamp_ms: u64,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        channels: u8,
        data: Vec<u8>,
        timestamp_ms: u64,
    ) -> Result<Self, FrameError> {
        if channels != 1 && channels != 3 {
            return Err(FrameError::UnsupportedChannels(channels));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(FrameError::BadDimensions {
                len: data.len(),
                width,
                height,
                channels,
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
            timestamp_ms,
        })
    }

    /// Build a grayscale frame by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> u8) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            channels: 1,
            data,
            timestamp_ms: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Luminance plane as `f32`, row-major.
    ///
    /// Three-channel frames use the BT.601 luma weights.
    pub fn luma(&self) -> Vec<f32> {
        match self.channels {
            1 => self.data.iter().map(|&v| v as f32).collect(),
            _ => self
                .data
                .chunks_exact(3)
                .map(|px| 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32)
                .collect(),
        }
    }

    /// A single channel plane as `f32`, row-major.
    ///
    /// For grayscale frames any index returns the only plane.
    pub fn channel(&self, idx: u8) -> Vec<f32> {
        if self.channels == 1 {
            return self.luma();
        }
        let idx = idx.min(2) as usize;
        self.data
            .chunks_exact(3)
            .map(|px| px[idx] as f32)
            .collect()
    }
}

#[cfg(feature = "image")]
impl From<&image::GrayImage> for Frame {
    fn from(img: &image::GrayImage) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
            channels: 1,
            data: img.as_raw().clone(),
            timestamp_ms: 0,
        }
    }
}
