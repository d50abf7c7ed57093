use std::{fmt, str::FromStr, sync::Arc};

use anyhow::Error;
use chrono::Utc;
use image::RgbImage;
use thiserror::Error;

/// Immutable snapshot of a captured image.
///
/// Pixel data sits behind an `Arc` so handing a frame to another stage is a
/// reference-count bump; nobody can mutate the pixels after capture.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Arc<[u8]>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// OpenCV native channel order.
    Bgr8,
    Rgb8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 | FrameFormat::Rgb8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source {uri:?} returned no data")]
    Empty { uri: String },
    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height}")]
    InvalidBuffer {
        width: i32,
        height: i32,
        expected: usize,
        actual: usize,
    },
    #[error("crop region {roi} lies outside the {width}x{height} frame")]
    CropOutOfBounds { roi: Roi, width: i32, height: i32 },
    #[error(transparent)]
    Other(#[from] Error),
}

impl Frame {
    /// Wrap a raw pixel buffer, stamping it with the current wall-clock time.
    pub fn new(
        data: Vec<u8>,
        width: i32,
        height: i32,
        format: FrameFormat,
    ) -> Result<Self, CaptureError> {
        Self::with_timestamp(data, width, height, format, Utc::now().timestamp_millis())
    }

    pub fn with_timestamp(
        data: Vec<u8>,
        width: i32,
        height: i32,
        format: FrameFormat,
        timestamp_ms: i64,
    ) -> Result<Self, CaptureError> {
        let expected = buffer_len(width, height, format);
        if width <= 0 || height <= 0 || data.len() != expected {
            return Err(CaptureError::InvalidBuffer {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            timestamp_ms,
            format,
        })
    }

    /// Build a frame from an already decoded RGB image.
    pub fn from_rgb_image(image: RgbImage) -> Result<Self, CaptureError> {
        let width = image.width() as i32;
        let height = image.height() as i32;
        Self::new(image.into_raw(), width, height, FrameFormat::Rgb8)
    }

    /// Convert to an `RgbImage`, reordering channels when the frame is BGR.
    pub fn to_rgb_image(&self) -> Result<RgbImage, CaptureError> {
        let rgb = match self.format {
            FrameFormat::Rgb8 => self.data.to_vec(),
            FrameFormat::Bgr8 => bgr_to_rgb(&self.data),
        };
        RgbImage::from_raw(self.width as u32, self.height as u32, rgb).ok_or(
            CaptureError::InvalidBuffer {
                width: self.width,
                height: self.height,
                expected: buffer_len(self.width, self.height, self.format),
                actual: self.data.len(),
            },
        )
    }

    /// Copy out the pixels inside `roi`. The timestamp of the original capture is kept.
    pub fn crop(&self, roi: Roi) -> Result<Frame, CaptureError> {
        if roi.width == 0
            || roi.height == 0
            || roi.x as i64 + roi.width as i64 > self.width as i64
            || roi.y as i64 + roi.height as i64 > self.height as i64
        {
            return Err(CaptureError::CropOutOfBounds {
                roi,
                width: self.width,
                height: self.height,
            });
        }

        let bpp = self.format.bytes_per_pixel();
        let stride = self.width as usize * bpp;
        let row_len = roi.width as usize * bpp;
        let mut data = Vec::with_capacity(row_len * roi.height as usize);
        for row in roi.y as usize..(roi.y + roi.height) as usize {
            let start = row * stride + roi.x as usize * bpp;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Frame::with_timestamp(
            data,
            roi.width as i32,
            roi.height as i32,
            self.format,
            self.timestamp_ms,
        )
    }
}

/// Rectangular region of interest in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for Roi {
    type Err = String;

    /// Parses `x,y,width,height`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("invalid crop region {s:?}: {err}"))?;
        match parts.as_slice() {
            [x, y, width, height] if *width > 0 && *height > 0 => Ok(Roi {
                x: *x,
                y: *y,
                width: *width,
                height: *height,
            }),
            [_, _, _, _] => Err(format!("crop region {s:?} must have a non-zero size")),
            _ => Err(format!("crop region {s:?} must be x,y,width,height")),
        }
    }
}

fn buffer_len(width: i32, height: i32, format: FrameFormat) -> usize {
    width.max(0) as usize * height.max(0) as usize * format.bytes_per_pixel()
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}
