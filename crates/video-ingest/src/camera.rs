//! OpenCV-backed camera source.

use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    FrameSource, parse_device_index,
    types::{CaptureError, Frame, FrameFormat},
};

/// Camera device owned by a single capture loop.
///
/// The device handle stays open between captures unless `release_after_capture`
/// is set, in which case every capture opens and releases the device (the
/// station variant that shares the camera with other tools does this).
pub struct OpenCvCamera {
    uri: String,
    target_size: Option<(i32, i32)>,
    release_after_capture: bool,
    cap: Option<VideoCapture>,
    frame: Mat,
}

impl OpenCvCamera {
    pub fn new(uri: &str, target_size: Option<(i32, i32)>) -> Self {
        Self {
            uri: uri.to_string(),
            target_size,
            release_after_capture: false,
            cap: None,
            frame: Mat::default(),
        }
    }

    pub fn release_after_capture(mut self, release: bool) -> Self {
        self.release_after_capture = release;
        self
    }

    fn device(&mut self) -> Result<&mut VideoCapture, CaptureError> {
        if self.cap.is_none() {
            let mut cap = open_video_capture(&self.uri)?;
            if let Some(size) = self.target_size {
                configure_camera(&mut cap, size);
            }
            debug!(uri = %self.uri, "camera opened");
            self.cap = Some(cap);
        }
        self.cap.as_mut().ok_or_else(|| CaptureError::Open {
            uri: self.uri.clone(),
        })
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let mut frame = std::mem::take(&mut self.frame);
        let read = self
            .device()?
            .read(&mut frame)
            .map_err(|e| CaptureError::Other(e.into()));
        self.frame = frame;

        let grabbed = read?;
        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed || size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::Empty {
                uri: self.uri.clone(),
            });
        }

        let data = self
            .frame
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Frame::new(data, size.width, size.height, FrameFormat::Bgr8)
    }
}

impl FrameSource for OpenCvCamera {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let result = self.read_frame();
        if result.is_err() || self.release_after_capture {
            // Drop the handle so the next attempt reopens the device from scratch.
            if let Some(mut cap) = self.cap.take() {
                let _ = cap.release();
            }
        }
        result
    }

    fn describe(&self) -> String {
        format!("camera {}", self.uri)
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open camera #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Request a capture resolution and MJPG streaming; cameras may ignore either.
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32)) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
}
