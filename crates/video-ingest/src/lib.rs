//! Frame sources for the inspection station.
//!
//! A [`FrameSource`] hands out one [`Frame`] per call. Sources own their device
//! handle; callers own the retry cadence.

use std::path::Path;

pub use replay::ImageReplaySource;
pub use types::{CaptureError, Frame, FrameFormat, Roi};

#[cfg(feature = "with-opencv")]
pub use camera::OpenCvCamera;

#[cfg(feature = "with-opencv")]
mod camera;
mod replay;
mod types;

/// Anything that can produce a frame on demand.
///
/// `capture` fails with [`CaptureError`] when the device cannot be opened or a
/// read returns no data. Implementations must not retry internally: callers
/// space out attempts to avoid fighting over the device.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Short human readable description for logs.
    fn describe(&self) -> String;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        (**self).capture()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Options applied when a camera device is opened.
#[derive(Clone, Copy, Debug, Default)]
pub struct CameraOptions {
    /// Requested capture resolution.
    pub target_size: Option<(i32, i32)>,
    /// Open and release the device around every capture.
    pub release_after_capture: bool,
}

/// Open the source named by `uri`.
///
/// Paths to image files or directories replay stills from disk; anything else
/// (`0`, `/dev/video2`, `rtsp://...`) is handed to the camera backend.
pub fn open_source(uri: &str, options: CameraOptions) -> Result<Box<dyn FrameSource>, CaptureError> {
    let path = Path::new(uri);
    if path.is_dir() || (path.is_file() && replay::is_image_path(path)) {
        return Ok(Box::new(ImageReplaySource::open(path)?));
    }
    open_camera(uri, options)
}

#[cfg(feature = "with-opencv")]
fn open_camera(uri: &str, options: CameraOptions) -> Result<Box<dyn FrameSource>, CaptureError> {
    Ok(Box::new(
        OpenCvCamera::new(uri, options.target_size)
            .release_after_capture(options.release_after_capture),
    ))
}

#[cfg(not(feature = "with-opencv"))]
fn open_camera(uri: &str, _options: CameraOptions) -> Result<Box<dyn FrameSource>, CaptureError> {
    tracing::error!("camera source {uri:?} requested but built without `with-opencv`");
    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Parse a `/dev/videoX` style URI (or a bare index) and return the device index.
#[cfg(any(feature = "with-opencv", test))]
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_index_from_bare_number_or_dev_path() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video3"), Some(3));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }

    #[test]
    fn directories_open_as_replay_sources() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbImage::new(2, 2)
            .save(dir.path().join("frame.png"))
            .unwrap();
        let source = open_source(dir.path().to_str().unwrap(), CameraOptions::default()).unwrap();
        assert!(source.describe().starts_with("replay"));
    }
}
