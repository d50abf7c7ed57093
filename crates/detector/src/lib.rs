//! Client side of the hosted object-detection service.
//!
//! Frames are resized to the model's fixed input resolution, JPEG encoded and
//! POSTed with basic auth. Boxes in the answer stay in that input resolution;
//! callers rescale them with [`Scale`].

pub use client::{RemoteDetector, RemoteDetectorConfig};
pub use detection::{BBox, Detection, DetectionBatch, Scale};
pub use error::DetectError;
pub use prepare::encode_for_detector;
pub use response::parse_detections;

mod client;
mod detection;
mod error;
mod prepare;
mod response;

use video_ingest::Frame;

/// Object detector seam. The production implementation calls the remote
/// endpoint; tests script answers.
pub trait Detect: Send + Sync {
    /// Run detection on one frame. Blocks until the answer arrives.
    fn detect(&self, frame: &Frame) -> Result<DetectionBatch, DetectError>;

    /// Resolution the detector expects its input in.
    fn input_size(&self) -> (u32, u32);
}
