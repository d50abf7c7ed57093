use chrono::{DateTime, Utc};
use detector::{Detection, DetectionBatch, Scale};
use video_ingest::Frame;

/// One completed remote inference, handed from the dispatcher to the decision loop.
#[derive(Clone, Debug)]
pub struct InferenceResult {
    /// Dispatcher tick that produced the result; strictly increasing.
    pub sequence: u64,
    /// Frame that was sent, at its original resolution.
    pub frame: Frame,
    /// Detections in detector-input coordinates.
    pub detections: Vec<Detection>,
    pub source_width: i32,
    pub source_height: i32,
    pub input_width: u32,
    pub input_height: u32,
    pub received_at: DateTime<Utc>,
    /// The endpoint answered but the body could not be read.
    pub malformed: bool,
}

impl InferenceResult {
    pub fn from_batch(sequence: u64, frame: Frame, batch: DetectionBatch) -> Self {
        let (input_width, input_height) = batch.input_size;
        Self {
            sequence,
            source_width: frame.width,
            source_height: frame.height,
            frame,
            detections: batch.detections,
            input_width,
            input_height,
            received_at: Utc::now(),
            malformed: false,
        }
    }

    /// Result standing in for an unreadable response: no detections.
    pub fn malformed(sequence: u64, frame: Frame, input_size: (u32, u32)) -> Self {
        let mut result = Self::from_batch(
            sequence,
            frame,
            DetectionBatch {
                detections: Vec::new(),
                input_size,
            },
        );
        result.malformed = true;
        result
    }

    /// Factors mapping detector-input coordinates onto the source frame.
    pub fn source_scale(&self) -> Scale {
        Scale::between(
            (self.input_width, self.input_height),
            (
                self.source_width.max(0) as u32,
                self.source_height.max(0) as u32,
            ),
        )
    }
}
