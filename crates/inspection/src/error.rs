use detector::DetectError;
use thiserror::Error;
use video_ingest::CaptureError;

/// Coarse classification of a skipped tick.
///
/// Conveyor and servo failures are not classified here: they stay typed as
/// `conveyor_io::ActuatorError` and always end the control loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Camera could not be opened or read. Skip the tick.
    DeviceUnavailable,
    /// Non-2xx answer or transport failure. Skip the tick.
    RemoteCallFailed,
    /// Answer without the expected structure. Decided as no detection.
    MalformedResponse,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::DeviceUnavailable => "device_unavailable",
            ErrorKind::RemoteCallFailed => "remote_call_failed",
            ErrorKind::MalformedResponse => "malformed_response",
        }
    }
}

/// Failure of a single capture-and-infer tick.
#[derive(Debug, Error)]
pub enum InspectionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Detect(#[from] DetectError),
}

impl InspectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InspectionError::Capture(_) => ErrorKind::DeviceUnavailable,
            InspectionError::Detect(err) => match err {
                DetectError::RemoteCallFailed { .. } | DetectError::Transport(_) => {
                    ErrorKind::RemoteCallFailed
                }
                DetectError::MalformedResponse(_) => ErrorKind::MalformedResponse,
                // The frame could not be prepared for sending.
                DetectError::Encode(_) | DetectError::Frame(_) => ErrorKind::DeviceUnavailable,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_failures_are_classified() {
        let remote = InspectionError::from(DetectError::RemoteCallFailed {
            status: 503,
            body: String::new(),
        });
        assert_eq!(remote.kind(), ErrorKind::RemoteCallFailed);
        assert_eq!(remote.kind().label(), "remote_call_failed");

        let malformed = InspectionError::from(DetectError::MalformedResponse("no objects".into()));
        assert_eq!(malformed.kind(), ErrorKind::MalformedResponse);

        let camera = InspectionError::from(CaptureError::Empty { uri: "0".into() });
        assert_eq!(camera.kind(), ErrorKind::DeviceUnavailable);

        let encode = InspectionError::from(DetectError::Encode("zero-sized frame".into()));
        assert_eq!(encode.kind(), ErrorKind::DeviceUnavailable);
    }
}
