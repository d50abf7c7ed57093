use thiserror::Error;
use video_ingest::CaptureError;

#[derive(Debug, Error)]
pub enum DetectError {
    /// The endpoint answered with a non-success status.
    #[error("detection endpoint returned HTTP {status}: {body}")]
    RemoteCallFailed { status: u16, body: String },
    /// The request never completed (DNS, TLS, timeout, connection reset).
    #[error("detection request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The response body is not the expected detection document.
    #[error("malformed detection response: {0}")]
    MalformedResponse(String),
    #[error("failed to prepare request image: {0}")]
    Encode(String),
    #[error(transparent)]
    Frame(#[from] CaptureError),
}

impl DetectError {
    /// Failures of the remote call itself, as opposed to local preparation
    /// problems or an unreadable answer.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            DetectError::RemoteCallFailed { .. } | DetectError::Transport(_)
        )
    }
}
