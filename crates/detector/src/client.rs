use std::time::{Duration, Instant};

use reqwest::{
    blocking::Client,
    header::{CONTENT_TYPE, HeaderValue},
};
use tracing::debug;
use video_ingest::Frame;

use crate::{
    Detect,
    detection::DetectionBatch,
    error::DetectError,
    prepare::encode_for_detector,
    response::parse_detections,
};

/// Connection settings for the hosted detection endpoint.
#[derive(Clone, Debug)]
pub struct RemoteDetectorConfig {
    pub endpoint: String,
    /// Basic-auth user name (the team identifier).
    pub team: String,
    pub access_key: String,
    /// Fixed resolution the model was trained on.
    pub input_size: (u32, u32),
    pub jpeg_quality: u8,
    pub timeout: Duration,
}

/// Blocking HTTP client for the remote detector.
pub struct RemoteDetector {
    client: Client,
    config: RemoteDetectorConfig,
    confidence_threshold: f32,
}

impl RemoteDetector {
    pub fn new(config: RemoteDetectorConfig) -> Result<Self, DetectError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            confidence_threshold: 0.0,
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

impl Detect for RemoteDetector {
    fn detect(&self, frame: &Frame) -> Result<DetectionBatch, DetectError> {
        let input_size = self.config.input_size;
        let body = encode_for_detector(frame, input_size, self.config.jpeg_quality)?;

        let started = Instant::now();
        let response = self
            .client
            .post(&self.config.endpoint)
            .basic_auth(&self.config.team, Some(&self.config.access_key))
            .header(CONTENT_TYPE, HeaderValue::from_static("image/jpeg"))
            .body(body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DetectError::RemoteCallFailed {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let bytes = response.bytes()?;
        debug!(
            status = status.as_u16(),
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "detection response received"
        );

        let detections = parse_detections(&bytes, self.confidence_threshold)?;
        Ok(DetectionBatch {
            detections,
            input_size,
        })
    }

    fn input_size(&self) -> (u32, u32) {
        self.config.input_size
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
    };

    use video_ingest::FrameFormat;

    use super::*;

    /// Answer a single HTTP request with `status` and `body`, then close.
    fn serve_once(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}/detect", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        (endpoint, handle)
    }

    fn read_request(stream: &mut impl Read) {
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "client closed before sending headers");
            request.extend_from_slice(&buf[..n]);
            if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while request.len() < header_end + content_length {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
    }

    fn detector(endpoint: String) -> RemoteDetector {
        let config = RemoteDetectorConfig {
            endpoint,
            team: "line-4".into(),
            access_key: "secret".into(),
            input_size: (32, 32),
            jpeg_quality: 80,
            timeout: Duration::from_secs(5),
        };
        // Keep proxy settings from the environment away from the loopback fixture.
        let client = Client::builder()
            .no_proxy()
            .timeout(config.timeout)
            .build()
            .unwrap();
        RemoteDetector {
            client,
            config,
            confidence_threshold: 0.0,
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![100; 16 * 16 * 3], 16, 16, FrameFormat::Bgr8).unwrap()
    }

    #[test]
    fn server_error_is_a_remote_failure() {
        let (endpoint, server) = serve_once("500 Internal Server Error", "boom");
        let outcome = detector(endpoint).detect(&frame());
        server.join().unwrap();
        match outcome {
            Err(DetectError::RemoteCallFailed { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected a remote failure, got {other:?}"),
        }
    }

    #[test]
    fn successful_answer_is_parsed_at_input_size() {
        let (endpoint, server) = serve_once(
            "200 OK",
            r#"{"objects": [{"class": "USB", "box": [1, 2, 10, 12], "score": 0.8}]}"#,
        );
        let batch = detector(endpoint)
            .with_confidence_threshold(0.5)
            .detect(&frame())
            .unwrap();
        server.join().unwrap();
        assert_eq!(batch.input_size, (32, 32));
        assert_eq!(batch.detections.len(), 1);
        assert_eq!(batch.detections[0].label, "USB");
    }
}
