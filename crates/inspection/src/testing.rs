//! Fake collaborators shared by the unit tests.

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use conveyor_io::{
    ActuatorError, ControllerEvent, ConveyorCommand, ConveyorLink, Direction, RejectActuator,
};
use detector::{BBox, Detect, DetectError, Detection, DetectionBatch};
use video_ingest::{CaptureError, Frame, FrameFormat, FrameSource};

pub(crate) fn solid_frame(width: i32, height: i32, timestamp_ms: i64) -> Frame {
    Frame::with_timestamp(
        vec![90; (width * height * 3) as usize],
        width,
        height,
        FrameFormat::Bgr8,
        timestamp_ms,
    )
    .unwrap()
}

pub(crate) fn detection(label: &str) -> Detection {
    Detection {
        label: label.to_string(),
        bbox: BBox::new(10.0, 10.0, 60.0, 40.0),
        confidence: 0.9,
    }
}

pub(crate) fn detections(labels: &[&str]) -> Vec<Detection> {
    labels.iter().map(|label| detection(label)).collect()
}

/// Conveyor link that records commands and replays scripted events.
#[derive(Clone, Default)]
pub(crate) struct RecordingLink {
    pub commands: Arc<Mutex<Vec<ConveyorCommand>>>,
    pub events: Arc<Mutex<VecDeque<ControllerEvent>>>,
    pub fail_sends: bool,
}

impl RecordingLink {
    pub fn failing() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    pub fn with_events(events: impl IntoIterator<Item = ControllerEvent>) -> Self {
        let link = Self::default();
        link.events.lock().unwrap().extend(events);
        link
    }

    pub fn sent(&self) -> Vec<ConveyorCommand> {
        self.commands.lock().unwrap().clone()
    }
}

impl ConveyorLink for RecordingLink {
    fn send(&mut self, command: ConveyorCommand) -> Result<(), ActuatorError> {
        if self.fail_sends {
            return Err(ActuatorError::Io {
                channel: "conveyor",
                source: io::Error::from(io::ErrorKind::BrokenPipe),
            });
        }
        self.commands.lock().unwrap().push(command);
        Ok(())
    }

    fn poll_event(&mut self) -> Result<Option<ControllerEvent>, ActuatorError> {
        let event = self.events.lock().unwrap().pop_front();
        if event.is_none() {
            // Stand-in for the serial read timeout.
            thread::sleep(Duration::from_millis(1));
        }
        Ok(event)
    }
}

#[derive(Clone, Default)]
pub(crate) struct RecordingActuator {
    pub pulses: Arc<Mutex<Vec<Direction>>>,
    pub releases: Arc<AtomicUsize>,
    pub fail_pulses: bool,
}

impl RecordingActuator {
    pub fn failing() -> Self {
        Self {
            fail_pulses: true,
            ..Self::default()
        }
    }

    pub fn pulsed(&self) -> Vec<Direction> {
        self.pulses.lock().unwrap().clone()
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl RejectActuator for RecordingActuator {
    fn pulse(&mut self, direction: Direction) -> Result<(), ActuatorError> {
        if self.fail_pulses {
            return Err(ActuatorError::Io {
                channel: "servo",
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        self.pulses.lock().unwrap().push(direction);
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Frame source that yields a fixed frame, or fails on scripted attempts.
pub(crate) struct FakeSource {
    pub width: i32,
    pub height: i32,
    pub captures: Arc<AtomicUsize>,
    /// Attempt numbers (0-based) that report the device as unavailable.
    pub fail_on: Vec<usize>,
}

impl FakeSource {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            captures: Arc::new(AtomicUsize::new(0)),
            fail_on: Vec::new(),
        }
    }
}

impl FrameSource for FakeSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let attempt = self.captures.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.contains(&attempt) {
            return Err(CaptureError::Empty {
                uri: "fake".into(),
            });
        }
        Ok(solid_frame(self.width, self.height, attempt as i64))
    }

    fn describe(&self) -> String {
        "fake camera".into()
    }
}

/// Detector answering from a script; repeats the last answer when exhausted.
pub(crate) struct ScriptedDetector {
    answers: Mutex<VecDeque<Result<Vec<Detection>, DetectError>>>,
    last: Mutex<Vec<Detection>>,
    pub calls: AtomicUsize,
    input_size: (u32, u32),
}

impl ScriptedDetector {
    pub fn new(answers: Vec<Result<Vec<Detection>, DetectError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            last: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            input_size: (700, 700),
        }
    }

    pub fn always(labels: &[&str]) -> Self {
        let detector = Self::new(Vec::new());
        *detector.last.lock().unwrap() = detections(labels);
        detector
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detect for ScriptedDetector {
    fn detect(&self, _frame: &Frame) -> Result<DetectionBatch, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.answers.lock().unwrap().pop_front();
        let detections = match next {
            Some(Ok(detections)) => {
                *self.last.lock().unwrap() = detections.clone();
                detections
            }
            Some(Err(err)) => return Err(err),
            None => self.last.lock().unwrap().clone(),
        };
        Ok(DetectionBatch {
            detections,
            input_size: self.input_size,
        })
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }
}
