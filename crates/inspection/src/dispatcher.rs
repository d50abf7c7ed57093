//! Inference dispatcher: takes the freshest frame, calls the detector and
//! queues the result for the decision loop.
//!
//! Ticks are strictly serialized, so at most one request is outstanding and
//! results enter the queue in capture order.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use detector::{Detect, DetectError};
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::{
    data::InferenceResult,
    error::{ErrorKind, InspectionError},
    flags::RunFlags,
    slot::FrameSlot,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Run one frame through the detector.
///
/// An unreadable answer is not an error here: it becomes a result without
/// detections, which the decision engine reports as no detection.
pub fn infer<D>(detector: &D, sequence: u64, frame: Frame) -> Result<InferenceResult, InspectionError>
where
    D: Detect + ?Sized,
{
    let started = Instant::now();
    let outcome = detector.detect(&frame);
    metrics::histogram!("inspect_remote_latency_seconds").record(started.elapsed().as_secs_f64());
    match outcome {
        Ok(batch) => Ok(InferenceResult::from_batch(sequence, frame, batch)),
        Err(DetectError::MalformedResponse(reason)) => {
            warn!(sequence, "Detector answer unreadable ({reason}); treating as no detection");
            Ok(InferenceResult::malformed(
                sequence,
                frame,
                detector.input_size(),
            ))
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing captured yet.
    Idle,
    /// A result with this sequence number was queued.
    Queued(u64),
    /// The tick was dropped; the next one proceeds normally.
    Skipped(ErrorKind),
    /// The decision loop is gone.
    Closed,
}

impl TickOutcome {
    fn label(self) -> &'static str {
        match self {
            TickOutcome::Idle => "idle",
            TickOutcome::Queued(_) => "queued",
            TickOutcome::Skipped(_) => "skipped",
            TickOutcome::Closed => "closed",
        }
    }
}

pub struct Dispatcher {
    detector: Arc<dyn Detect>,
    slot: FrameSlot,
    results: Sender<InferenceResult>,
    /// Shared with whoever restarts the dispatcher, so numbering survives a
    /// worker that was never joined.
    sequence: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(detector: Arc<dyn Detect>, slot: FrameSlot, results: Sender<InferenceResult>) -> Self {
        Self {
            detector,
            slot,
            results,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Draw sequence numbers from `counter` instead of a private one.
    pub fn with_sequence(mut self, counter: Arc<AtomicU64>) -> Self {
        self.sequence = counter;
        self
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn tick(&mut self) -> TickOutcome {
        let Some(frame) = self.slot.latest() else {
            debug!("No frame captured yet; waiting");
            return TickOutcome::Idle;
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        match infer(self.detector.as_ref(), sequence, frame) {
            Ok(result) => {
                debug!(
                    sequence,
                    detections = result.detections.len(),
                    "inference result queued"
                );
                match self.results.send(result) {
                    Ok(()) => {
                        metrics::gauge!("inspect_queue_depth").set(self.results.len() as f64);
                        TickOutcome::Queued(sequence)
                    }
                    Err(_) => TickOutcome::Closed,
                }
            }
            Err(err) => {
                warn!(sequence, kind = err.kind().label(), "Skipping inference tick: {err}");
                TickOutcome::Skipped(err.kind())
            }
        }
    }
}

pub(crate) fn spawn_dispatch_worker(
    mut dispatcher: Dispatcher,
    poll_interval: Duration,
    health: Arc<PipelineHealth>,
    flags: RunFlags,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("inspect-dispatch", move || {
        while flags.is_active() {
            health.beat(HealthComponent::Dispatch);
            let outcome = tracing::info_span!("dispatch", sequence = dispatcher.next_sequence())
                .in_scope(|| dispatcher.tick());
            metrics::counter!("inspect_ticks_total", "outcome" => outcome.label()).increment(1);
            if outcome == TickOutcome::Closed {
                warn!("Result queue closed; stopping dispatcher");
                flags.stop();
                break;
            }
            if !flags.pause(poll_interval) {
                break;
            }
        }
    })
    .expect("failed to spawn dispatch thread")
}

#[cfg(test)]
mod tests {
    use detector::DetectError;

    use super::*;
    use crate::testing::{ScriptedDetector, detections, solid_frame};

    fn dispatcher(
        detector: ScriptedDetector,
    ) -> (
        Dispatcher,
        FrameSlot,
        crossbeam_channel::Receiver<InferenceResult>,
    ) {
        let slot = FrameSlot::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Dispatcher::new(Arc::new(detector), slot.clone(), tx),
            slot,
            rx,
        )
    }

    #[test]
    fn empty_slot_is_idle() {
        let (mut dispatcher, _slot, rx) = dispatcher(ScriptedDetector::always(&["USB"]));
        assert_eq!(dispatcher.tick(), TickOutcome::Idle);
        assert!(rx.is_empty());
    }

    #[test]
    fn results_keep_source_dimensions_and_order() {
        let (mut dispatcher, slot, rx) = dispatcher(ScriptedDetector::always(&["USB", "CHIPSET"]));
        slot.publish(solid_frame(1280, 720, 1));
        assert_eq!(dispatcher.tick(), TickOutcome::Queued(0));
        slot.publish(solid_frame(1280, 720, 2));
        assert_eq!(dispatcher.tick(), TickOutcome::Queued(1));

        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        assert_eq!((first.sequence, second.sequence), (0, 1));
        assert_eq!((first.source_width, first.source_height), (1280, 720));
        assert_eq!((first.input_width, first.input_height), (700, 700));
        assert_eq!(first.frame.timestamp_ms, 1);
        assert_eq!(second.frame.timestamp_ms, 2);
        assert_eq!(first.detections.len(), 2);
    }

    #[test]
    fn failed_remote_call_skips_the_tick() {
        let detector = ScriptedDetector::new(vec![
            Err(DetectError::RemoteCallFailed {
                status: 500,
                body: "boom".into(),
            }),
            Ok(detections(&["USB"])),
        ]);
        let (mut dispatcher, slot, rx) = dispatcher(detector);
        slot.publish(solid_frame(4, 4, 1));
        assert_eq!(
            dispatcher.tick(),
            TickOutcome::Skipped(ErrorKind::RemoteCallFailed)
        );
        assert!(rx.is_empty());
        assert_eq!(dispatcher.tick(), TickOutcome::Queued(1));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn malformed_answer_becomes_empty_result() {
        let detector = ScriptedDetector::new(vec![Err(DetectError::MalformedResponse(
            "missing objects".into(),
        ))]);
        let (mut dispatcher, slot, rx) = dispatcher(detector);
        slot.publish(solid_frame(4, 4, 1));
        assert_eq!(dispatcher.tick(), TickOutcome::Queued(0));
        let result = rx.recv().unwrap();
        assert!(result.malformed);
        assert!(result.detections.is_empty());
    }

    #[test]
    fn replacement_dispatcher_continues_shared_numbering() {
        let counter = Arc::new(AtomicU64::new(0));
        let (first, first_slot, first_rx) = dispatcher(ScriptedDetector::always(&["USB"]));
        let mut first = first.with_sequence(counter.clone());
        first_slot.publish(solid_frame(4, 4, 1));
        assert_eq!(first.tick(), TickOutcome::Queued(0));
        assert_eq!(first.tick(), TickOutcome::Queued(1));

        // The first dispatcher is left alive, as after a join timeout.
        let (second, second_slot, second_rx) = dispatcher(ScriptedDetector::always(&["USB"]));
        let mut second = second.with_sequence(counter.clone());
        second_slot.publish(solid_frame(4, 4, 2));
        assert_eq!(second.tick(), TickOutcome::Queued(2));
        assert_eq!(first.tick(), TickOutcome::Queued(3));
        assert_eq!(second.next_sequence(), 4);

        assert_eq!(second_rx.recv().unwrap().sequence, 2);
        assert_eq!(first_rx.len(), 3);
    }

    #[test]
    fn dropped_receiver_closes_dispatcher() {
        let (mut dispatcher, slot, rx) = dispatcher(ScriptedDetector::always(&["USB"]));
        drop(rx);
        slot.publish(solid_frame(4, 4, 1));
        assert_eq!(dispatcher.tick(), TickOutcome::Closed);
    }
}
