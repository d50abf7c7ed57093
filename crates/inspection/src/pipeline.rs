//! Pipeline supervisor tying together capture, dispatch and the decision loop.
//!
//! Capture and dispatch run on their own threads; the calling thread consumes
//! results in order and owns every hardware side effect. Stalled stages are
//! restarted; hardware failures end the run.

use std::{
    sync::{
        Arc, Once, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use conveyor_io::{ActuatorError, ConveyorLink, RejectActuator};
use crossbeam_channel::RecvTimeoutError;
use detector::Detect;
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, FrameSource};

use crate::{
    capture::spawn_capture_worker,
    config::{CaptureSettings, DispatchSettings, InspectionConfig, WatchdogSettings},
    data::InferenceResult,
    dispatcher::{Dispatcher, spawn_dispatch_worker},
    flags::RunFlags,
    inspector::{CycleStats, Inspector},
    slot::FrameSlot,
    watchdog::{PipelineHealth, WatchdogState, spawn_watchdog},
};

const RESULT_WAIT: Duration = Duration::from_millis(200);
const RESTART_DELAY: Duration = Duration::from_secs(1);
const CAPTURE_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Process-wide shutdown flag raised by Ctrl+C.
pub fn shutdown_flag() -> Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = FLAG
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone();
    CTRL_HANDLER.call_once(|| {
        let handler_shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}

/// Settings the supervisor needs from the full configuration.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub capture: CaptureSettings,
    pub dispatch: DispatchSettings,
    pub watchdog: WatchdogSettings,
    /// Upper bound on one remote call, used when waiting for the dispatcher.
    pub request_timeout: Duration,
}

impl From<&InspectionConfig> for PipelineSettings {
    fn from(config: &InspectionConfig) -> Self {
        Self {
            capture: config.capture.clone(),
            dispatch: config.dispatch,
            watchdog: config.watchdog,
            request_timeout: config.detector.remote.timeout,
        }
    }
}

/// Result of a single pipeline run attempt.
enum PipelineOutcome {
    Graceful,
    Restart(&'static str),
}

/// Threaded capture → dispatch → decide pipeline.
pub struct Pipeline<L, A, F> {
    settings: PipelineSettings,
    detector: Arc<dyn Detect>,
    inspector: Inspector<L, A>,
    open_source: F,
    sequence: Arc<AtomicU64>,
}

impl<L, A, F> Pipeline<L, A, F>
where
    L: ConveyorLink,
    A: RejectActuator,
    F: FnMut(&CaptureSettings) -> Result<Box<dyn FrameSource>, CaptureError>,
{
    pub fn new(
        settings: PipelineSettings,
        detector: Arc<dyn Detect>,
        inspector: Inspector<L, A>,
        open_source: F,
    ) -> Self {
        Self {
            settings,
            detector,
            inspector,
            open_source,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run until `shutdown` is raised, restarting on recoverable faults.
    ///
    /// The conveyor is left stopped and the actuator released on every exit
    /// path. Hardware errors are returned after that cleanup.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<CycleStats, ActuatorError> {
        let result = self.supervise(&shutdown);
        let stats = self.inspector.stats();
        let cleanup = self.inspector.into_controller().shutdown();
        info!(
            cycles = stats.cycles,
            compliant = stats.compliant,
            defective = stats.defective,
            no_detection = stats.no_detection,
            "Inspection pipeline stopped"
        );
        result.and(cleanup).map(|()| stats)
    }

    fn supervise(&mut self, shutdown: &Arc<AtomicBool>) -> Result<(), ActuatorError> {
        self.inspector.controller_mut().engage()?;

        let mut attempt: u32 = 0;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.run_once(shutdown.clone())? {
                PipelineOutcome::Graceful => return Ok(()),
                PipelineOutcome::Restart(reason) => {
                    attempt = attempt.saturating_add(1);
                    warn!("Pipeline restart requested (reason: {reason}), attempt #{attempt}");
                    metrics::counter!("inspect_pipeline_restarts_total", "reason" => reason)
                        .increment(1);
                    // Nothing is inspected while restarting.
                    self.inspector.controller_mut().halt()?;
                    let flags = RunFlags::new(shutdown.clone());
                    flags.pause(RESTART_DELAY);
                }
            }
        }
    }

    fn run_once(&mut self, shutdown: Arc<AtomicBool>) -> Result<PipelineOutcome, ActuatorError> {
        let flags = RunFlags::new(shutdown);
        let pipeline_span = tracing::info_span!(
            "inspect.pipeline",
            source = %self.settings.capture.source_uri,
            poll_ms = self.settings.dispatch.poll_interval.as_millis() as u64,
        );
        let _pipeline_guard = pipeline_span.enter();

        let source = match (self.open_source)(&self.settings.capture) {
            Ok(source) => source,
            Err(err) => {
                warn!("Capture source unavailable: {err}");
                flags.pause(self.settings.capture.retry_delay);
                return Ok(PipelineOutcome::Restart("capture source unavailable"));
            }
        };
        info!("Capturing from {}", source.describe());

        let slot = FrameSlot::new();
        let (result_tx, result_rx) = match self.settings.dispatch.queue_capacity {
            Some(capacity) => crossbeam_channel::bounded::<InferenceResult>(capacity),
            None => crossbeam_channel::unbounded::<InferenceResult>(),
        };

        let health = Arc::new(PipelineHealth::new(&self.settings.watchdog));
        let watchdog_state = Arc::new(WatchdogState::new());
        let watchdog_handle = spawn_watchdog(
            health.clone(),
            flags.running(),
            flags.shutdown(),
            watchdog_state.clone(),
            self.settings.watchdog.poll_interval,
        );
        let capture_handle = spawn_capture_worker(
            source,
            slot.clone(),
            self.settings.capture.clone(),
            health.clone(),
            flags.clone(),
        );
        let dispatcher = Dispatcher::new(self.detector.clone(), slot, result_tx)
            .with_sequence(self.sequence.clone());
        let dispatch_handle = spawn_dispatch_worker(
            dispatcher,
            self.settings.dispatch.poll_interval,
            health,
            flags.clone(),
        );

        let mut fatal = None;
        let mut restart_reason = None;
        while flags.is_active() {
            match result_rx.recv_timeout(RESULT_WAIT) {
                Ok(result) => {
                    if let Err(err) = self.inspector.handle(&result) {
                        error!("Conveyor hardware failed: {err}");
                        fatal = Some(err);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    restart_reason = Some("result queue closed");
                    break;
                }
            }
        }

        debug!("Stopping pipeline workers");
        flags.stop();
        // Unblocks a dispatcher waiting on a full bounded queue.
        drop(result_rx);

        let dispatch_timeout = self.settings.request_timeout + self.settings.dispatch.poll_interval;
        join_within(dispatch_handle, "dispatch", dispatch_timeout);
        join_within(capture_handle, "capture", CAPTURE_JOIN_TIMEOUT);
        let _ = watchdog_handle.join();

        if let Some(err) = fatal {
            return Err(err);
        }
        if watchdog_state.is_triggered() {
            let reason = watchdog_state
                .reason()
                .map(|component| component.label())
                .unwrap_or("watchdog");
            return Ok(PipelineOutcome::Restart(reason));
        }
        if let Some(reason) = restart_reason {
            return Ok(PipelineOutcome::Restart(reason));
        }
        Ok(PipelineOutcome::Graceful)
    }
}

/// Join a worker, giving up (and leaving it detached) after `timeout`.
fn join_within<T>(handle: thread::JoinHandle<T>, name: &str, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{name} worker did not stop within {timeout:?}; leaving it detached");
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!("{name} worker panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use conveyor_io::{ConveyorCommand, Direction};
    use video_ingest::CameraOptions;

    use super::*;
    use crate::{
        compliance::{CompositionMode, ExpectedComposition},
        conveyor::{ControllerOptions, ConveyorController, DefectPolicy},
        testing::{FakeSource, RecordingActuator, RecordingLink, ScriptedDetector, detections},
    };

    fn settings() -> PipelineSettings {
        PipelineSettings {
            capture: CaptureSettings {
                source_uri: "fake".into(),
                camera: CameraOptions::default(),
                interval: Duration::from_millis(2),
                retry_delay: Duration::from_millis(5),
                crop: None,
            },
            dispatch: DispatchSettings {
                poll_interval: Duration::from_millis(5),
                queue_capacity: None,
            },
            watchdog: WatchdogSettings {
                poll_interval: Duration::from_millis(20),
                stale_after: Duration::from_secs(5),
                startup_grace: Duration::from_secs(5),
            },
            request_timeout: Duration::from_secs(1),
        }
    }

    fn inspector(
        policy: DefectPolicy,
        link: RecordingLink,
        actuator: RecordingActuator,
    ) -> Inspector<RecordingLink, RecordingActuator> {
        let composition = ExpectedComposition::new(
            CompositionMode::Presence,
            [("USB", 1), ("OSCILLATOR", 1), ("CHIPSET", 1), ("BOOTSEL", 1)],
        )
        .unwrap();
        let controller = ConveyorController::new(
            link,
            actuator,
            ControllerOptions {
                policy,
                reject_direction: Direction::Backward,
                keep_alive: false,
            },
        );
        Inspector::new(composition, controller)
    }

    /// Raise `shutdown` once `done` holds, or after a generous timeout.
    fn stop_when(
        shutdown: Arc<AtomicBool>,
        done: impl Fn() -> bool + Send + 'static,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !done() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            shutdown.store(true, Ordering::SeqCst);
        })
    }

    #[test]
    fn defective_stream_stops_then_resumes_after_removal() {
        let detector = ScriptedDetector::new(vec![
            Ok(detections(&["USB", "OSCILLATOR", "CHIPSET", "BOOTSEL"])),
            Ok(detections(&["USB", "USB", "OSCILLATOR", "CHIPSET", "BOOTSEL"])),
            Ok(detections(&["USB", "USB", "OSCILLATOR", "CHIPSET", "BOOTSEL"])),
            Ok(detections(&["USB", "USB", "OSCILLATOR", "CHIPSET", "BOOTSEL"])),
            Ok(Vec::new()),
            Ok(detections(&["USB", "OSCILLATOR", "CHIPSET", "BOOTSEL"])),
        ]);
        let link = RecordingLink::default();
        let actuator = RecordingActuator::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let watcher = {
            let link = link.clone();
            stop_when(shutdown.clone(), move || {
                link.sent().len() >= 3
            })
        };

        let pipeline = Pipeline::new(
            settings(),
            Arc::new(detector),
            inspector(DefectPolicy::Stop, link.clone(), actuator.clone()),
            |_: &CaptureSettings| -> Result<Box<dyn FrameSource>, CaptureError> {
                Ok(Box::new(FakeSource::new(32, 32)) as Box<dyn FrameSource>)
            },
        );
        let stats = pipeline.run(shutdown).unwrap();
        watcher.join().unwrap();

        let sent = link.sent();
        // Engage, stop on the duplicate, resume once the product is gone.
        assert_eq!(
            &sent[..3],
            &[
                ConveyorCommand::Start,
                ConveyorCommand::Stop,
                ConveyorCommand::Start
            ]
        );
        assert!(stats.defective >= 2);
        assert_eq!(actuator.release_count(), 1);
        assert!(actuator.pulsed().is_empty());
    }

    #[test]
    fn reject_policy_pulses_without_stopping() {
        let detector = ScriptedDetector::new(vec![Ok(detections(&["USB", "HOLE"]))]);
        let link = RecordingLink::default();
        let actuator = RecordingActuator::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let watcher = {
            let actuator = actuator.clone();
            stop_when(shutdown.clone(), move || actuator.pulsed().len() >= 2)
        };

        let pipeline = Pipeline::new(
            settings(),
            Arc::new(detector),
            inspector(DefectPolicy::Reject, link.clone(), actuator.clone()),
            |_: &CaptureSettings| -> Result<Box<dyn FrameSource>, CaptureError> {
                Ok(Box::new(FakeSource::new(16, 16)) as Box<dyn FrameSource>)
            },
        );
        pipeline.run(shutdown).unwrap();
        watcher.join().unwrap();

        // Engage at start, then the shutdown stop; no stop in between.
        assert_eq!(
            link.sent(),
            vec![ConveyorCommand::Start, ConveyorCommand::Stop]
        );
        assert!(actuator.pulsed().len() >= 2);
    }

    #[test]
    fn unavailable_source_is_retried() {
        let opens = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let link = RecordingLink::default();

        let watcher = {
            let opens = opens.clone();
            stop_when(shutdown.clone(), move || opens.load(Ordering::SeqCst) >= 2)
        };

        let pipeline = Pipeline::new(
            settings(),
            Arc::new(ScriptedDetector::always(&["USB"])),
            inspector(DefectPolicy::Stop, link.clone(), RecordingActuator::default()),
            {
                let opens = opens.clone();
                move |settings: &CaptureSettings| -> Result<Box<dyn FrameSource>, CaptureError> {
                    opens.fetch_add(1, Ordering::SeqCst);
                    Err(CaptureError::Open {
                        uri: settings.source_uri.clone(),
                    })
                }
            },
        );
        let stats = pipeline.run(shutdown).unwrap();
        watcher.join().unwrap();

        assert!(opens.load(Ordering::SeqCst) >= 2);
        assert_eq!(stats.cycles, 0);
        assert_eq!(link.sent().first(), Some(&ConveyorCommand::Start));
        assert_eq!(link.sent().last(), Some(&ConveyorCommand::Stop));
    }

    #[test]
    fn actuator_failure_is_fatal() {
        let pipeline = Pipeline::new(
            settings(),
            Arc::new(ScriptedDetector::always(&["USB"])),
            inspector(
                DefectPolicy::Stop,
                RecordingLink::failing(),
                RecordingActuator::default(),
            ),
            |_: &CaptureSettings| -> Result<Box<dyn FrameSource>, CaptureError> {
                Ok(Box::new(FakeSource::new(8, 8)) as Box<dyn FrameSource>)
            },
        );
        assert!(pipeline.run(Arc::new(AtomicBool::new(false))).is_err());
    }
}
