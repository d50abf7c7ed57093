use std::{sync::Arc, thread, time::Instant};

use tracing::{debug, warn};
use video_ingest::{CaptureError, Frame, FrameSource, Roi};

use crate::{
    config::CaptureSettings,
    flags::RunFlags,
    slot::FrameSlot,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Read one frame and apply the optional crop.
pub fn capture_frame<S>(source: &mut S, crop: Option<Roi>) -> Result<Frame, CaptureError>
where
    S: FrameSource + ?Sized,
{
    let started = Instant::now();
    let frame = source.capture().and_then(|frame| match crop {
        Some(roi) => frame.crop(roi),
        None => Ok(frame),
    });
    match &frame {
        Ok(_) => {
            metrics::counter!("inspect_frames_captured_total").increment(1);
            metrics::histogram!("inspect_stage_latency_seconds", "stage" => "capture")
                .record(started.elapsed().as_secs_f64());
        }
        Err(_) => metrics::counter!("inspect_capture_failures_total").increment(1),
    }
    frame
}

/// Keep the slot filled with the freshest frame until the pipeline stops.
pub(crate) fn spawn_capture_worker(
    mut source: Box<dyn FrameSource>,
    slot: FrameSlot,
    settings: CaptureSettings,
    health: Arc<PipelineHealth>,
    flags: RunFlags,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("inspect-capture", move || {
        let description = source.describe();
        debug!("Capture loop started on {description}");
        let mut consecutive_failures: u32 = 0;
        while flags.is_active() {
            health.beat(HealthComponent::Capture);
            let result = tracing::info_span!("capture").in_scope(|| {
                capture_frame(&mut source, settings.crop)
            });
            let delay = match result {
                Ok(frame) => {
                    if consecutive_failures > 0 {
                        debug!("{description} recovered after {consecutive_failures} failed reads");
                    }
                    consecutive_failures = 0;
                    slot.publish(frame);
                    settings.interval
                }
                Err(err) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(
                        failures = consecutive_failures,
                        "Capture failed on {description}: {err}"
                    );
                    settings.retry_delay
                }
            };
            if !flags.pause(delay) {
                break;
            }
        }
        debug!("Capture loop stopped");
    })
    .expect("failed to spawn capture thread")
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use video_ingest::CameraOptions;

    use super::*;
    use crate::{config::WatchdogSettings, testing::FakeSource};

    #[test]
    fn crop_is_applied_to_captured_frames() {
        let mut source = FakeSource::new(640, 480);
        let roi = Roi {
            x: 200,
            y: 100,
            width: 300,
            height: 300,
        };
        let frame = capture_frame(&mut source, Some(roi)).unwrap();
        assert_eq!((frame.width, frame.height), (300, 300));
    }

    #[test]
    fn worker_survives_failed_reads_and_fills_slot() {
        let mut source = FakeSource::new(8, 8);
        source.fail_on = vec![0, 1];
        let captures = source.captures.clone();
        let slot = FrameSlot::new();
        let flags = RunFlags::new(Arc::new(AtomicBool::new(false)));
        let settings = CaptureSettings {
            source_uri: "fake".into(),
            camera: CameraOptions::default(),
            interval: Duration::from_millis(1),
            retry_delay: Duration::from_millis(5),
            crop: None,
        };
        let health = Arc::new(PipelineHealth::new(&WatchdogSettings {
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::from_secs(5),
            startup_grace: Duration::from_secs(5),
        }));

        let handle = spawn_capture_worker(
            Box::new(source),
            slot.clone(),
            settings,
            health,
            flags.clone(),
        );
        while captures.load(Ordering::SeqCst) < 5 {
            thread::sleep(Duration::from_millis(1));
        }
        flags.stop();
        handle.join().unwrap();

        let frame = slot.latest().expect("frame published after failures");
        assert!(frame.timestamp_ms >= 2);
    }
}
