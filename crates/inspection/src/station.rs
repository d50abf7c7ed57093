//! Serial-triggered inspection station and dataset collector.
//!
//! The belt firmware stops each product under the camera and sends `0`. One
//! synchronous capture → infer → decide cycle follows. Under the stop policy a
//! defect keeps the belt halted and the product is re-inspected until it has
//! been taken off.

use std::{
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use conveyor_io::{ActuatorError, ControllerEvent, ConveyorCommand, ConveyorLink, RejectActuator};
use detector::Detect;
use tracing::{debug, info, warn};
use video_ingest::{FrameSource, Roi};

use crate::{
    capture::capture_frame,
    conveyor::ConveyorState,
    dispatcher::infer,
    flags::RunFlags,
    inspector::{CycleReport, CycleStats, Inspector},
    persistence::CycleRecorder,
};

/// Synchronous station driven by controller triggers.
pub struct Station<'a, L, A> {
    detector: &'a dyn Detect,
    source: &'a mut dyn FrameSource,
    inspector: Inspector<L, A>,
    crop: Option<Roi>,
    removal_retry_delay: Duration,
    next_sequence: u64,
}

impl<'a, L: ConveyorLink, A: RejectActuator> Station<'a, L, A> {
    pub fn new(
        detector: &'a dyn Detect,
        source: &'a mut dyn FrameSource,
        inspector: Inspector<L, A>,
    ) -> Self {
        Self {
            detector,
            source,
            inspector,
            crop: None,
            removal_retry_delay: Duration::from_secs(1),
            next_sequence: 0,
        }
    }

    pub fn with_crop(mut self, crop: Option<Roi>) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_removal_retry_delay(mut self, delay: Duration) -> Self {
        self.removal_retry_delay = delay;
        self
    }

    /// Serve triggers until shutdown, then leave the belt stopped.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<CycleStats, ActuatorError> {
        let flags = RunFlags::new(shutdown);
        let served = self.serve(&flags);
        let stats = self.inspector.stats();
        let cleanup = self.inspector.into_controller().shutdown();
        info!(
            cycles = stats.cycles,
            defective = stats.defective,
            "Inspection station stopped"
        );
        served.and(cleanup).map(|()| stats)
    }

    fn serve(&mut self, flags: &RunFlags) -> Result<(), ActuatorError> {
        self.inspector.controller_mut().engage()?;
        info!("Waiting for products");
        while flags.is_active() {
            match self.inspector.controller_mut().link_mut().poll_event()? {
                Some(ControllerEvent::ProductReady) => self.inspect_product(flags)?,
                Some(ControllerEvent::Other(byte)) => {
                    debug!("Ignoring controller byte {byte:#04x}");
                }
                None => {}
            }
        }
        Ok(())
    }

    /// One triggered product, including the wait for removal after a stop.
    fn inspect_product(&mut self, flags: &RunFlags) -> Result<(), ActuatorError> {
        info!("Product in position");
        match self.cycle()? {
            Some(report) => debug!(
                sequence = report.sequence,
                state_changed = report.transition.changed_state(),
                "cycle finished"
            ),
            None => {
                // Nothing decided; let the product pass instead of blocking the line.
                self.resume()?;
                return Ok(());
            }
        }

        if self.inspector.controller().state() == ConveyorState::Running {
            return Ok(());
        }

        info!("Waiting for the defective product to be removed");
        while flags.is_active() && self.inspector.controller().state() != ConveyorState::Running {
            if !flags.pause(self.removal_retry_delay) {
                break;
            }
            self.cycle()?;
        }
        Ok(())
    }

    /// Capture, infer and decide once. `None` when the tick was skipped.
    fn cycle(&mut self) -> Result<Option<CycleReport>, ActuatorError> {
        let frame = match capture_frame(&mut *self.source, self.crop) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Capture failed: {err}");
                return Ok(None);
            }
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let result = match tracing::info_span!("dispatch", sequence)
            .in_scope(|| infer(self.detector, sequence, frame))
        {
            Ok(result) => result,
            Err(err) => {
                warn!(sequence, kind = err.kind().label(), "Skipping inspection: {err}");
                return Ok(None);
            }
        };

        self.inspector.handle(&result).map(Some)
    }

    fn resume(&mut self) -> Result<(), ActuatorError> {
        if self.inspector.controller().state() == ConveyorState::Running {
            self.inspector
                .controller_mut()
                .link_mut()
                .send(ConveyorCommand::Start)?;
        }
        Ok(())
    }
}

/// Save one cropped image per trigger for building a training set.
pub fn run_collector(
    link: &mut dyn ConveyorLink,
    source: &mut dyn FrameSource,
    crop: Option<Roi>,
    recorder: &CycleRecorder,
    shutdown: Arc<AtomicBool>,
) -> Result<u64, ActuatorError> {
    let flags = RunFlags::new(shutdown);
    let mut saved: u64 = 0;
    info!("Collecting into {}", recorder.dir().display());
    while flags.is_active() {
        let Some(event) = link.poll_event()? else {
            continue;
        };
        if event != ControllerEvent::ProductReady {
            continue;
        }
        match capture_frame(&mut *source, crop) {
            Ok(frame) => match recorder.save_frame(&frame) {
                Ok(path) => {
                    saved += 1;
                    info!("Image saved to {}", path.display());
                }
                Err(err) => warn!("Failed to save image: {err}"),
            },
            Err(err) => warn!("Capture failed: {err}"),
        }
        link.send(ConveyorCommand::Start)?;
    }
    Ok(saved)
}
