//! Decision and actuation step shared by the threaded pipeline and the
//! triggered station: decide, report, act, record.

use std::path::PathBuf;

use conveyor_io::{ActuatorError, ConveyorLink, RejectActuator};
use tracing::{info, warn};

use crate::{
    annotation::{annotate, encode_jpeg},
    compliance::{ComplianceVerdict, ExpectedComposition, VerdictStatus, decide},
    config::SavePolicy,
    conveyor::{ConveyorController, Transition},
    data::InferenceResult,
    persistence::{CycleRecorder, PersistError},
};

/// Outcome of one inspected product.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub sequence: u64,
    pub verdict: ComplianceVerdict,
    pub transition: Transition,
    pub saved: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub compliant: u64,
    pub defective: u64,
    pub no_detection: u64,
}

impl CycleStats {
    fn record(&mut self, status: VerdictStatus) {
        self.cycles += 1;
        match status {
            VerdictStatus::Compliant => self.compliant += 1,
            VerdictStatus::Defective => self.defective += 1,
            VerdictStatus::NoDetection => self.no_detection += 1,
        }
    }
}

pub struct Inspector<L, A> {
    composition: ExpectedComposition,
    controller: ConveyorController<L, A>,
    recorder: Option<(CycleRecorder, SavePolicy)>,
    stats: CycleStats,
}

impl<L: ConveyorLink, A: RejectActuator> Inspector<L, A> {
    pub fn new(composition: ExpectedComposition, controller: ConveyorController<L, A>) -> Self {
        Self {
            composition,
            controller,
            recorder: None,
            stats: CycleStats::default(),
        }
    }

    pub fn with_recorder(mut self, recorder: CycleRecorder, policy: SavePolicy) -> Self {
        if policy != SavePolicy::Never {
            self.recorder = Some((recorder, policy));
        }
        self
    }

    pub fn controller(&self) -> &ConveyorController<L, A> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ConveyorController<L, A> {
        &mut self.controller
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    pub fn into_controller(self) -> ConveyorController<L, A> {
        self.controller
    }

    /// Decide on one result and drive the conveyor accordingly.
    ///
    /// Only hardware failures are returned; a failed save is logged.
    pub fn handle(&mut self, result: &InferenceResult) -> Result<CycleReport, ActuatorError> {
        let _span = tracing::info_span!("decide", sequence = result.sequence).entered();

        let verdict = decide(result, &self.composition);
        self.stats.record(verdict.status);
        metrics::counter!("inspect_verdicts_total", "status" => verdict.status.label())
            .increment(1);
        match verdict.status {
            VerdictStatus::Compliant => info!(
                sequence = result.sequence,
                observed = ?verdict.observed_counts,
                "Product compliant"
            ),
            VerdictStatus::Defective => warn!(
                sequence = result.sequence,
                observed = ?verdict.observed_counts,
                "Product defective: {}",
                verdict.missing_or_excess.join(", ")
            ),
            VerdictStatus::NoDetection => warn!(
                sequence = result.sequence,
                malformed = result.malformed,
                "No detections in frame"
            ),
        }

        let transition = {
            let _span = tracing::info_span!("conveyor", state = %self.controller.state()).entered();
            self.controller.apply(verdict.status)?
        };

        let saved = match self.record(result, &verdict) {
            Ok(path) => path,
            Err(err) => {
                warn!("Failed to save cycle image: {err}");
                None
            }
        };

        Ok(CycleReport {
            sequence: result.sequence,
            verdict,
            transition,
            saved,
        })
    }

    fn record(
        &self,
        result: &InferenceResult,
        verdict: &ComplianceVerdict,
    ) -> Result<Option<PathBuf>, PersistError> {
        let Some((recorder, policy)) = &self.recorder else {
            return Ok(None);
        };
        if *policy == SavePolicy::Failures && verdict.status == VerdictStatus::Compliant {
            return Ok(None);
        }
        let image =
            annotate(&result.frame, verdict).map_err(|err| PersistError::Encode(err.to_string()))?;
        let jpeg = encode_jpeg(&image, recorder.jpeg_quality())
            .map_err(|err| PersistError::Encode(err.to_string()))?;
        let path = recorder.save_jpeg(&jpeg)?;
        info!("Saved {}", path.display());
        Ok(Some(path))
    }
}
