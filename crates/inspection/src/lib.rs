//! Product inspection for a conveyor line: frames are captured, sent to a
//! remote detector, checked against the expected composition and the belt is
//! driven from the verdict.
//!
//! The crate is split into focused modules:
//! - `capture`: camera loop publishing into the shared [`FrameSlot`].
//! - `dispatcher`: remote inference ticks feeding the ordered result queue.
//! - `compliance`: expected composition and the verdict rules.
//! - `conveyor`: belt state machine and defect policies.
//! - `inspector`: decide → act → record step shared by both run modes.
//! - `pipeline`: threaded supervisor with watchdog-driven restarts.
//! - `station`: serial-triggered synchronous mode and dataset collector.
//! - `annotation` / `persistence`: annotated evidence written to disk.
//! - `config` / `telemetry`: CLI settings, tracing and metrics setup.

pub use annotation::{annotate, class_color, encode_jpeg};
pub use capture::capture_frame;
pub use compliance::{
    ComplianceVerdict, CompositionError, CompositionMode, ExpectedComposition, PartSpec,
    VerdictStatus, decide,
};
pub use config::{
    CaptureSettings, CompositionArgs, ConveyorArgs, ConveyorSettings, DetectorArgs,
    DetectorSettings, DispatchSettings, InspectionCliArgs, InspectionConfig, OutputArgs,
    OutputSettings, PolicyArgs, RuntimeArgs, SavePolicy, ServoArgs, ServoSettings, SourceArgs,
    TelemetryArgs, TelemetryOptions, WatchdogSettings,
};
pub use conveyor::{ControllerOptions, ConveyorController, ConveyorState, DefectPolicy, Transition};
pub use data::InferenceResult;
pub use dispatcher::{Dispatcher, TickOutcome, infer};
pub use error::{ErrorKind, InspectionError};
pub use inspector::{CycleReport, CycleStats, Inspector};
pub use persistence::{CycleRecorder, NamingScheme, PersistError};
pub use pipeline::{Pipeline, PipelineSettings, shutdown_flag};
pub use slot::FrameSlot;
pub use station::{Station, run_collector};
pub use telemetry::{TelemetryGuard, enter_runtime, init_metrics, render_metrics};

mod annotation;
mod capture;
mod compliance;
mod config;
mod conveyor;
mod data;
mod dispatcher;
mod error;
mod flags;
mod inspector;
mod persistence;
mod pipeline;
mod slot;
mod station;
mod telemetry;
mod watchdog;

#[cfg(test)]
mod testing;
