use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use conveyor_io::{ConveyorLink, RejectActuator};
use detector::Detect;
use inspection::{
    CaptureSettings, ConveyorController, ConveyorSettings, CycleRecorder, CycleStats,
    DefectPolicy, DetectorSettings, ExpectedComposition, InspectionCliArgs, InspectionConfig,
    Inspector, NamingScheme, Pipeline, PipelineSettings, SavePolicy, Station, annotate,
    capture_frame, decide, encode_jpeg, infer, render_metrics, run_collector, shutdown_flag,
};
use tracing::{debug, info};
use video_ingest::{CaptureError, FrameSource, ImageReplaySource, Roi};

use crate::{
    cli::{ActuateArgs, CollectArgs, InspectArgs},
    hardware,
};

/// Product area the training images are cut to.
const COLLECT_CROP: Roi = Roi {
    x: 200,
    y: 100,
    width: 300,
    height: 300,
};

type BoxedInspector = Inspector<Box<dyn ConveyorLink>, Box<dyn RejectActuator>>;

pub fn run_pipeline(args: InspectionCliArgs) -> Result<()> {
    let config = InspectionConfig::try_from(args)?;
    info!(
        source = %config.capture.source_uri,
        composition = %config.composition,
        policy = ?config.controller.policy,
        "Starting continuous inspection"
    );
    let detector: Arc<dyn Detect> = Arc::new(hardware::connect_detector(&config.detector)?);
    let inspector = build_inspector(&config)?;
    let stats = Pipeline::new(
        PipelineSettings::from(&config),
        detector,
        inspector,
        open_capture_source,
    )
    .run(shutdown_flag())
    .context("Conveyor hardware failure")?;
    log_stats(stats);
    Ok(())
}

pub fn run_station(args: InspectionCliArgs) -> Result<()> {
    let mut config = InspectionConfig::try_from(args)?;
    // The firmware pauses on every product; each cycle has to restart it.
    config.controller.keep_alive = true;
    info!(
        source = %config.capture.source_uri,
        composition = %config.composition,
        policy = ?config.controller.policy,
        "Starting triggered inspection station"
    );
    let detector = hardware::connect_detector(&config.detector)?;
    let mut source = open_capture_source(&config.capture)
        .with_context(|| format!("Failed to open frame source {}", config.capture.source_uri))?;
    let inspector = build_inspector(&config)?;
    let stats = Station::new(&detector, &mut *source, inspector)
        .with_crop(config.capture.crop)
        .with_removal_retry_delay(config.removal_retry_delay)
        .run(shutdown_flag())
        .context("Conveyor hardware failure")?;
    log_stats(stats);
    Ok(())
}

pub fn run_collect(args: CollectArgs) -> Result<()> {
    let crop = match (args.full_frame, args.source.crop) {
        (true, _) => None,
        (false, crop) => Some(crop.unwrap_or(COLLECT_CROP)),
    };
    let capture = CaptureSettings::try_from(args.source)?;
    let conveyor = ConveyorSettings::try_from(args.conveyor)?;
    let recorder = CycleRecorder::new(args.dataset_dir, NamingScheme::Counter)
        .context("Failed to prepare dataset directory")?;

    let mut link = hardware::open_conveyor(&conveyor)?;
    let mut source = open_capture_source(&capture)
        .with_context(|| format!("Failed to open frame source {}", capture.source_uri))?;
    let saved = run_collector(&mut *link, &mut *source, crop, &recorder, shutdown_flag())
        .context("Conveyor controller failure")?;
    info!(saved, "Collection finished");
    Ok(())
}

pub fn run_inspect(args: InspectArgs) -> Result<()> {
    if !(1..=100).contains(&args.jpeg_quality) {
        anyhow::bail!("--jpeg-quality must be an integer between 1 and 100");
    }
    let settings = DetectorSettings::try_from(args.detector)?;
    let composition = ExpectedComposition::try_from(args.composition)?;
    let detector = hardware::connect_detector(&settings)?;

    let mut source = ImageReplaySource::open(&args.image)
        .with_context(|| format!("Failed to read {}", args.image.display()))?;
    let frame = capture_frame(&mut source, args.crop)?;
    let result = infer(&detector, 0, frame)?;
    let verdict = decide(&result, &composition);
    println!("{}", serde_json::to_string_pretty(&verdict)?);

    if let Some(path) = args.annotated {
        let image = annotate(&result.frame, &verdict)?;
        let jpeg = encode_jpeg(&image, args.jpeg_quality)?;
        fs::write(&path, jpeg)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Annotated image written to {}", path.display());
    }
    Ok(())
}

pub fn run_actuate(args: ActuateArgs) -> Result<()> {
    let settings = args.servo.into_settings(args.dry_run)?;
    let mut actuator = hardware::open_actuator(&settings, DefectPolicy::Reject)?;
    info!(direction = %args.direction, pin = settings.pin, "Pulsing reject servo");
    let pulsed = actuator.pulse(args.direction);
    let released = actuator.release();
    pulsed.and(released).context("Reject servo failure")?;
    Ok(())
}

fn build_inspector(config: &InspectionConfig) -> Result<BoxedInspector> {
    let link = hardware::open_conveyor(&config.conveyor)?;
    let actuator = hardware::open_actuator(&config.servo, config.controller.policy)?;
    let controller = ConveyorController::new(link, actuator, config.controller);
    let inspector = Inspector::new(config.composition.clone(), controller);
    if config.output.save == SavePolicy::Never {
        return Ok(inspector);
    }
    let recorder = CycleRecorder::new(config.output.save_dir.clone(), config.output.naming)
        .with_context(|| {
            format!(
                "Failed to prepare output directory {}",
                config.output.save_dir.display()
            )
        })?
        .with_jpeg_quality(config.output.jpeg_quality);
    Ok(inspector.with_recorder(recorder, config.output.save))
}

fn open_capture_source(settings: &CaptureSettings) -> Result<Box<dyn FrameSource>, CaptureError> {
    video_ingest::open_source(&settings.source_uri, settings.camera)
}

fn log_stats(stats: CycleStats) {
    info!(
        cycles = stats.cycles,
        compliant = stats.compliant,
        defective = stats.defective,
        no_detection = stats.no_detection,
        "Inspection finished"
    );
    if let Some(metrics) = render_metrics() {
        debug!("Final metrics:\n{metrics}");
    }
}
