//! Configuration for the inspection station.
//!
//! clap argument groups are translated once into validated settings structs;
//! downstream stages never look at raw flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, ValueEnum};
use conveyor_io::{Direction, PulseProfile, TokenConvention};
use detector::RemoteDetectorConfig;
use video_ingest::{CameraOptions, Roi};

use crate::{
    compliance::{CompositionMode, ExpectedComposition, PartSpec},
    conveyor::{ControllerOptions, DefectPolicy},
    persistence::NamingScheme,
};

/// Which cycles are written to disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SavePolicy {
    #[default]
    Every,
    /// Only defective and no-detection cycles.
    Failures,
    Never,
}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Camera index, device path, stream URL, or an image file/directory.
    pub source_uri: String,
    pub camera: CameraOptions,
    /// Pause between successful reads.
    pub interval: Duration,
    /// Pause after a failed read before the device is tried again.
    pub retry_delay: Duration,
    pub crop: Option<Roi>,
}

#[derive(Clone, Debug)]
pub struct DetectorSettings {
    pub remote: RemoteDetectorConfig,
    pub min_confidence: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    /// Bound on queued results; `None` keeps the queue unbounded.
    pub queue_capacity: Option<usize>,
}

#[derive(Clone, Copy, Debug)]
pub struct WatchdogSettings {
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub startup_grace: Duration,
}

#[derive(Clone, Debug)]
pub struct ConveyorSettings {
    pub serial_path: String,
    pub baud_rate: u32,
    pub tokens: TokenConvention,
    /// Log conveyor commands instead of opening the serial port.
    pub dry_run: bool,
    /// In dry-run mode, fake a product-ready trigger at this interval.
    pub dry_run_trigger: Option<Duration>,
}

#[derive(Clone, Copy, Debug)]
pub struct ServoSettings {
    pub pin: u8,
    pub profile: PulseProfile,
    pub dry_run: bool,
}

#[derive(Clone, Debug)]
pub struct OutputSettings {
    pub save_dir: PathBuf,
    pub naming: NamingScheme,
    pub save: SavePolicy,
    pub jpeg_quality: u8,
}

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

/// Everything the `run` and `station` modes need.
#[derive(Clone, Debug)]
pub struct InspectionConfig {
    pub capture: CaptureSettings,
    pub detector: DetectorSettings,
    pub composition: ExpectedComposition,
    pub controller: ControllerOptions,
    pub dispatch: DispatchSettings,
    pub watchdog: WatchdogSettings,
    pub conveyor: ConveyorSettings,
    pub servo: ServoSettings,
    pub output: OutputSettings,
    /// Pause between re-inspections while waiting for a defect to be removed.
    pub removal_retry_delay: Duration,
}

#[derive(Debug, Args)]
pub struct SourceArgs {
    /// Camera index, device path, stream URL, or image file/directory to replay.
    #[arg(long = "source", value_name = "URI", default_value = "0")]
    pub source: String,
    /// Requested capture width in pixels.
    #[arg(long = "width", value_name = "PX", requires = "height")]
    pub width: Option<i32>,
    /// Requested capture height in pixels.
    #[arg(long = "height", value_name = "PX", requires = "width")]
    pub height: Option<i32>,
    /// Milliseconds between captures.
    #[arg(long = "capture-interval-ms", value_name = "MS", default_value_t = 30)]
    pub capture_interval_ms: u64,
    /// Milliseconds to wait after a failed capture.
    #[arg(long = "capture-retry-ms", value_name = "MS", default_value_t = 500)]
    pub capture_retry_ms: u64,
    /// Crop every frame to `x,y,width,height` before inspection.
    #[arg(long = "crop", value_name = "X,Y,W,H")]
    pub crop: Option<Roi>,
    /// Open and close the camera around every capture.
    #[arg(long = "release-camera", action = ArgAction::SetTrue)]
    pub release_camera: bool,
}

#[derive(Debug, Args)]
pub struct DetectorArgs {
    /// Detection endpoint URL.
    #[arg(long = "api-url", env = "INSPECT_API_URL", value_name = "URL")]
    pub api_url: Option<String>,
    /// Team name used as the basic-auth user.
    #[arg(long = "team", env = "INSPECT_TEAM", value_name = "NAME")]
    pub team: Option<String>,
    /// Access key used as the basic-auth password.
    #[arg(
        long = "access-key",
        env = "INSPECT_ACCESS_KEY",
        value_name = "KEY",
        hide_env_values = true
    )]
    pub access_key: Option<String>,
    /// Detector input width.
    #[arg(long = "input-width", value_name = "PX", default_value_t = 700)]
    pub input_width: u32,
    /// Detector input height.
    #[arg(long = "input-height", value_name = "PX", default_value_t = 700)]
    pub input_height: u32,
    /// JPEG quality of the uploaded image (1-100).
    #[arg(long = "upload-quality", value_name = "QUALITY", default_value_t = 90)]
    pub upload_quality: u8,
    /// Discard detections scoring below this confidence.
    #[arg(long = "min-confidence", value_name = "SCORE", default_value_t = 0.0)]
    pub min_confidence: f32,
    /// Seconds before a detection request is abandoned.
    #[arg(long = "request-timeout-secs", value_name = "SECS", default_value_t = 10.0)]
    pub request_timeout_secs: f64,
}

#[derive(Debug, Args)]
pub struct CompositionArgs {
    /// JSON file with `mode` and `parts`.
    #[arg(long = "composition", value_name = "PATH", conflicts_with = "expect")]
    pub composition: Option<PathBuf>,
    /// Expected part as `LABEL` or `LABEL=COUNT`; repeatable.
    #[arg(long = "expect", value_name = "LABEL[=COUNT]")]
    pub expect: Vec<PartSpec>,
    /// How counts given with `--expect` are compared.
    #[arg(long = "mode", value_enum, default_value_t = CompositionMode::Presence)]
    pub mode: CompositionMode,
}

#[derive(Debug, Args)]
pub struct ConveyorArgs {
    /// Serial device of the conveyor controller.
    #[arg(long = "serial", value_name = "PATH", default_value = "/dev/ttyACM0")]
    pub serial: String,
    #[arg(long = "baud", value_name = "RATE", default_value_t = 9600)]
    pub baud: u32,
    /// Command encoding expected by the controller firmware.
    #[arg(long = "tokens", value_enum, default_value_t = TokenConvention::Byte)]
    pub tokens: TokenConvention,
    /// Log hardware commands instead of driving the serial port and servo.
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    pub dry_run: bool,
    /// With --dry-run, emit a product-ready trigger every N milliseconds.
    #[arg(long = "dry-run-trigger-ms", value_name = "MS", requires = "dry_run")]
    pub dry_run_trigger_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ServoArgs {
    /// BCM pin number of the reject servo.
    #[arg(long = "servo-pin", value_name = "BCM", default_value_t = 17)]
    pub servo_pin: u8,
    #[arg(long = "servo-frequency", value_name = "HZ", default_value_t = 50.0)]
    pub servo_frequency: f64,
    /// Duty cycle percentage for forward rotation.
    #[arg(long = "forward-duty", value_name = "PERCENT", default_value_t = 7.5)]
    pub forward_duty: f64,
    /// Duty cycle percentage for backward rotation.
    #[arg(long = "backward-duty", value_name = "PERCENT", default_value_t = 5.5)]
    pub backward_duty: f64,
    /// Seconds the servo is driven per reject pulse.
    #[arg(long = "pulse-secs", value_name = "SECS", default_value_t = 2.0)]
    pub pulse_secs: f64,
}

#[derive(Debug, Args)]
pub struct PolicyArgs {
    /// Reaction to a defective product.
    #[arg(long = "on-defect", value_enum, default_value_t = DefectPolicy::Stop)]
    pub on_defect: DefectPolicy,
    /// Servo direction used by the reject policy.
    #[arg(long = "reject-direction", value_enum, default_value_t = Direction::Backward)]
    pub reject_direction: Direction,
    /// Send START after every cycle that leaves the belt running.
    #[arg(long = "keep-alive", action = ArgAction::SetTrue)]
    pub keep_alive: bool,
    /// Milliseconds between re-inspections while waiting for removal.
    #[arg(long = "removal-retry-ms", value_name = "MS", default_value_t = 1_000)]
    pub removal_retry_ms: u64,
}

#[derive(Debug, Args)]
pub struct OutputArgs {
    /// Directory for annotated cycle images.
    #[arg(long = "save-dir", value_name = "DIR", default_value = "detected_images")]
    pub save_dir: PathBuf,
    #[arg(long = "naming", value_enum, default_value_t = NamingScheme::Timestamp)]
    pub naming: NamingScheme,
    /// Which cycles are saved.
    #[arg(long = "save", value_enum, default_value_t = SavePolicy::Every)]
    pub save: SavePolicy,
    /// JPEG quality of saved images (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 90)]
    pub jpeg_quality: u8,
}

#[derive(Debug, Args)]
pub struct RuntimeArgs {
    /// Milliseconds between inference ticks.
    #[arg(long = "poll-interval-ms", value_name = "MS", default_value_t = 500)]
    pub poll_interval_ms: u64,
    /// Bound the result queue; unbounded when omitted.
    #[arg(long = "queue-capacity", value_name = "N")]
    pub queue_capacity: Option<usize>,
    /// Milliseconds a loop may stay silent before the pipeline restarts.
    #[arg(long = "watchdog-stale-ms", value_name = "MS")]
    pub watchdog_stale_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct TelemetryArgs {
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH", global = true)]
    pub chrome_trace: Option<PathBuf>,
    /// Serve Prometheus metrics on this address, e.g. 0.0.0.0:9000.
    #[arg(long = "metrics-addr", value_name = "ADDR", global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

/// CLI arguments accepted by the `run` and `station` subcommands.
#[derive(Debug, Args)]
pub struct InspectionCliArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    #[command(flatten)]
    pub detector: DetectorArgs,
    #[command(flatten)]
    pub composition: CompositionArgs,
    #[command(flatten)]
    pub conveyor: ConveyorArgs,
    #[command(flatten)]
    pub servo: ServoArgs,
    #[command(flatten)]
    pub policy: PolicyArgs,
    #[command(flatten)]
    pub output: OutputArgs,
    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

impl TryFrom<SourceArgs> for CaptureSettings {
    type Error = anyhow::Error;

    fn try_from(args: SourceArgs) -> Result<Self> {
        let target_size = match (args.width, args.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            (None, None) => None,
            _ => bail!("Capture width and height must be positive integers"),
        };
        if args.capture_interval_ms == 0 {
            bail!("--capture-interval-ms must be at least 1");
        }
        if args.capture_retry_ms == 0 {
            bail!("--capture-retry-ms must be at least 1");
        }
        Ok(Self {
            source_uri: args.source,
            camera: CameraOptions {
                target_size,
                release_after_capture: args.release_camera,
            },
            interval: Duration::from_millis(args.capture_interval_ms),
            retry_delay: Duration::from_millis(args.capture_retry_ms),
            crop: args.crop,
        })
    }
}

impl TryFrom<DetectorArgs> for DetectorSettings {
    type Error = anyhow::Error;

    fn try_from(args: DetectorArgs) -> Result<Self> {
        let endpoint = args.api_url.ok_or_else(|| {
            anyhow!("Missing detection endpoint. Provide --api-url or set INSPECT_API_URL.")
        })?;
        let team = args
            .team
            .ok_or_else(|| anyhow!("Missing team name. Provide --team or set INSPECT_TEAM."))?;
        let access_key = args.access_key.ok_or_else(|| {
            anyhow!("Missing access key. Provide --access-key or set INSPECT_ACCESS_KEY.")
        })?;
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            bail!("--api-url must be an http(s) URL, got {endpoint:?}");
        }
        if args.input_width == 0 || args.input_height == 0 {
            bail!("Detector input dimensions must be positive integers");
        }
        if !(1..=100).contains(&args.upload_quality) {
            bail!("--upload-quality must be an integer between 1 and 100");
        }
        if !(0.0..=1.0).contains(&args.min_confidence) {
            bail!("--min-confidence must lie between 0 and 1");
        }
        let timeout = Duration::try_from_secs_f64(args.request_timeout_secs)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .ok_or_else(|| anyhow!("--request-timeout-secs must be a positive number"))?;

        Ok(Self {
            remote: RemoteDetectorConfig {
                endpoint,
                team,
                access_key,
                input_size: (args.input_width, args.input_height),
                jpeg_quality: args.upload_quality,
                timeout,
            },
            min_confidence: args.min_confidence,
        })
    }
}

impl TryFrom<CompositionArgs> for ExpectedComposition {
    type Error = anyhow::Error;

    fn try_from(args: CompositionArgs) -> Result<Self> {
        if let Some(path) = args.composition {
            return ExpectedComposition::from_json_file(&path)
                .with_context(|| format!("Invalid composition file {}", path.display()));
        }
        if args.expect.is_empty() {
            bail!("Missing expected composition. Provide --composition <path> or --expect LABEL=COUNT.");
        }
        ExpectedComposition::from_specs(args.mode, &args.expect)
            .context("Invalid --expect composition")
    }
}

impl TryFrom<ConveyorArgs> for ConveyorSettings {
    type Error = anyhow::Error;

    fn try_from(args: ConveyorArgs) -> Result<Self> {
        if args.baud == 0 {
            bail!("--baud must be positive");
        }
        let dry_run_trigger = match args.dry_run_trigger_ms {
            Some(0) => bail!("--dry-run-trigger-ms must be at least 1"),
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };
        Ok(Self {
            serial_path: args.serial,
            baud_rate: args.baud,
            tokens: args.tokens,
            dry_run: args.dry_run,
            dry_run_trigger,
        })
    }
}

impl ServoArgs {
    pub fn into_settings(self, dry_run: bool) -> Result<ServoSettings> {
        if self.servo_frequency <= 0.0 {
            bail!("--servo-frequency must be positive");
        }
        for (flag, duty) in [
            ("--forward-duty", self.forward_duty),
            ("--backward-duty", self.backward_duty),
        ] {
            if !(0.0..=100.0).contains(&duty) {
                bail!("{flag} must be a percentage between 0 and 100");
            }
        }
        let duration = Duration::try_from_secs_f64(self.pulse_secs)
            .map_err(|_| anyhow!("--pulse-secs must be a non-negative number"))?;
        Ok(ServoSettings {
            pin: self.servo_pin,
            profile: PulseProfile {
                frequency_hz: self.servo_frequency,
                forward_duty: self.forward_duty,
                backward_duty: self.backward_duty,
                duration,
            },
            dry_run,
        })
    }
}

impl TryFrom<OutputArgs> for OutputSettings {
    type Error = anyhow::Error;

    fn try_from(args: OutputArgs) -> Result<Self> {
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        Ok(Self {
            save_dir: args.save_dir,
            naming: args.naming,
            save: args.save,
            jpeg_quality: args.jpeg_quality,
        })
    }
}

impl From<TelemetryArgs> for TelemetryOptions {
    fn from(args: TelemetryArgs) -> Self {
        Self {
            chrome_trace_path: args.chrome_trace,
            metrics_addr: args.metrics_addr,
        }
    }
}

impl TryFrom<InspectionCliArgs> for InspectionConfig {
    type Error = anyhow::Error;

    fn try_from(args: InspectionCliArgs) -> Result<Self> {
        let capture = CaptureSettings::try_from(args.source)?;
        let detector = DetectorSettings::try_from(args.detector)?;
        let composition = ExpectedComposition::try_from(args.composition)?;
        let conveyor = ConveyorSettings::try_from(args.conveyor)?;
        let servo = args.servo.into_settings(conveyor.dry_run)?;
        let output = OutputSettings::try_from(args.output)?;

        if args.runtime.poll_interval_ms == 0 {
            bail!("--poll-interval-ms must be at least 1");
        }
        if args.runtime.queue_capacity == Some(0) {
            bail!("--queue-capacity must be at least 1");
        }
        let poll_interval = Duration::from_millis(args.runtime.poll_interval_ms);

        // A dispatch tick legitimately lasts a poll interval plus one full request.
        let minimum_stale = poll_interval + detector.remote.timeout + Duration::from_secs(2);
        let stale_after = match args.runtime.watchdog_stale_ms {
            Some(ms) if Duration::from_millis(ms) < minimum_stale => bail!(
                "--watchdog-stale-ms must be at least {} (poll interval + request timeout + 2s)",
                minimum_stale.as_millis()
            ),
            Some(ms) => Duration::from_millis(ms),
            None => minimum_stale.max(capture.retry_delay * 4),
        };

        Ok(Self {
            capture,
            detector,
            composition,
            controller: ControllerOptions {
                policy: args.policy.on_defect,
                reject_direction: args.policy.reject_direction,
                keep_alive: args.policy.keep_alive,
            },
            dispatch: DispatchSettings {
                poll_interval,
                queue_capacity: args.runtime.queue_capacity,
            },
            watchdog: WatchdogSettings {
                poll_interval: Duration::from_millis(500),
                stale_after,
                startup_grace: Duration::from_secs(5),
            },
            conveyor,
            servo,
            output,
            removal_retry_delay: Duration::from_millis(args.policy.removal_retry_ms),
        })
    }
}
