use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use conveyor_io::Direction;
use inspection::{
    CompositionArgs, ConveyorArgs, DetectorArgs, InspectionCliArgs, ServoArgs, SourceArgs,
    TelemetryArgs,
};
use video_ingest::Roi;

use crate::commands;

#[derive(Debug, Parser)]
#[command(
    name = "conveyor-inspect",
    version,
    about = "Checks products on a conveyor belt against their expected parts."
)]
pub struct Cli {
    #[command(flatten)]
    pub telemetry: TelemetryArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Capture continuously and inspect the freshest frame every poll interval.
    Run(InspectionCliArgs),
    /// Inspect once per product-ready trigger from the conveyor controller.
    Station(InspectionCliArgs),
    /// Save one cropped image per trigger to build a training set.
    Collect(CollectArgs),
    /// Inspect a single image file and print the verdict as JSON.
    Inspect(InspectArgs),
    /// Drive the reject servo through one pulse.
    Actuate(ActuateArgs),
}

#[derive(Debug, Args)]
pub struct CollectArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    #[command(flatten)]
    pub conveyor: ConveyorArgs,
    /// Directory receiving `image_N.jpg` files and `counter.txt`.
    #[arg(long = "dataset-dir", value_name = "DIR", default_value = "dataset")]
    pub dataset_dir: PathBuf,
    /// Keep the whole frame instead of cropping to the product area.
    #[arg(long = "full-frame", action = ArgAction::SetTrue, conflicts_with = "crop")]
    pub full_frame: bool,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Image file to inspect.
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,
    #[command(flatten)]
    pub detector: DetectorArgs,
    #[command(flatten)]
    pub composition: CompositionArgs,
    /// Crop the image to `x,y,width,height` first.
    #[arg(long = "crop", value_name = "X,Y,W,H")]
    pub crop: Option<Roi>,
    /// Write the annotated image to this path.
    #[arg(long = "annotated", value_name = "PATH")]
    pub annotated: Option<PathBuf>,
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 90)]
    pub jpeg_quality: u8,
}

#[derive(Debug, Args)]
pub struct ActuateArgs {
    #[command(flatten)]
    pub servo: ServoArgs,
    /// Servo direction to pulse.
    #[arg(value_name = "DIRECTION", value_enum, default_value_t = Direction::Backward)]
    pub direction: Direction,
    /// Log the pulse instead of driving the pin.
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    pub dry_run: bool,
}

pub fn handle_command(command: Command) -> Result<()> {
    match command {
        Command::Run(args) => commands::run_pipeline(args),
        Command::Station(args) => commands::run_station(args),
        Command::Collect(args) => commands::run_collect(args),
        Command::Inspect(args) => commands::run_inspect(args),
        Command::Actuate(args) => commands::run_actuate(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_defaults_to_dataset_dir() {
        let cli = Cli::try_parse_from(["conveyor-inspect", "collect", "--dry-run"]).unwrap();
        let Command::Collect(args) = cli.command else {
            panic!("expected collect");
        };
        assert_eq!(args.dataset_dir, PathBuf::from("dataset"));
        assert!(args.source.crop.is_none());
        assert!(!args.full_frame);
    }

    #[test]
    fn telemetry_flags_are_global() {
        let cli = Cli::try_parse_from([
            "conveyor-inspect",
            "actuate",
            "forward",
            "--dry-run",
            "--metrics-addr",
            "127.0.0.1:9000",
        ])
        .unwrap();
        assert!(cli.telemetry.metrics_addr.is_some());
        let Command::Actuate(args) = cli.command else {
            panic!("expected actuate");
        };
        assert_eq!(args.direction, Direction::Forward);
    }

    #[test]
    fn inspect_requires_an_image() {
        assert!(Cli::try_parse_from(["conveyor-inspect", "inspect"]).is_err());
    }
}
