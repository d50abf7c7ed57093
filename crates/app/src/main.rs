mod cli;
mod commands;
mod hardware;

use clap::Parser;
use inspection::{TelemetryOptions, enter_runtime, init_metrics};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let telemetry = TelemetryOptions::from(cli.telemetry);
    let _telemetry_guard = enter_runtime(&telemetry);
    init_metrics(telemetry.metrics_addr)?;
    cli::handle_command(cli.command)
}
