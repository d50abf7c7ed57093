//! Opens the physical channels named by the configuration, or their dry-run
//! stand-ins.

use anyhow::{Context, Result};
use conveyor_io::{ConveyorLink, DryRunActuator, DryRunConveyor, RejectActuator, SerialConveyor};
use detector::RemoteDetector;
use inspection::{ConveyorSettings, DefectPolicy, DetectorSettings, ServoSettings};
use tracing::{debug, info, warn};

pub fn open_conveyor(settings: &ConveyorSettings) -> Result<Box<dyn ConveyorLink>> {
    if settings.dry_run {
        warn!("Dry run: conveyor commands are logged, not sent");
        return Ok(Box::new(DryRunConveyor::new(settings.dry_run_trigger)));
    }
    let link = SerialConveyor::open(&settings.serial_path, settings.baud_rate, settings.tokens)
        .with_context(|| {
            format!(
                "Failed to open conveyor controller on {}",
                settings.serial_path
            )
        })?;
    info!(
        port = %settings.serial_path,
        baud = settings.baud_rate,
        "Conveyor controller connected"
    );
    Ok(Box::new(link))
}

/// The servo is only claimed when the reject policy can pulse it.
pub fn open_actuator(
    settings: &ServoSettings,
    policy: DefectPolicy,
) -> Result<Box<dyn RejectActuator>> {
    if settings.dry_run {
        warn!("Dry run: reject pulses are logged, not driven");
        return Ok(Box::new(DryRunActuator::default()));
    }
    if policy != DefectPolicy::Reject {
        debug!(?policy, "Reject servo not needed");
        return Ok(Box::new(DryRunActuator::default()));
    }
    open_servo(settings)
}

#[cfg(feature = "rpi")]
fn open_servo(settings: &ServoSettings) -> Result<Box<dyn RejectActuator>> {
    let servo = conveyor_io::ServoActuator::open(settings.pin, settings.profile)
        .with_context(|| format!("Failed to claim reject servo on BCM {}", settings.pin))?;
    info!(pin = settings.pin, "Reject servo ready");
    Ok(Box::new(servo))
}

#[cfg(not(feature = "rpi"))]
fn open_servo(settings: &ServoSettings) -> Result<Box<dyn RejectActuator>> {
    anyhow::bail!(
        "Reject servo on BCM {} needs a build with `--features rpi`; pass --dry-run to log pulses instead",
        settings.pin
    )
}

pub fn connect_detector(settings: &DetectorSettings) -> Result<RemoteDetector> {
    let detector = RemoteDetector::new(settings.remote.clone())
        .context("Failed to build detection client")?
        .with_confidence_threshold(settings.min_confidence);
    info!(endpoint = detector.endpoint(), "Detection endpoint configured");
    Ok(detector)
}
