use std::io;

use thiserror::Error;

/// Failure talking to conveyor or actuator hardware.
///
/// Once a write has failed the physical state of the line is unknown, so
/// callers treat every variant as fatal for the control loop.
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("failed to open conveyor link {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("{channel} channel I/O failed: {source}")]
    Io {
        channel: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("GPIO pin {pin}: {message}")]
    Gpio { pin: u8, message: String },
}
