//! Conveyor controller channel.
//!
//! Half-duplex byte link to the belt firmware. Outbound we only ever send
//! STOP or START; inbound `0` means a product is positioned under the camera.

use std::{
    fmt,
    io::{self, ErrorKind, Read, Write},
    thread,
    time::{Duration, Instant},
};

use clap::ValueEnum;
use serialport::SerialPort;
use tracing::{debug, info};

use crate::error::ActuatorError;

/// Read timeout used when polling the serial port for controller events.
pub const SERIAL_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConveyorCommand {
    Start,
    Stop,
}

impl fmt::Display for ConveyorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConveyorCommand::Start => f.write_str("START"),
            ConveyorCommand::Stop => f.write_str("STOP"),
        }
    }
}

/// Wire encoding the controller firmware expects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TokenConvention {
    /// One ASCII digit: `1` starts the belt, `0` stops it.
    ///
    /// Only `1` is confirmed by the deployed firmware. The `0` stop byte is
    /// assumed controller behaviour and is the same byte the controller
    /// sends upstream as "product ready". Use `Text` when the firmware does
    /// not act on it.
    #[default]
    Byte,
    /// Newline-terminated words: `START\n`, `STOP\n`.
    Text,
}

impl TokenConvention {
    pub fn encode(self, command: ConveyorCommand) -> &'static [u8] {
        match (self, command) {
            (TokenConvention::Byte, ConveyorCommand::Start) => b"1",
            (TokenConvention::Byte, ConveyorCommand::Stop) => b"0",
            (TokenConvention::Text, ConveyorCommand::Start) => b"START\n",
            (TokenConvention::Text, ConveyorCommand::Stop) => b"STOP\n",
        }
    }
}

/// Inbound message from the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A product is positioned and the belt has paused for inspection.
    ProductReady,
    Other(u8),
}

impl ControllerEvent {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'0' => ControllerEvent::ProductReady,
            other => ControllerEvent::Other(other),
        }
    }
}

/// Outbound command channel plus inbound event polling.
pub trait ConveyorLink: Send {
    fn send(&mut self, command: ConveyorCommand) -> Result<(), ActuatorError>;

    /// Wait briefly for one inbound byte. `Ok(None)` when nothing arrived.
    fn poll_event(&mut self) -> Result<Option<ControllerEvent>, ActuatorError>;
}

impl<L: ConveyorLink + ?Sized> ConveyorLink for Box<L> {
    fn send(&mut self, command: ConveyorCommand) -> Result<(), ActuatorError> {
        (**self).send(command)
    }

    fn poll_event(&mut self) -> Result<Option<ControllerEvent>, ActuatorError> {
        (**self).poll_event()
    }
}

/// Conveyor controller reached over a serial port (or anything byte-oriented).
pub struct SerialConveyor<P = Box<dyn SerialPort>> {
    port: P,
    tokens: TokenConvention,
    label: String,
}

impl SerialConveyor<Box<dyn SerialPort>> {
    pub fn open(path: &str, baud_rate: u32, tokens: TokenConvention) -> Result<Self, ActuatorError> {
        let port = serialport::new(path, baud_rate)
            .timeout(SERIAL_POLL_TIMEOUT)
            .open()
            .map_err(|source| ActuatorError::Open {
                path: path.to_string(),
                source,
            })?;
        info!("Conveyor link open on {path} at {baud_rate} baud ({tokens:?} tokens)");
        Ok(Self::from_port(port, tokens, path))
    }
}

impl<P: Read + Write + Send> SerialConveyor<P> {
    pub fn from_port(port: P, tokens: TokenConvention, label: impl Into<String>) -> Self {
        Self {
            port,
            tokens,
            label: label.into(),
        }
    }

    pub fn into_inner(self) -> P {
        self.port
    }
}

impl<P: Read + Write + Send> ConveyorLink for SerialConveyor<P> {
    fn send(&mut self, command: ConveyorCommand) -> Result<(), ActuatorError> {
        let token = self.tokens.encode(command);
        self.port
            .write_all(token)
            .and_then(|()| self.port.flush())
            .map_err(|source| ActuatorError::Io {
                channel: "conveyor",
                source,
            })?;
        debug!(link = %self.label, %command, "conveyor command written");
        Ok(())
    }

    fn poll_event(&mut self) -> Result<Option<ControllerEvent>, ActuatorError> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(ControllerEvent::from_byte(byte[0]))),
            Err(err) if is_idle(&err) => Ok(None),
            Err(source) => Err(ActuatorError::Io {
                channel: "conveyor",
                source,
            }),
        }
    }
}

fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Stand-in link for bench runs without a controller attached.
///
/// Commands are only logged. With a trigger period set, a `ProductReady` event
/// is reported once per period so the triggered station can be exercised.
pub struct DryRunConveyor {
    trigger_every: Option<Duration>,
    last_trigger: Instant,
}

impl DryRunConveyor {
    pub fn new(trigger_every: Option<Duration>) -> Self {
        Self {
            trigger_every,
            last_trigger: Instant::now(),
        }
    }
}

impl ConveyorLink for DryRunConveyor {
    fn send(&mut self, command: ConveyorCommand) -> Result<(), ActuatorError> {
        info!(%command, "dry-run conveyor command");
        Ok(())
    }

    fn poll_event(&mut self) -> Result<Option<ControllerEvent>, ActuatorError> {
        thread::sleep(SERIAL_POLL_TIMEOUT);
        match self.trigger_every {
            Some(period) if self.last_trigger.elapsed() >= period => {
                self.last_trigger = Instant::now();
                Ok(Some(ControllerEvent::ProductReady))
            }
            _ => Ok(None),
        }
    }
}
