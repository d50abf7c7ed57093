//! Hardware channels driven by the inspection station: the conveyor
//! controller serial link and the reject servo.

pub use actuator::{Direction, DryRunActuator, PulseProfile, RejectActuator};
#[cfg(feature = "rpi")]
pub use actuator::ServoActuator;
pub use error::ActuatorError;
pub use link::{
    ControllerEvent, ConveyorCommand, ConveyorLink, DryRunConveyor, SERIAL_POLL_TIMEOUT,
    SerialConveyor, TokenConvention,
};

mod actuator;
mod error;
mod link;
