//! Reject actuator: a continuous-rotation servo that pushes defective
//! products off the line.

use std::{fmt, time::Duration};

use clap::ValueEnum;
use tracing::info;

use crate::error::ActuatorError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    Forward,
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

/// Timing of one reject pulse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PulseProfile {
    pub frequency_hz: f64,
    /// Duty cycle in percent for forward rotation.
    pub forward_duty: f64,
    /// Duty cycle in percent for backward rotation.
    pub backward_duty: f64,
    pub duration: Duration,
}

impl Default for PulseProfile {
    fn default() -> Self {
        Self {
            frequency_hz: 50.0,
            forward_duty: 7.5,
            backward_duty: 5.5,
            duration: Duration::from_secs(2),
        }
    }
}

impl PulseProfile {
    pub fn duty_for(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Forward => self.forward_duty,
            Direction::Backward => self.backward_duty,
        }
    }
}

/// Accepts a direction, runs a timed pulse, then returns to neutral.
pub trait RejectActuator: Send {
    /// Blocks for the duration of the pulse.
    fn pulse(&mut self, direction: Direction) -> Result<(), ActuatorError>;

    /// Return to neutral and release the output.
    fn release(&mut self) -> Result<(), ActuatorError>;
}

impl<A: RejectActuator + ?Sized> RejectActuator for Box<A> {
    fn pulse(&mut self, direction: Direction) -> Result<(), ActuatorError> {
        (**self).pulse(direction)
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        (**self).release()
    }
}

/// Logs pulses instead of driving a pin.
#[derive(Debug, Default)]
pub struct DryRunActuator {
    pulses: u64,
}

impl DryRunActuator {
    pub fn pulses(&self) -> u64 {
        self.pulses
    }
}

impl RejectActuator for DryRunActuator {
    fn pulse(&mut self, direction: Direction) -> Result<(), ActuatorError> {
        self.pulses += 1;
        info!(%direction, total = self.pulses, "dry-run reject pulse");
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        Ok(())
    }
}

#[cfg(feature = "rpi")]
pub use servo::ServoActuator;

#[cfg(feature = "rpi")]
mod servo {
    use std::thread;

    use rppal::gpio::{Gpio, OutputPin};
    use tracing::info;

    use super::{Direction, PulseProfile, RejectActuator};
    use crate::error::ActuatorError;

    /// Servo on a GPIO pin driven by software PWM.
    pub struct ServoActuator {
        pin: OutputPin,
        pin_number: u8,
        profile: PulseProfile,
    }

    impl ServoActuator {
        pub fn open(pin_number: u8, profile: PulseProfile) -> Result<Self, ActuatorError> {
            let gpio_err = |err: rppal::gpio::Error| ActuatorError::Gpio {
                pin: pin_number,
                message: err.to_string(),
            };
            let pin = Gpio::new()
                .map_err(gpio_err)?
                .get(pin_number)
                .map_err(gpio_err)?
                .into_output_low();
            info!(
                "Reject servo on BCM {pin_number} at {} Hz",
                profile.frequency_hz
            );
            Ok(Self {
                pin,
                pin_number,
                profile,
            })
        }

        fn set_duty(&mut self, percent: f64) -> Result<(), ActuatorError> {
            self.pin
                .set_pwm_frequency(self.profile.frequency_hz, percent / 100.0)
                .map_err(|err| ActuatorError::Gpio {
                    pin: self.pin_number,
                    message: err.to_string(),
                })
        }
    }

    impl RejectActuator for ServoActuator {
        fn pulse(&mut self, direction: Direction) -> Result<(), ActuatorError> {
            let duty = self.profile.duty_for(direction);
            info!(%direction, duty, "reject pulse");
            let driven = self.set_duty(duty);
            if driven.is_ok() {
                thread::sleep(self.profile.duration);
            }
            // Neutral even when the drive step failed.
            let neutral = self.set_duty(0.0);
            driven.and(neutral)
        }

        fn release(&mut self) -> Result<(), ActuatorError> {
            self.pin.clear_pwm().map_err(|err| ActuatorError::Gpio {
                pin: self.pin_number,
                message: err.to_string(),
            })?;
            self.pin.set_low();
            Ok(())
        }
    }
}
