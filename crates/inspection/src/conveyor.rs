//! Conveyor control state machine.
//!
//! The controller is the only writer to the conveyor link and the reject
//! actuator. Each verdict is applied as one transition; hardware commands are
//! issued before the state changes, so a failed write leaves the recorded
//! state untouched and the error bubbles up as fatal.

use std::fmt;

use clap::ValueEnum;
use conveyor_io::{ActuatorError, ConveyorCommand, ConveyorLink, Direction, RejectActuator};
use tracing::{debug, info, warn};

use crate::compliance::VerdictStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConveyorState {
    Running,
    Stopped,
    /// Belt halted; every new cycle re-checks whether the defect is gone.
    AwaitingRemoval,
}

impl ConveyorState {
    pub fn label(self) -> &'static str {
        match self {
            ConveyorState::Running => "RUNNING",
            ConveyorState::Stopped => "STOPPED",
            ConveyorState::AwaitingRemoval => "AWAITING_REMOVAL",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            ConveyorState::Running => 0.0,
            ConveyorState::Stopped => 1.0,
            ConveyorState::AwaitingRemoval => 2.0,
        }
    }
}

impl fmt::Display for ConveyorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reaction to a defective product while the belt is running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum DefectPolicy {
    /// Halt the belt and wait until the product is removed.
    #[default]
    Stop,
    /// Pulse the reject actuator and keep the belt moving.
    Reject,
    /// Log the defect and keep the belt moving.
    Flag,
}

#[derive(Clone, Copy, Debug)]
pub struct ControllerOptions {
    pub policy: DefectPolicy,
    pub reject_direction: Direction,
    /// Send START after every cycle that leaves the belt running. The
    /// triggered station needs it: its firmware pauses on each product.
    pub keep_alive: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            policy: DefectPolicy::default(),
            reject_direction: Direction::Backward,
            keep_alive: false,
        }
    }
}

/// What one call to [`ConveyorController::apply`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ConveyorState,
    pub to: ConveyorState,
    pub command: Option<ConveyorCommand>,
    pub rejected: Option<Direction>,
    pub flagged: bool,
}

impl Transition {
    fn stay(state: ConveyorState) -> Self {
        Self {
            from: state,
            to: state,
            command: None,
            rejected: None,
            flagged: false,
        }
    }

    pub fn changed_state(&self) -> bool {
        self.from != self.to
    }
}

pub struct ConveyorController<L, A> {
    link: L,
    actuator: A,
    state: ConveyorState,
    options: ControllerOptions,
}

impl<L: ConveyorLink, A: RejectActuator> ConveyorController<L, A> {
    pub fn new(link: L, actuator: A, options: ControllerOptions) -> Self {
        metrics::gauge!("conveyor_state").set(ConveyorState::Running.gauge_value());
        Self {
            link,
            actuator,
            state: ConveyorState::Running,
            options,
        }
    }

    pub fn state(&self) -> ConveyorState {
        self.state
    }

    /// Direct access to the link, used to poll controller events.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Start the belt so the hardware matches the initial RUNNING state.
    pub fn engage(&mut self) -> Result<(), ActuatorError> {
        self.send(ConveyorCommand::Start)?;
        self.enter(ConveyorState::Running);
        Ok(())
    }

    /// Feed one verdict through the state machine.
    pub fn apply(&mut self, status: VerdictStatus) -> Result<Transition, ActuatorError> {
        let from = self.state;
        let mut transition = Transition::stay(from);

        match (from, status) {
            (ConveyorState::Running, VerdictStatus::Compliant | VerdictStatus::NoDetection) => {
                transition.command = self.keep_alive()?;
            }
            (ConveyorState::Running, VerdictStatus::Defective) => match self.options.policy {
                DefectPolicy::Stop => {
                    self.send(ConveyorCommand::Stop)?;
                    transition.command = Some(ConveyorCommand::Stop);
                    transition.to = ConveyorState::Stopped;
                }
                DefectPolicy::Reject => {
                    let direction = self.options.reject_direction;
                    self.actuator.pulse(direction)?;
                    metrics::counter!("conveyor_reject_pulses_total").increment(1);
                    transition.rejected = Some(direction);
                    transition.command = self.keep_alive()?;
                }
                DefectPolicy::Flag => {
                    warn!("Defective product flagged; belt keeps running");
                    transition.flagged = true;
                    transition.command = self.keep_alive()?;
                }
            },
            // The first verdict after a stop still belongs to the product
            // that caused it.
            (ConveyorState::Stopped, _) => {
                transition.to = ConveyorState::AwaitingRemoval;
            }
            (
                ConveyorState::AwaitingRemoval,
                VerdictStatus::Compliant | VerdictStatus::NoDetection,
            ) => {
                self.send(ConveyorCommand::Start)?;
                transition.command = Some(ConveyorCommand::Start);
                transition.to = ConveyorState::Running;
            }
            (ConveyorState::AwaitingRemoval, VerdictStatus::Defective) => {
                debug!("Defective product still present");
            }
        }

        self.enter(transition.to);
        Ok(transition)
    }

    /// Stop the belt if it is moving and fall back to STOPPED.
    pub fn halt(&mut self) -> Result<(), ActuatorError> {
        if self.state == ConveyorState::Running {
            self.send(ConveyorCommand::Stop)?;
        }
        self.enter(ConveyorState::Stopped);
        Ok(())
    }

    /// Leave the line safe: belt stopped, actuator released.
    pub fn shutdown(mut self) -> Result<(), ActuatorError> {
        let halted = self.halt();
        if let Err(err) = &halted {
            warn!("Failed to stop conveyor during shutdown: {err}");
        }
        let released = self.actuator.release();
        info!(state = %self.state, "Conveyor controller shut down");
        halted.and(released)
    }

    fn keep_alive(&mut self) -> Result<Option<ConveyorCommand>, ActuatorError> {
        if !self.options.keep_alive {
            return Ok(None);
        }
        self.send(ConveyorCommand::Start)?;
        Ok(Some(ConveyorCommand::Start))
    }

    fn send(&mut self, command: ConveyorCommand) -> Result<(), ActuatorError> {
        let _span = tracing::debug_span!("conveyor.send", %command).entered();
        self.link.send(command)?;
        let label = match command {
            ConveyorCommand::Start => "start",
            ConveyorCommand::Stop => "stop",
        };
        metrics::counter!("conveyor_commands_total", "command" => label).increment(1);
        Ok(())
    }

    fn enter(&mut self, next: ConveyorState) {
        if next != self.state {
            info!("Conveyor {} -> {}", self.state, next);
            metrics::counter!(
                "conveyor_transitions_total",
                "from" => self.state.label(),
                "to" => next.label()
            )
            .increment(1);
            metrics::gauge!("conveyor_state").set(next.gauge_value());
        }
        self.state = next;
    }
}
