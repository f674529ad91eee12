//! Stepper motor control: pulse timing, homing, and command execution

mod executor;
mod homing;
mod motor;

pub use executor::CommandExecutor;
pub use homing::{HomingSequence, HomingState};
pub use motor::RampedStepper;
