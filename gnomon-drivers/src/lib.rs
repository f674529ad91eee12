//! Follower-side execution engine
//!
//! Everything a follower node runs per motor, generic over
//! `embedded-hal` digital pins so the whole engine is testable on the host
//! with mock pins:
//!
//! - [`stepper::RampedStepper`]: drift-compensated pulse timing, direction
//!   latching, ghost stepping
//! - [`stepper::HomingSequence`]: magnet-sensor homing with debounce
//! - [`stepper::CommandExecutor`]: the queued-command state machine

#![no_std]
#![deny(unsafe_code)]

#[cfg(test)]
extern crate std;

pub mod stepper;

pub use stepper::{CommandExecutor, HomingSequence, RampedStepper};
