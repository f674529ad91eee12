//! Board-agnostic logic for the Gnomon clock-hands display
//!
//! This crate contains everything the coordinator and followers share that
//! does not touch hardware:
//!
//! - Tick arithmetic over the angular ring
//! - Hand/node identities, the simulated hand state, and the display layout
//! - Digit glyphs (which tick each hand points at to draw a digit)
//! - The motion planner / animation engine
//! - The bus discovery state machines (coordinator and follower)
//! - Command batch transport (chunking + speed-table negotiation)
//!
//! Everything here is a plain state machine or pure function: inputs go in,
//! actions or commands come out, and the firmware layer does the actual I/O.
//! That keeps all of it testable on the host.

#![no_std]
#![deny(unsafe_code)]

pub mod discovery;
pub mod glyphs;
pub mod hands;
pub mod planner;
pub mod rng;
pub mod ticks;
pub mod traits;
pub mod transport;

pub use hands::{HandId, HandsState, Layout, NodeId};
pub use ticks::{Ring, RING};
pub use traits::{ClockTime, Direction, WallClock};
