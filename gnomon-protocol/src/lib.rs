//! Bus protocol for the Gnomon clock-hands display
//!
//! This crate defines everything that crosses the shared RS-485 bus between
//! the coordinator and the follower nodes: the link-layer framing, the
//! message set, and the bit-packed motion command word.
//!
//! # Link frame
//!
//! All messages travel inside a self-checking frame:
//!
//! ```text
//! ┌─────┬─────────────────────────┬─────┬───────────────┐
//! │ STX │ payload, nibble-encoded │ ETX │ CRC-8, nibble │
//! │ 1B  │ 2B per payload byte     │ 1B  │ 2B            │
//! └─────┴─────────────────────────┴─────┴───────────────┘
//! ```
//!
//! Each payload byte is sent as two bytes of the form
//! `(nibble << 4) | (nibble ^ 0x0F)`, so a single corrupted byte is locally
//! detectable without waiting for the CRC. The bus is electrically noisy
//! (half-duplex turnaround glitches are routine), so receive errors reset the
//! parser and bump a counter instead of propagating.
//!
//! # Addressing
//!
//! Node addresses are even (`0, 2, 4, …`); a node answers for its own address
//! (short hand) and address + 1 (long hand). `0xFE` broadcasts to every node,
//! `0xFF` is the coordinator.

#![no_std]
#![deny(unsafe_code)]

pub mod command;
pub mod crc;
pub mod frame;
pub mod messages;

pub use command::{Command, CmdMode, SpeedIndex, SpeedTable, MAX_TRAVEL};
pub use crc::crc8;
pub use frame::{
    encode_frame, FrameError, FrameParser, LinkStats, Payload, ETX, MAX_PAYLOAD_SIZE, STX,
};
pub use messages::{
    accepts, Header, Message, MessageError, MsgType, BROADCAST, COORDINATOR, MAX_CMDS_PER_HAND,
    MAX_CMDS_PER_MESSAGE, MAX_HANDS, MAX_NODES,
};
