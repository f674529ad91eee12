//! Inter-task communication channels
//!
//! The bus task (protocol, discovery) and the motion task (steppers) talk
//! only through these statics, keeping the half-duplex transceiver and the
//! motors each single-owner.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use heapless::Vec;

use gnomon_protocol::messages::MAX_CMDS_PER_MESSAGE;

/// Motion-task mailbox depth
const MOTION_CHANNEL_SIZE: usize = 8;

/// Commands from the bus task to the motion task
#[derive(Debug, Clone)]
pub enum MotionMsg {
    /// Clear both hands' command queues (a batch is coming)
    Begin,
    /// Append raw command words to one hand's queue
    Add {
        /// 0 = short hand, 1 = long hand
        hand: u8,
        words: Vec<u16, MAX_CMDS_PER_MESSAGE>,
    },
    /// Batch finalized: install the speed table and run
    Start {
        speed_table: [u8; 8],
        ramp_detect0: bool,
        ramp_detect1: bool,
        millis_left: u32,
        turn_speed: u8,
        turn_steps: u8,
    },
    /// Calibration from the coordinator
    Config {
        magnet_offset0: i16,
        magnet_offset1: i16,
        initial_ticks0: i16,
        initial_ticks1: i16,
    },
    /// Re-home both hands (boot, hot reset)
    Home,
    /// Abort in-flight motion, optionally before a position report
    Stop,
    /// Publish positions on [`POSITIONS`]
    QueryPositions,
}

/// Bus -> motion commands
pub static MOTION: Channel<CriticalSectionRawMutex, MotionMsg, MOTION_CHANNEL_SIZE> =
    Channel::new();

/// Answer to [`MotionMsg::QueryPositions`]
#[derive(Debug, Clone, Copy)]
pub struct PositionReport {
    pub pos0: u16,
    pub pos1: u16,
    /// Both hands homed and idle
    pub ready: bool,
}

/// Motion -> bus position answers
pub static POSITIONS: Signal<CriticalSectionRawMutex, PositionReport> = Signal::new();
