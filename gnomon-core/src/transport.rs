//! Command batch transport
//!
//! Takes a finished plan and turns it into the message sequence that delivers
//! it: one `BeginBatch` (clears every node's buffers), per-hand `AddCommands`
//! chunks of at most 14 words, and one `EndBatch` carrying the negotiated
//! speed table plus timing metadata that triggers synchronized execution.
//!
//! The speed table is rebuilt per batch from the union of speeds the plan
//! actually uses. More than 8 distinct speeds cannot be encoded in the 3-bit
//! index, so such a batch is rejected outright rather than silently
//! quantizing some hands differently than planned.

use heapless::Vec;

use gnomon_protocol::command::SpeedTable;
use gnomon_protocol::messages::{
    Header, Message, BROADCAST, COORDINATOR, MAX_CMDS_PER_HAND, MAX_CMDS_PER_MESSAGE,
};

use crate::hands::{HandId, HandsState, Layout};
use crate::planner::{Plan, PlannedCmd, TURN_SPEED_RPM, TURN_STEPS};

/// Worst case: 48 hands x ceil(90 / 14) chunks + begin + end
pub const MAX_BATCH_MESSAGES: usize = 48 * 7 + 2;

/// A message bound for a bus destination
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Outgoing {
    pub dest: u8,
    pub message: Message,
}

/// The transmit-ready form of a batch
#[derive(Debug, PartialEq)]
pub struct Batch {
    pub messages: Vec<Outgoing, MAX_BATCH_MESSAGES>,
    pub speed_table: SpeedTable,
    /// Hands dropped because the layout holds no bus address for them
    pub unmapped: u32,
}

/// Errors that reject a whole batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The plan uses more distinct speeds than the 3-bit index can carry
    TooManySpeeds { distinct: usize },
    /// One hand's command list exceeds the follower's queue
    HandOverflow { hand: u8 },
    /// The message buffer filled up (the plan is absurdly large)
    TooManyMessages,
}

/// Build the per-batch speed table: distinct requested speeds, ascending,
/// padded to 8 entries with the largest.
fn negotiate_speeds(cmds: &[PlannedCmd]) -> Result<SpeedTable, TransportError> {
    let mut distinct: Vec<u8, 16> = Vec::new();
    for planned in cmds {
        let rpm = planned.cmd.speed_rpm;
        if !distinct.contains(&rpm) {
            if distinct.push(rpm).is_err() {
                return Err(TransportError::TooManySpeeds {
                    distinct: distinct.len() + 1,
                });
            }
        }
    }
    if distinct.len() > 8 {
        return Err(TransportError::TooManySpeeds {
            distinct: distinct.len(),
        });
    }
    distinct.sort_unstable();

    let mut entries = [0u8; 8];
    let highest = distinct.last().copied().unwrap_or(1);
    for (idx, slot) in entries.iter_mut().enumerate() {
        *slot = distinct.get(idx).copied().unwrap_or(highest);
    }
    Ok(SpeedTable::new(entries))
}

/// Serialize a finished plan into its transmit-ready message sequence.
///
/// `millis_left` is the time remaining in the current scheduling period
/// (used by followers to align follow-seconds commands).
pub fn build_batch(plan: &Plan, layout: &Layout, millis_left: u32) -> Result<Batch, TransportError> {
    let cmds = plan.commands();
    let speed_table = negotiate_speeds(cmds)?;

    let mut messages: Vec<Outgoing, MAX_BATCH_MESSAGES> = Vec::new();
    let mut unmapped = 0u32;
    let mut ramp_detect = 0u64;

    messages
        .push(Outgoing {
            dest: BROADCAST,
            message: Message::BeginBatch,
        })
        .map_err(|_| TransportError::TooManyMessages)?;

    // Per hand, in logical order, preserving each hand's emission order
    for hand in HandId::all() {
        let Some(address) = layout.hand_address(hand) else {
            if cmds.iter().any(|p| p.hand == hand) {
                #[cfg(feature = "defmt")]
                defmt::warn!("hand {} has no bus address, dropping its commands", hand.0);
                unmapped += 1;
            }
            continue;
        };

        let mut words: Vec<u16, MAX_CMDS_PER_MESSAGE> = Vec::new();
        let mut total = 0usize;
        for planned in cmds.iter().filter(|p| p.hand == hand) {
            total += 1;
            if total > MAX_CMDS_PER_HAND {
                return Err(TransportError::HandOverflow { hand: hand.0 });
            }
            if planned
                .cmd
                .mode
                .contains(gnomon_protocol::command::CmdMode::SWAP_SPEED)
            {
                ramp_detect |= 1u64 << address;
            }
            // full chunk: flush
            if words.len() == MAX_CMDS_PER_MESSAGE {
                messages
                    .push(Outgoing {
                        dest: address,
                        message: Message::AddCommands {
                            words: core::mem::take(&mut words),
                        },
                    })
                    .map_err(|_| TransportError::TooManyMessages)?;
            }
            let _ = words.push(planned.cmd.encode(&speed_table));
        }
        if !words.is_empty() {
            messages
                .push(Outgoing {
                    dest: address,
                    message: Message::AddCommands { words },
                })
                .map_err(|_| TransportError::TooManyMessages)?;
        }
    }

    messages
        .push(Outgoing {
            dest: BROADCAST,
            message: Message::EndBatch {
                speed_table: *speed_table.entries(),
                ramp_detect,
                millis_left,
                turn_speed: TURN_SPEED_RPM,
                turn_steps: TURN_STEPS,
            },
        })
        .map_err(|_| TransportError::TooManyMessages)?;

    Ok(Batch {
        messages,
        speed_table,
        unmapped,
    })
}

/// Coordinator-side position scan
///
/// The scan walks the reply chain established at discovery: the request goes
/// to node 0, each node appends its answer addressed to the next node, and
/// the last node addresses the coordinator, which ends the scan. Replies
/// update the simulated [`HandsState`] - a node still homing reports
/// not-ready and its hands stay unknown.
#[derive(Debug, Clone)]
pub struct PositionScan {
    complete: bool,
}

impl PositionScan {
    /// Start a scan; send the returned request on the bus.
    /// With `stop` set, nodes abort in-flight motion before answering.
    pub fn begin(stop: bool) -> (Self, Outgoing) {
        (
            Self { complete: false },
            Outgoing {
                dest: 0,
                message: Message::PositionRequest {
                    stop,
                    pos0: 0,
                    pos1: 0,
                    ready: false,
                },
            },
        )
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Feed a received reply. Returns true when the chain has closed.
    pub fn on_message(
        &mut self,
        header: &Header,
        message: &Message,
        layout: &Layout,
        state: &mut HandsState,
    ) -> bool {
        let Message::PositionRequest {
            pos0, pos1, ready, ..
        } = message
        else {
            return self.complete;
        };
        if header.source == COORDINATOR {
            // our own request echoing back
            return self.complete;
        }

        if let Some(node) = layout.logical_at(header.source) {
            if *ready {
                state.set_position(node.short_hand(), *pos0);
                state.set_position(node.long_hand(), *pos1);
            } else {
                state.clear_position(node.short_hand());
                state.clear_position(node.long_hand());
            }
        } else {
            #[cfg(feature = "defmt")]
            defmt::warn!("position reply from unmapped address {}", header.source);
        }

        if header.dest == COORDINATOR {
            self.complete = true;
        }
        self.complete
    }
}
