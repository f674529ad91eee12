//! Message set for the coordinator/follower bus
//!
//! Every message starts with a fixed 3-byte header
//! `{ source, type, dest }`; multi-byte fields are little-endian and are
//! written field-by-field - the wire layout never depends on in-memory
//! struct layout.
//!
//! Message types split into two groups:
//! - Discovery: `Reset`, `Start`, `Accept`, `Done`, `NodeConfig`
//! - Operation: `PositionRequest`, `BeginBatch`, `AddCommands`, `EndBatch`

use heapless::Vec;

/// Broadcast destination: every follower accepts the message
pub const BROADCAST: u8 = 0xFE;

/// The coordinator's bus id (hears everything, is never a destination filter)
pub const COORDINATOR: u8 = 0xFF;

/// Nodes on the display
pub const MAX_NODES: usize = 24;

/// Hands on the display (two per node)
pub const MAX_HANDS: usize = 2 * MAX_NODES;

/// Command words per `AddCommands` message
pub const MAX_CMDS_PER_MESSAGE: usize = 14;

/// Queued command words per hand
pub const MAX_CMDS_PER_HAND: usize = 90;

/// Wire message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MsgType {
    Reset = 0,
    Start = 1,
    Accept = 2,
    Done = 3,
    PositionRequest = 4,
    BeginBatch = 5,
    AddCommands = 6,
    EndBatch = 7,
    NodeConfig = 8,
}

impl MsgType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MsgType::Reset),
            1 => Some(MsgType::Start),
            2 => Some(MsgType::Accept),
            3 => Some(MsgType::Done),
            4 => Some(MsgType::PositionRequest),
            5 => Some(MsgType::BeginBatch),
            6 => Some(MsgType::AddCommands),
            7 => Some(MsgType::EndBatch),
            8 => Some(MsgType::NodeConfig),
            _ => None,
        }
    }
}

/// Fixed 3-byte message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    pub source: u8,
    pub msg_type: u8,
    pub dest: u8,
}

impl Header {
    pub const LEN: usize = 3;

    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.source;
        out[1] = self.msg_type;
        out[2] = self.dest;
    }

    pub fn read(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < Self::LEN {
            return Err(MessageError::Truncated);
        }
        Ok(Self {
            source: bytes[0],
            msg_type: bytes[1],
            dest: bytes[2],
        })
    }
}

/// Should a node with bus address `own` act on a message addressed to `dest`?
///
/// A node answers for its own (even) address and for the odd address of its
/// second hand. The coordinator hears everything and filters by type instead.
pub fn accepts(dest: u8, own: u8) -> bool {
    if own == COORDINATOR {
        return true;
    }
    dest == own || dest == own + 1 || dest == BROADCAST
}

/// Errors from message encode/decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageError {
    /// Payload shorter than the declared message requires
    Truncated,
    /// Header carries an unknown type id
    UnknownType(u8),
    /// Output buffer too small
    BufferTooSmall,
    /// `AddCommands` declared more words than a message may carry
    TooManyCommands,
    /// Payload length does not match the message type
    LengthMismatch,
}

/// A decoded bus message
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Message {
    /// Force every follower back to its pre-discovery state
    Reset,
    /// Discovery is about to assign addresses
    Start,
    /// Offer the address `offered` to the first unassigned follower.
    /// A follower's reply is the same message with `offered` advanced by 2,
    /// chaining the assignment along the bus.
    Accept { offered: u8 },
    /// Discovery finished; `last_id` is the first address that was never
    /// claimed (i.e. two times the node count)
    Done { last_id: u8 },
    /// Ask a node for its hand positions (and optionally stop motion); the
    /// reply reuses the same type with the fields filled in
    PositionRequest {
        stop: bool,
        pos0: u16,
        pos1: u16,
        /// Both hands homed and idle
        ready: bool,
    },
    /// Per-node calibration: magnet offsets and initial park ticks
    NodeConfig {
        magnet_offset0: i16,
        magnet_offset1: i16,
        initial_ticks0: i16,
        initial_ticks1: i16,
    },
    /// Clear all per-hand command buffers; a batch follows
    BeginBatch,
    /// Append command words to the addressed hand's buffer
    AddCommands { words: Vec<u16, MAX_CMDS_PER_MESSAGE> },
    /// Finalize the batch: shared speed table, ramp-reversal detection flags
    /// (one bit per hand), and the milliseconds left in the current
    /// scheduling period for follow-seconds alignment
    EndBatch {
        speed_table: [u8; 8],
        ramp_detect: u64,
        millis_left: u32,
        turn_speed: u8,
        turn_steps: u8,
    },
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Reset => MsgType::Reset,
            Message::Start => MsgType::Start,
            Message::Accept { .. } => MsgType::Accept,
            Message::Done { .. } => MsgType::Done,
            Message::PositionRequest { .. } => MsgType::PositionRequest,
            Message::NodeConfig { .. } => MsgType::NodeConfig,
            Message::BeginBatch => MsgType::BeginBatch,
            Message::AddCommands { .. } => MsgType::AddCommands,
            Message::EndBatch { .. } => MsgType::EndBatch,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Message::Reset | Message::Start | Message::BeginBatch => 0,
            Message::Accept { .. } | Message::Done { .. } => 1,
            Message::PositionRequest { .. } => 6,
            Message::NodeConfig { .. } => 8,
            Message::AddCommands { words } => 1 + 2 * words.len(),
            Message::EndBatch { .. } => 22,
        }
    }

    /// Serialize header + body into `out`; returns the bytes written.
    pub fn encode(&self, source: u8, dest: u8, out: &mut [u8]) -> Result<usize, MessageError> {
        let total = Header::LEN + self.body_len();
        if out.len() < total {
            return Err(MessageError::BufferTooSmall);
        }
        Header {
            source,
            msg_type: self.msg_type() as u8,
            dest,
        }
        .write(out);

        let body = &mut out[Header::LEN..];
        match self {
            Message::Reset | Message::Start | Message::BeginBatch => {}
            Message::Accept { offered } => body[0] = *offered,
            Message::Done { last_id } => body[0] = *last_id,
            Message::PositionRequest {
                stop,
                pos0,
                pos1,
                ready,
            } => {
                body[0] = *stop as u8;
                body[1..3].copy_from_slice(&pos0.to_le_bytes());
                body[3..5].copy_from_slice(&pos1.to_le_bytes());
                body[5] = *ready as u8;
            }
            Message::NodeConfig {
                magnet_offset0,
                magnet_offset1,
                initial_ticks0,
                initial_ticks1,
            } => {
                body[0..2].copy_from_slice(&magnet_offset0.to_le_bytes());
                body[2..4].copy_from_slice(&magnet_offset1.to_le_bytes());
                body[4..6].copy_from_slice(&initial_ticks0.to_le_bytes());
                body[6..8].copy_from_slice(&initial_ticks1.to_le_bytes());
            }
            Message::AddCommands { words } => {
                body[0] = words.len() as u8;
                for (idx, word) in words.iter().enumerate() {
                    body[1 + 2 * idx..3 + 2 * idx].copy_from_slice(&word.to_le_bytes());
                }
            }
            Message::EndBatch {
                speed_table,
                ramp_detect,
                millis_left,
                turn_speed,
                turn_steps,
            } => {
                body[0..8].copy_from_slice(speed_table);
                body[8..16].copy_from_slice(&ramp_detect.to_le_bytes());
                body[16..20].copy_from_slice(&millis_left.to_le_bytes());
                body[20] = *turn_speed;
                body[21] = *turn_steps;
            }
        }
        Ok(total)
    }

    /// Parse a complete payload (header + body) from the link layer.
    pub fn decode(bytes: &[u8]) -> Result<(Header, Message), MessageError> {
        let header = Header::read(bytes)?;
        let msg_type =
            MsgType::from_u8(header.msg_type).ok_or(MessageError::UnknownType(header.msg_type))?;
        let body = &bytes[Header::LEN..];

        let message = match msg_type {
            MsgType::Reset => require(body, 0).map(|_| Message::Reset)?,
            MsgType::Start => require(body, 0).map(|_| Message::Start)?,
            MsgType::BeginBatch => require(body, 0).map(|_| Message::BeginBatch)?,
            MsgType::Accept => {
                require(body, 1)?;
                Message::Accept { offered: body[0] }
            }
            MsgType::Done => {
                require(body, 1)?;
                Message::Done { last_id: body[0] }
            }
            MsgType::PositionRequest => {
                require(body, 6)?;
                Message::PositionRequest {
                    stop: body[0] != 0,
                    pos0: u16::from_le_bytes([body[1], body[2]]),
                    pos1: u16::from_le_bytes([body[3], body[4]]),
                    ready: body[5] != 0,
                }
            }
            MsgType::NodeConfig => {
                require(body, 8)?;
                Message::NodeConfig {
                    magnet_offset0: i16::from_le_bytes([body[0], body[1]]),
                    magnet_offset1: i16::from_le_bytes([body[2], body[3]]),
                    initial_ticks0: i16::from_le_bytes([body[4], body[5]]),
                    initial_ticks1: i16::from_le_bytes([body[6], body[7]]),
                }
            }
            MsgType::AddCommands => {
                if body.is_empty() {
                    return Err(MessageError::Truncated);
                }
                let count = body[0] as usize;
                if count > MAX_CMDS_PER_MESSAGE {
                    return Err(MessageError::TooManyCommands);
                }
                require(&body[1..], 2 * count)?;
                let mut words = Vec::new();
                for idx in 0..count {
                    let word = u16::from_le_bytes([body[1 + 2 * idx], body[2 + 2 * idx]]);
                    // capacity checked above
                    let _ = words.push(word);
                }
                Message::AddCommands { words }
            }
            MsgType::EndBatch => {
                require(body, 22)?;
                let mut speed_table = [0u8; 8];
                speed_table.copy_from_slice(&body[0..8]);
                Message::EndBatch {
                    speed_table,
                    ramp_detect: u64::from_le_bytes(body[8..16].try_into().unwrap()),
                    millis_left: u32::from_le_bytes(body[16..20].try_into().unwrap()),
                    turn_speed: body[20],
                    turn_steps: body[21],
                }
            }
        };
        Ok((header, message))
    }
}

fn require(body: &[u8], len: usize) -> Result<(), MessageError> {
    if body.len() < len {
        return Err(MessageError::Truncated);
    }
    if body.len() > len {
        return Err(MessageError::LengthMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message, source: u8, dest: u8) -> (Header, Message) {
        let mut buf = [0u8; 64];
        let len = msg.encode(source, dest, &mut buf).unwrap();
        Message::decode(&buf[..len]).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let mut buf = [0u8; 8];
        let len = Message::Reset.encode(COORDINATOR, BROADCAST, &mut buf).unwrap();
        assert_eq!(len, 3);
        assert_eq!(&buf[..3], &[0xFF, 0x00, 0xFE]);
    }

    #[test]
    fn test_accept_roundtrip() {
        let (header, msg) = roundtrip(Message::Accept { offered: 6 }, 4, COORDINATOR);
        assert_eq!(header.source, 4);
        assert_eq!(header.dest, COORDINATOR);
        assert_eq!(msg, Message::Accept { offered: 6 });
    }

    #[test]
    fn test_position_request_roundtrip() {
        let original = Message::PositionRequest {
            stop: true,
            pos0: 700,
            pos1: 15,
            ready: true,
        };
        let (_, msg) = roundtrip(original.clone(), 8, 10);
        assert_eq!(msg, original);
    }

    #[test]
    fn test_node_config_negative_offsets() {
        let original = Message::NodeConfig {
            magnet_offset0: -12,
            magnet_offset1: 7,
            initial_ticks0: 360,
            initial_ticks1: -1,
        };
        let (_, msg) = roundtrip(original.clone(), COORDINATOR, 4);
        assert_eq!(msg, original);
    }

    #[test]
    fn test_add_commands_roundtrip() {
        let mut words = Vec::new();
        for word in [0x1234u16, 0xFFFF, 0, 42] {
            words.push(word).unwrap();
        }
        let original = Message::AddCommands { words };
        let (header, msg) = roundtrip(original.clone(), COORDINATOR, 7);
        assert_eq!(header.dest, 7);
        assert_eq!(msg, original);
    }

    #[test]
    fn test_end_batch_exact_layout() {
        let msg = Message::EndBatch {
            speed_table: [1, 2, 4, 8, 12, 16, 32, 64],
            ramp_detect: 0x0102_0304_0506_0708,
            millis_left: 58_000,
            turn_speed: 8,
            turn_steps: 5,
        };
        let mut buf = [0u8; 64];
        let len = msg.encode(COORDINATOR, BROADCAST, &mut buf).unwrap();
        assert_eq!(len, 3 + 22);
        assert_eq!(&buf[3..11], &[1, 2, 4, 8, 12, 16, 32, 64]);
        // little-endian u64
        assert_eq!(&buf[11..19], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[19..23], &58_000u32.to_le_bytes());
        assert_eq!(buf[23], 8);
        assert_eq!(buf[24], 5);

        let (_, back) = Message::decode(&buf[..len]).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let bytes = [0xFF, 0x63, 0xFE];
        assert_eq!(
            Message::decode(&bytes),
            Err(MessageError::UnknownType(0x63))
        );
    }

    #[test]
    fn test_truncated_rejected() {
        let mut buf = [0u8; 64];
        let msg = Message::PositionRequest {
            stop: false,
            pos0: 0,
            pos1: 0,
            ready: false,
        };
        let len = msg.encode(0, 2, &mut buf).unwrap();
        assert_eq!(
            Message::decode(&buf[..len - 2]),
            Err(MessageError::Truncated)
        );
    }

    #[test]
    fn test_too_many_commands_rejected() {
        let mut bytes = [0u8; 40];
        bytes[0] = COORDINATOR;
        bytes[1] = MsgType::AddCommands as u8;
        bytes[2] = 4;
        bytes[3] = (MAX_CMDS_PER_MESSAGE + 1) as u8;
        assert_eq!(
            Message::decode(&bytes[..4 + 2 * (MAX_CMDS_PER_MESSAGE + 1)]),
            Err(MessageError::TooManyCommands)
        );
    }

    #[test]
    fn test_address_filter() {
        // Node at address 4 owns hands 4 and 5
        assert!(accepts(4, 4));
        assert!(accepts(5, 4));
        assert!(accepts(BROADCAST, 4));
        assert!(!accepts(6, 4));
        assert!(!accepts(3, 4));
        // Coordinator hears everything
        assert!(accepts(0, COORDINATOR));
        assert!(accepts(BROADCAST, COORDINATOR));
    }
}
