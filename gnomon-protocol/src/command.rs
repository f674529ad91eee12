//! Bit-packed motion command word and the shared speed table
//!
//! A command occupies one 16-bit word on the wire:
//!
//! ```text
//! bits [0, 3)   mode flags (ghost / clockwise / absolute)
//! bits [3, 6)   speed index into the batch's shared speed table
//! bits [6, 16)  magnitude (steps, or an absolute tick, or a sentinel)
//! ```
//!
//! Real speeds are quantized to a 3-bit index: every batch negotiates a table
//! of up to 8 rpm values (see the transport layer), and a command stores only
//! the index. Quantization picks the largest table entry that does not exceed
//! the requested speed, falling back to index 0 - decoding a command whose
//! speed was not in the table therefore recovers the nearest representable
//! command, not the original.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const MODE_SHIFT: u16 = 0;
const MODE_MASK: u16 = 0b111;
const SPEED_SHIFT: u16 = 3;
const SPEED_MASK: u16 = 0b111;
const MAGNITUDE_SHIFT: u16 = 6;
const MAGNITUDE_MASK: u16 = 0x3FF;

/// Largest plain travel magnitude; 1022 and 1023 are sentinels
pub const MAX_TRAVEL: u16 = 1021;

/// Magnitude sentinel: continuously follow wall-clock seconds, smoothly
pub const FOLLOW_SECONDS: u16 = 1022;

/// Magnitude sentinel: follow wall-clock seconds in one-second jumps
pub const FOLLOW_SECONDS_DISCRETE: u16 = 1023;

/// Command mode flags (3 bits on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CmdMode(u8);

impl CmdMode {
    /// Timing-only step: advance scheduling state, move nothing
    pub const GHOST: CmdMode = CmdMode(0b001);
    /// Rotate clockwise (unset = anticlockwise)
    pub const CLOCKWISE: CmdMode = CmdMode(0b010);
    /// Magnitude is an absolute tick (coordinator-side only; followers only
    /// ever receive relative commands)
    pub const ABSOLUTE: CmdMode = CmdMode(0b100);
    /// Ramp-reversal hint: the next command reverses direction at speed, so
    /// the executor should shed speed before the turn. Shares the ABSOLUTE
    /// bit - the two never travel together.
    pub const SWAP_SPEED: CmdMode = CmdMode(0b100);

    /// Anticlockwise, relative - all flags clear
    pub const RELATIVE: CmdMode = CmdMode(0);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        CmdMode(bits & MODE_MASK as u8)
    }

    pub const fn contains(self, other: CmdMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn ghost(self) -> bool {
        self.contains(Self::GHOST)
    }

    pub const fn clockwise(self) -> bool {
        self.contains(Self::CLOCKWISE)
    }

    pub const fn absolute(self) -> bool {
        self.contains(Self::ABSOLUTE)
    }

    pub const fn relative(self) -> bool {
        !self.absolute()
    }

    /// Remove a flag
    pub const fn without(self, other: CmdMode) -> Self {
        CmdMode(self.0 & !other.0)
    }
}

impl core::ops::BitOr for CmdMode {
    type Output = CmdMode;

    fn bitor(self, rhs: CmdMode) -> CmdMode {
        CmdMode(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for CmdMode {
    fn bitor_assign(&mut self, rhs: CmdMode) {
        self.0 |= rhs.0;
    }
}

/// A 3-bit index into a [`SpeedTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpeedIndex(pub u8);

/// Per-batch table mapping 3-bit indices to rpm values
///
/// The coordinator rebuilds this from the speeds a batch actually uses and
/// ships it in the batch-end message; both sides then encode/decode against
/// the same table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpeedTable([u8; 8]);

/// Power-on speed table, before any batch has negotiated its own
pub const DEFAULT_SPEEDS: [u8; 8] = [1, 2, 4, 8, 12, 16, 32, 64];

impl Default for SpeedTable {
    fn default() -> Self {
        SpeedTable(DEFAULT_SPEEDS)
    }
}

impl SpeedTable {
    /// Build a table from explicit entries (must be ascending to quantize
    /// sensibly; the transport layer guarantees this)
    pub const fn new(speeds: [u8; 8]) -> Self {
        SpeedTable(speeds)
    }

    pub const fn entries(&self) -> &[u8; 8] {
        &self.0
    }

    /// Quantize an rpm value to the largest table entry that does not exceed
    /// it. Falls back to index 0 when every entry is larger.
    pub fn quantize(&self, rpm: u8) -> SpeedIndex {
        let mut idx = self.0.len() - 1;
        while idx > 0 {
            if rpm >= self.0[idx] {
                return SpeedIndex(idx as u8);
            }
            idx -= 1;
        }
        SpeedIndex(0)
    }

    /// Expand an index back to the rpm it stands for
    pub fn lookup(&self, index: SpeedIndex) -> u8 {
        // 3-bit index cannot exceed the table
        self.0[(index.0 & 0b111) as usize]
    }
}

/// One motion command for one hand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Command {
    pub mode: CmdMode,
    /// Requested speed in revolutions per minute
    pub speed_rpm: u8,
    /// Steps to travel (relative), target tick (absolute), or a
    /// follow-seconds sentinel
    pub magnitude: u16,
}

impl Command {
    pub const fn new(mode: CmdMode, magnitude: u16, speed_rpm: u8) -> Self {
        Self {
            mode,
            speed_rpm,
            magnitude,
        }
    }

    /// A command that chases the wall-clock second hand until the batch ends
    pub const fn follow_seconds(speed_rpm: u8, discrete: bool) -> Self {
        Self {
            mode: CmdMode::CLOCKWISE,
            speed_rpm,
            magnitude: if discrete {
                FOLLOW_SECONDS_DISCRETE
            } else {
                FOLLOW_SECONDS
            },
        }
    }

    pub const fn is_follow_seconds(&self) -> bool {
        self.magnitude == FOLLOW_SECONDS || self.magnitude == FOLLOW_SECONDS_DISCRETE
    }

    /// True for a command that encodes no work at all
    pub const fn is_empty(&self) -> bool {
        self.mode.bits() == 0 && self.speed_rpm == 0 && self.magnitude == 0
    }

    /// Pack into a 16-bit wire word, quantizing the speed against `table`.
    pub fn encode(&self, table: &SpeedTable) -> u16 {
        let mode = (self.mode.bits() as u16 & MODE_MASK) << MODE_SHIFT;
        let speed = (table.quantize(self.speed_rpm).0 as u16 & SPEED_MASK) << SPEED_SHIFT;
        let magnitude = (self.magnitude & MAGNITUDE_MASK) << MAGNITUDE_SHIFT;
        mode | speed | magnitude
    }

    /// Unpack a wire word, expanding the speed index via `table`.
    pub fn decode(raw: u16, table: &SpeedTable) -> Self {
        let mode = CmdMode::from_bits(((raw >> MODE_SHIFT) & MODE_MASK) as u8);
        let index = SpeedIndex(((raw >> SPEED_SHIFT) & SPEED_MASK) as u8);
        let magnitude = (raw >> MAGNITUDE_SHIFT) & MAGNITUDE_MASK;
        Self {
            mode,
            speed_rpm: table.lookup(index),
            magnitude,
        }
    }

    /// Wall time this command occupies, in seconds, on a ring of
    /// `ticks_per_rev` positions. Speed is minutes-per-revolution based:
    /// `steps * 60 / rpm / N`.
    ///
    /// Follow-seconds commands have no fixed duration; they report zero.
    pub fn travel_time_s(&self, ticks_per_rev: u16) -> f32 {
        if self.is_follow_seconds() || self.speed_rpm == 0 {
            return 0.0;
        }
        (self.magnitude as f32) * 60.0 / (self.speed_rpm as f32) / (ticks_per_rev as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags() {
        let mode = CmdMode::CLOCKWISE | CmdMode::GHOST;
        assert!(mode.ghost());
        assert!(mode.clockwise());
        assert!(mode.relative());
        assert!(!mode.absolute());
        assert_eq!(mode.without(CmdMode::GHOST), CmdMode::CLOCKWISE);
    }

    #[test]
    fn test_encode_bit_layout() {
        let table = SpeedTable::default();
        // speed 8 is table index 3
        let cmd = Command::new(CmdMode::CLOCKWISE, 30, 8);
        let raw = cmd.encode(&table);
        assert_eq!(raw & 0b111, 0b010); // mode
        assert_eq!((raw >> 3) & 0b111, 3); // speed index
        assert_eq!(raw >> 6, 30); // magnitude
    }

    #[test]
    fn test_roundtrip_table_speeds() {
        let table = SpeedTable::default();
        for &rpm in table.entries() {
            for magnitude in [0u16, 1, 511, MAX_TRAVEL] {
                for mode in [
                    CmdMode::RELATIVE,
                    CmdMode::CLOCKWISE,
                    CmdMode::GHOST | CmdMode::CLOCKWISE,
                ] {
                    let cmd = Command::new(mode, magnitude, rpm);
                    let back = Command::decode(cmd.encode(&table), &table);
                    assert_eq!(back, cmd);
                }
            }
        }
    }

    #[test]
    fn test_quantization_rounds_down() {
        let table = SpeedTable::default();
        // 10 rpm is not in the table; nearest entry not above it is 8
        let cmd = Command::new(CmdMode::CLOCKWISE, 100, 10);
        let back = Command::decode(cmd.encode(&table), &table);
        assert_eq!(back.speed_rpm, 8);
        assert_eq!(back.magnitude, 100);
        assert_eq!(back.mode, CmdMode::CLOCKWISE);
    }

    #[test]
    fn test_quantization_below_table_minimum() {
        let table = SpeedTable::new([4, 8, 12, 16, 24, 32, 48, 64]);
        // Below every entry: falls back to index 0
        let cmd = Command::new(CmdMode::CLOCKWISE, 5, 2);
        let back = Command::decode(cmd.encode(&table), &table);
        assert_eq!(back.speed_rpm, 4);
    }

    #[test]
    fn test_quantization_sweep_matches_nearest_not_above() {
        let table = SpeedTable::default();
        for rpm in 1..=128u16 {
            let rpm = rpm as u8;
            let quantized = table.lookup(table.quantize(rpm));
            let expected = table
                .entries()
                .iter()
                .copied()
                .filter(|&s| s <= rpm)
                .max()
                .unwrap_or(table.entries()[0]);
            assert_eq!(quantized, expected, "rpm={}", rpm);
        }
    }

    #[test]
    fn test_follow_seconds_sentinels() {
        let smooth = Command::follow_seconds(8, false);
        let discrete = Command::follow_seconds(8, true);
        assert_eq!(smooth.magnitude, FOLLOW_SECONDS);
        assert_eq!(discrete.magnitude, FOLLOW_SECONDS_DISCRETE);
        assert!(smooth.is_follow_seconds());
        assert!(discrete.is_follow_seconds());

        let table = SpeedTable::default();
        let back = Command::decode(smooth.encode(&table), &table);
        assert!(back.is_follow_seconds());
    }

    #[test]
    fn test_travel_time() {
        // 720 steps (one revolution) at 60 rpm = 1 second
        let cmd = Command::new(CmdMode::CLOCKWISE, 720, 60);
        let t = cmd.travel_time_s(720);
        assert!((t - 1.0).abs() < 1e-6);

        // Half a revolution at 8 rpm = 60 / 8 / 2 seconds
        let cmd = Command::new(CmdMode::CLOCKWISE, 360, 8);
        let t = cmd.travel_time_s(720);
        assert!((t - 3.75).abs() < 1e-6);
    }
}
