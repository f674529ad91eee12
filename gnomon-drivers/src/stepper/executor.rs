//! Queued-command execution for one motor
//!
//! A follower receives a batch as raw 16-bit words (`BeginBatch` clears the
//! queue, `AddCommands` appends, `EndBatch` supplies the speed table and
//! starts execution). The executor walks the queue one command at a time:
//!
//! - plain travel: ramped stepping for the command's step count
//! - ghost: the same timing with no physical motion, so this hand keeps
//!   pace with the ensemble while "waiting"
//! - follow-seconds: chase the wall-clock fraction of the current
//!   scheduling period, smoothly or in one-second jumps
//!
//! When the batch's ramp-detect flag is set for this hand, a command that
//! reverses direction at speed is split: a few steps at turn speed ramp the
//! rotor into and out of the turn, keeping the net step count intact.
//!
//! An invalid word is logged once, dropped, and the queue continues - a bad
//! command must never halt the rest of the sequence.

use heapless::Vec;

use gnomon_protocol::command::{Command, SpeedTable, FOLLOW_SECONDS_DISCRETE};
use gnomon_protocol::messages::MAX_CMDS_PER_HAND;

use embedded_hal::digital::{InputPin, OutputPin};

use super::motor::RampedStepper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Between commands (or before `start`)
    Idle,
    /// Shedding into / out of a fast reversal at turn speed
    RampIn { left: u16 },
    Travel { left: u16 },
    RampOut { left: u16 },
    /// Chasing the wall clock until the batch is replaced
    Follow { discrete: bool },
}

/// Per-motor command queue and execution state machine
pub struct CommandExecutor {
    words: Vec<u16, MAX_CMDS_PER_HAND>,
    next: usize,
    active: bool,
    table: SpeedTable,
    phase: Phase,

    ramp_detect: bool,
    turn_speed: u8,
    turn_steps: u16,

    /// Signed full speed of the command in flight
    speed: i16,
    /// Travel steps remaining after a ramp-in lead
    travel_after_ramp: u16,
    /// Ramp-out length pending after the travel phase
    ramp_out: u16,

    start_us: u64,
    millis_left: u32,
    follow_goal: Option<u16>,

    invalid: u32,
    invalid_logged: bool,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self {
            words: Vec::new(),
            next: 0,
            active: false,
            table: SpeedTable::default(),
            phase: Phase::Idle,
            ramp_detect: false,
            turn_speed: 8,
            turn_steps: 5,
            speed: 0,
            travel_after_ramp: 0,
            ramp_out: 0,
            start_us: 0,
            millis_left: 0,
            follow_goal: None,
            invalid: 0,
            invalid_logged: false,
        }
    }

    /// `BeginBatch`: atomically discard queued and in-flight work
    pub fn begin(&mut self) {
        self.words.clear();
        self.next = 0;
        self.active = false;
        self.phase = Phase::Idle;
        self.invalid_logged = false;
    }

    /// `AddCommands`: append raw words; extras beyond the queue are dropped
    /// and counted as invalid
    pub fn add_words(&mut self, words: &[u16]) {
        for &word in words {
            if self.words.push(word).is_err() {
                self.invalid += 1;
            }
        }
    }

    /// `EndBatch`: install the negotiated table and start executing
    #[allow(clippy::too_many_arguments)]
    pub fn start<S, D, Z>(
        &mut self,
        stepper: &mut RampedStepper<S, D, Z>,
        table: SpeedTable,
        ramp_detect: bool,
        millis_left: u32,
        turn_speed: u8,
        turn_steps: u8,
        now_us: u64,
    ) where
        S: OutputPin,
        D: OutputPin,
        Z: InputPin,
    {
        self.table = table;
        self.ramp_detect = ramp_detect;
        self.millis_left = millis_left;
        self.turn_speed = turn_speed;
        self.turn_steps = turn_steps as u16;
        self.next = 0;
        self.phase = Phase::Idle;
        self.start_us = now_us;
        self.active = true;
        stepper.sync(now_us);
    }

    /// Abort without clearing the queue (hot reset path calls `begin` next)
    pub fn stop(&mut self) {
        self.active = false;
        self.phase = Phase::Idle;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Invalid words seen (dropped, queue continued)
    pub fn invalid_count(&self) -> u32 {
        self.invalid
    }

    fn decode_at(&self, idx: usize) -> Option<Command> {
        self.words
            .get(idx)
            .map(|&word| Command::decode(word, &self.table))
    }

    /// Does the command at `idx` keep the rotor still (ghost or absent)?
    fn still_at(&self, idx: usize) -> bool {
        match self.decode_at(idx) {
            None => true,
            Some(cmd) => cmd.mode.ghost() || cmd.is_empty(),
        }
    }

    /// Fetch the next queued command and set up its phases
    fn fetch<S, D, Z>(&mut self, stepper: &mut RampedStepper<S, D, Z>, now_us: u64)
    where
        S: OutputPin,
        D: OutputPin,
        Z: InputPin,
    {
        loop {
            let idx = self.next;
            let Some(cmd) = self.decode_at(idx) else {
                // queue exhausted
                self.active = false;
                stepper.set_speed_rpm(0);
                return;
            };
            self.next += 1;

            if cmd.is_follow_seconds() {
                stepper.set_ghost(false);
                stepper.assume_speed_rpm(self.turn_speed as i16);
                stepper.set_speed_rpm(self.turn_speed as i16);
                stepper.sync(now_us);
                self.follow_goal = None;
                self.phase = Phase::Follow {
                    discrete: cmd.magnitude == FOLLOW_SECONDS_DISCRETE,
                };
                return;
            }

            if cmd.magnitude == 0 || cmd.speed_rpm == 0 {
                if !self.invalid_logged {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("invalid command word {=u16:x}, dropping", self.words[idx]);
                    self.invalid_logged = true;
                }
                self.invalid += 1;
                continue;
            }

            let sign: i16 = if cmd.mode.clockwise() { 1 } else { -1 };
            self.speed = sign * cmd.speed_rpm as i16;
            let mut steps = cmd.magnitude;

            if cmd.mode.ghost() {
                stepper.set_ghost(true);
                // Standing still, so presume the rotor already paces at speed
                stepper.assume_speed_rpm(self.speed);
                stepper.set_speed_rpm(self.speed);
                self.ramp_out = 0;
                self.phase = Phase::Travel { left: steps };
                return;
            }
            stepper.set_ghost(false);

            let fast = cmd.speed_rpm > self.turn_speed;
            let ramp_in = self.ramp_detect
                && fast
                && (idx == 0
                    || self.still_at(idx - 1)
                    || self.direction_at(idx - 1) != Some(cmd.mode.clockwise()));
            let ramp_out = self.ramp_detect
                && fast
                && (self.still_at(idx + 1)
                    || self.direction_at(idx + 1) != Some(cmd.mode.clockwise()));

            let ramp_in = if ramp_in && steps > self.turn_steps {
                steps -= self.turn_steps;
                self.turn_steps
            } else {
                0
            };
            self.ramp_out = if ramp_out && steps > self.turn_steps {
                steps -= self.turn_steps;
                self.turn_steps
            } else {
                0
            };

            if ramp_in > 0 {
                // Enter the move at turn speed and let the ramp pull toward
                // the full speed across the lead-in steps
                stepper.assume_speed_rpm(sign * self.turn_speed as i16);
                stepper.set_speed_rpm(self.speed);
                self.phase = Phase::RampIn { left: ramp_in };
            } else {
                stepper.set_speed_rpm(self.speed);
                self.phase = Phase::Travel { left: steps };
            }
            // steps still to travel at full speed after a lead-in
            self.travel_after_ramp = steps;
            return;
        }
    }

    fn direction_at(&self, idx: usize) -> Option<bool> {
        self.decode_at(idx).map(|cmd| cmd.mode.clockwise())
    }

    /// Advance execution; call every scheduler tick
    pub fn poll<S, D, Z>(&mut self, stepper: &mut RampedStepper<S, D, Z>, now_us: u64)
    where
        S: OutputPin,
        D: OutputPin,
        Z: InputPin,
    {
        if !self.active {
            return;
        }
        match self.phase {
            Phase::Idle => self.fetch(stepper, now_us),

            Phase::RampIn { left } => {
                if left == 0 {
                    self.phase = Phase::Travel {
                        left: self.travel_after_ramp,
                    };
                } else if stepper.try_step(now_us) {
                    self.phase = Phase::RampIn { left: left - 1 };
                }
            }

            Phase::Travel { left } => {
                if left == 0 {
                    stepper.set_ghost(false);
                    if self.ramp_out > 0 {
                        let sign: i16 = if self.speed >= 0 { 1 } else { -1 };
                        stepper.set_speed_rpm(sign * self.turn_speed as i16);
                        self.phase = Phase::RampOut {
                            left: self.ramp_out,
                        };
                    } else {
                        self.phase = Phase::Idle;
                    }
                } else if stepper.try_step(now_us) {
                    self.phase = Phase::Travel { left: left - 1 };
                }
            }

            Phase::RampOut { left } => {
                if left == 0 {
                    self.phase = Phase::Idle;
                } else if stepper.try_step(now_us) {
                    self.phase = Phase::RampOut { left: left - 1 };
                }
            }

            Phase::Follow { discrete } => self.follow_seconds(stepper, now_us, discrete),
        }
    }

    /// Chase the wall clock: the hand's goal is the fraction of the current
    /// scheduling period that has elapsed, mapped onto the ring
    fn follow_seconds<S, D, Z>(
        &mut self,
        stepper: &mut RampedStepper<S, D, Z>,
        now_us: u64,
        discrete: bool,
    ) where
        S: OutputPin,
        D: OutputPin,
        Z: InputPin,
    {
        let current = stepper.ticks();
        if self.follow_goal.is_none() || self.follow_goal == Some(current) {
            let n = stepper.ring().size() as u64;
            let elapsed_ms = now_us.wrapping_sub(self.start_us) / 1_000;
            let goal = if self.millis_left == 0 || elapsed_ms > self.millis_left as u64 {
                0
            } else if discrete {
                // Jump second by second: ceil of the elapsed seconds
                let seconds = (60 * elapsed_ms).div_ceil(self.millis_left as u64);
                stepper.ring().normalize((n * seconds / 60) as i32)
            } else {
                stepper
                    .ring()
                    .normalize((n * elapsed_ms / self.millis_left as u64) as i32)
            };
            self.follow_goal = Some(goal);
        }
        if self.follow_goal != Some(current) {
            stepper.try_step(now_us);
        }
    }
}
