//! Motion planner / animation engine
//!
//! The planner turns "these 48 hands should end up here" into an ordered,
//! time-consistent list of per-hand commands. It owns a *simulated*
//! [`HandsState`]: every command it emits is also applied to the simulation,
//! so the state always mirrors what the hardware will reach, never what it
//! has reached.
//!
//! Planning is coordinator-side work; the output feeds the batch transport.

pub mod choreography;
pub mod swipe;

use heapless::Vec;

use gnomon_protocol::command::{CmdMode, Command, MAX_TRAVEL};
use gnomon_protocol::messages::MAX_HANDS;

use crate::hands::{GoalState, HandId, HandsState, NodeId};
use crate::ticks::Ring;

pub use choreography::InBetween;

/// Speed at or below which a direction reversal needs no ramp handling
pub const TURN_SPEED_RPM: u8 = 8;

/// Steps shed at turn speed on either side of a fast reversal
pub const TURN_STEPS: u8 = 5;

/// Upper bound on commands in one plan
pub const MAX_PLAN_CMDS: usize = 1024;

/// How to travel from a current tick to a goal tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DirectionPolicy {
    /// Whichever way is fewer steps (ties clockwise)
    Shortest,
    Clockwise,
    Anticlockwise,
}

impl DirectionPolicy {
    /// Signed steps from `from` to `to` under this policy
    /// (positive = clockwise)
    pub fn signed_steps(self, ring: Ring, from: u16, to: u16) -> i32 {
        match self {
            DirectionPolicy::Shortest => ring.shortest_signed(from, to),
            DirectionPolicy::Clockwise => ring.clockwise(from, to) as i32,
            DirectionPolicy::Anticlockwise => -(ring.anticlockwise(from, to) as i32),
        }
    }
}

/// One planned command, bound to the hand that will run it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PlannedCmd {
    pub hand: HandId,
    pub cmd: Command,
}

/// A motion plan under construction
#[derive(Debug, Clone)]
pub struct Plan {
    ring: Ring,
    state: HandsState,
    cmds: Vec<PlannedCmd, MAX_PLAN_CMDS>,
    last_idx: [Option<u16>; MAX_HANDS],
    /// Tag fast reversals so the executor sheds speed before the turn
    swap_speed_detection: bool,
    turn_speed: u8,
    skipped: u32,
    overflowed: bool,
}

impl Plan {
    /// Start a plan from the current simulated state (normally seeded from
    /// the last position scan)
    pub fn new(ring: Ring, mut state: HandsState) -> Self {
        state.reset_seconds();
        Self {
            ring,
            state,
            cmds: Vec::new(),
            last_idx: [None; MAX_HANDS],
            swap_speed_detection: true,
            turn_speed: TURN_SPEED_RPM,
            skipped: 0,
            overflowed: false,
        }
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub fn state(&self) -> &HandsState {
        &self.state
    }

    /// Commands emitted so far, in emission order
    pub fn commands(&self) -> &[PlannedCmd] {
        &self.cmds
    }

    /// Commands dropped because the hand's state was unknown
    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    /// Did any command fail to fit? (The plan is unusable if so.)
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn set_swap_speed_detection(&mut self, enabled: bool) {
        self.swap_speed_detection = enabled;
    }

    /// Queue a command for a hand.
    ///
    /// Absolute commands are converted to relative against the simulated
    /// state (followers only understand relative motion). Zero-distance
    /// relative commands are dropped rather than encoded - they would waste
    /// bus bandwidth as no-ops. A relative command for a hand in unknown
    /// state is skipped and counted, never fatal.
    pub fn add(&mut self, hand: HandId, cmd: Command) {
        let cmd = if cmd.mode.absolute() {
            match self.to_relative(hand, cmd) {
                Some(cmd) => cmd,
                None => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("hand {} has no known state, skipping command", hand.0);
                    self.skipped += 1;
                    return;
                }
            }
        } else {
            cmd
        };

        if cmd.magnitude == 0 && !cmd.is_follow_seconds() {
            return;
        }
        if !cmd.mode.ghost() && !cmd.is_follow_seconds() && !self.state.known(hand) {
            #[cfg(feature = "defmt")]
            defmt::warn!("hand {} has no known state, skipping command", hand.0);
            self.skipped += 1;
            return;
        }

        self.tag_reversal(hand, &cmd);
        self.push(hand, cmd);
    }

    /// Queue a timing-only ghost of `steps` at `speed_rpm`
    pub fn add_ghost(&mut self, hand: HandId, steps: u16, speed_rpm: u8) {
        self.add(hand, Command::new(CmdMode::GHOST, steps, speed_rpm));
    }

    /// Queue a relative move of `steps` signed steps
    pub fn add_relative(&mut self, hand: HandId, steps: i32, speed_rpm: u8) {
        let mode = if steps >= 0 {
            CmdMode::CLOCKWISE
        } else {
            CmdMode::RELATIVE
        };
        self.add(
            hand,
            Command::new(mode, steps.unsigned_abs().min(MAX_TRAVEL as u32) as u16, speed_rpm),
        );
    }

    fn to_relative(&self, hand: HandId, cmd: Command) -> Option<Command> {
        let from = self.state.position(hand)?;
        let to = cmd.magnitude;
        let steps = if cmd.mode.clockwise() {
            self.ring.clockwise(from, to)
        } else {
            self.ring.anticlockwise(from, to)
        };
        Some(Command::new(
            cmd.mode.without(CmdMode::ABSOLUTE),
            steps,
            cmd.speed_rpm,
        ))
    }

    /// When a hand reverses direction above the turn speed, tag the previous
    /// command so the executor ramps down into the turn and back up out of it.
    fn tag_reversal(&mut self, hand: HandId, cmd: &Command) {
        if !self.swap_speed_detection {
            return;
        }
        let Some(last_idx) = self.last_idx[hand.0 as usize] else {
            return;
        };
        let last = &mut self.cmds[last_idx as usize].cmd;
        if last.mode.clockwise() == cmd.mode.clockwise() {
            return;
        }
        if last.speed_rpm.max(cmd.speed_rpm) <= self.turn_speed {
            return;
        }
        if last.mode.ghost() || cmd.mode.ghost() {
            return;
        }
        last.mode |= CmdMode::SWAP_SPEED;
    }

    fn push(&mut self, hand: HandId, cmd: Command) {
        if self.cmds.push(PlannedCmd { hand, cmd }).is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("plan full, dropping command for hand {}", hand.0);
            self.overflowed = true;
            return;
        }
        self.last_idx[hand.0 as usize] = Some((self.cmds.len() - 1) as u16);
        self.state
            .add_seconds(hand, cmd.travel_time_s(self.ring.size()));

        if cmd.mode.ghost() {
            // Timing only, position untouched
            return;
        }
        if cmd.is_follow_seconds() {
            // Position depends on when the batch ends
            self.state.clear_position(hand);
            return;
        }
        if let Some(current) = self.state.position(hand) {
            let signed = if cmd.mode.clockwise() {
                cmd.magnitude as i32
            } else {
                -(cmd.magnitude as i32)
            };
            self.state.set_position(hand, self.ring.offset(current, signed));
        }
    }

    /// Move every hand with a goal straight there under `policy`.
    ///
    /// Hands are paired per node: for each node the planner compares the
    /// direct assignment with the swapped one (hand A to goal B and vice
    /// versa) and takes whichever travels fewer total steps, so a unit's two
    /// hands do not needlessly cross.
    pub fn plan_direct(&mut self, goals: &GoalState, policy: DirectionPolicy, speed_rpm: u8) {
        for node in NodeId::all() {
            let h0 = node.short_hand();
            let h1 = node.long_hand();
            let goal0 = goals[h0.0 as usize];
            let goal1 = goals[h1.0 as usize];

            let from0 = self.state.position(h0);
            let from1 = self.state.position(h1);
            match (goal0, goal1, from0, from1) {
                (Some(to0), Some(to1), Some(from0), Some(from1)) => {
                    let direct = policy.signed_steps(self.ring, from0, to0).unsigned_abs()
                        + policy.signed_steps(self.ring, from1, to1).unsigned_abs();
                    let swapped = policy.signed_steps(self.ring, from0, to1).unsigned_abs()
                        + policy.signed_steps(self.ring, from1, to0).unsigned_abs();
                    if swapped < direct {
                        self.direct_move(h0, to1, policy, speed_rpm);
                        self.direct_move(h1, to0, policy, speed_rpm);
                    } else {
                        self.direct_move(h0, to0, policy, speed_rpm);
                        self.direct_move(h1, to1, policy, speed_rpm);
                    }
                }
                _ => {
                    if let Some(to) = goal0 {
                        self.direct_move(h0, to, policy, speed_rpm);
                    }
                    if let Some(to) = goal1 {
                        self.direct_move(h1, to, policy, speed_rpm);
                    }
                }
            }
        }
    }

    /// One hand straight to `to` under `policy`
    pub fn direct_move(&mut self, hand: HandId, to: u16, policy: DirectionPolicy, speed_rpm: u8) {
        let Some(from) = self.state.position(hand) else {
            self.skipped += 1;
            return;
        };
        let steps = policy.signed_steps(self.ring, from, to);
        if steps == 0 {
            return;
        }
        self.add_relative(hand, steps, speed_rpm);
    }

    /// Plan the display of a wall-clock time: every hand to its digit pose.
    ///
    /// `swipe` routes the ensemble through the optimal staging tick instead
    /// of moving each hand independently.
    pub fn show_time(
        &mut self,
        time: crate::traits::ClockTime,
        policy: DirectionPolicy,
        speed_rpm: u8,
        swipe: bool,
    ) {
        let goals = crate::glyphs::time_goals(self.ring, time);
        if swipe {
            swipe::plan_swipe(self, &goals, policy, speed_rpm);
        } else {
            self.plan_direct(&goals, policy, speed_rpm);
        }
    }

    /// Ghost-pad every known hand so all reach this point of their command
    /// lists at the same wall time. The slowest hand sets the pace; pads are
    /// issued at `speed_rpm`, converting the time gap back into steps.
    pub fn ghost_align(&mut self, speed_rpm: u8) {
        let target = self.state.max_seconds();
        for hand in HandId::all() {
            if !self.state.known(hand) {
                continue;
            }
            let gap = target - self.state.seconds(hand);
            if gap <= 0.0 {
                continue;
            }
            let steps =
                (gap * speed_rpm as f32 * self.ring.size() as f32 / 60.0 + 0.5) as u16;
            if steps > 0 {
                self.add_ghost(hand, steps.min(MAX_TRAVEL), speed_rpm);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticks::RING;

    fn known_state(positions: &[(u8, u16)]) -> HandsState {
        let mut state = HandsState::new();
        for &(hand, tick) in positions {
            state.set_position(HandId(hand), tick);
        }
        state
    }

    #[test]
    fn test_direct_move_shortest_crosses_zero() {
        // Hand at 700, goal 10: 30 clockwise, not 690 anticlockwise
        let mut plan = Plan::new(RING, known_state(&[(0, 700)]));
        let mut goals: GoalState = [None; 48];
        goals[0] = Some(10);
        plan.plan_direct(&goals, DirectionPolicy::Shortest, 8);

        assert_eq!(plan.commands().len(), 1);
        let planned = plan.commands()[0];
        assert_eq!(planned.hand, HandId(0));
        assert!(planned.cmd.mode.clockwise());
        assert!(planned.cmd.mode.relative());
        assert_eq!(planned.cmd.magnitude, 30);
        assert_eq!(plan.state().position(HandId(0)), Some(10));
    }

    #[test]
    fn test_zero_distance_moves_dropped() {
        let mut plan = Plan::new(RING, known_state(&[(0, 100), (1, 200)]));
        let mut goals: GoalState = [None; 48];
        goals[0] = Some(100);
        goals[1] = Some(200);
        plan.plan_direct(&goals, DirectionPolicy::Shortest, 8);
        assert!(plan.commands().is_empty());
    }

    #[test]
    fn test_unknown_hand_skipped_not_fatal() {
        let mut plan = Plan::new(RING, known_state(&[(0, 100)]));
        // Hand 2 was never homed
        let mut goals: GoalState = [None; 48];
        goals[0] = Some(200);
        goals[2] = Some(300);
        plan.plan_direct(&goals, DirectionPolicy::Shortest, 8);

        assert_eq!(plan.commands().len(), 1);
        assert_eq!(plan.commands()[0].hand, HandId(0));
        assert_eq!(plan.skipped(), 1);
    }

    #[test]
    fn test_absolute_converted_to_relative() {
        let mut plan = Plan::new(RING, known_state(&[(4, 0)]));
        plan.add(
            HandId(4),
            Command::new(CmdMode::ABSOLUTE | CmdMode::CLOCKWISE, 180, 8),
        );
        let cmd = plan.commands()[0].cmd;
        assert!(cmd.mode.relative());
        assert_eq!(cmd.magnitude, 180);
        assert_eq!(plan.state().position(HandId(4)), Some(180));
    }

    #[test]
    fn test_swap_optimization_never_worse_than_direct() {
        // Node 0: hands at (0, 360), goals crossing each other's start
        let mut plan = Plan::new(RING, known_state(&[(0, 0), (1, 360)]));
        let mut goals: GoalState = [None; 48];
        goals[0] = Some(350);
        goals[1] = Some(10);
        plan.plan_direct(&goals, DirectionPolicy::Shortest, 8);

        let total: u32 = plan
            .commands()
            .iter()
            .map(|p| p.cmd.magnitude as u32)
            .sum();
        let ring = RING;
        let direct = ring.shortest_signed(0, 350).unsigned_abs()
            + ring.shortest_signed(360, 10).unsigned_abs();
        let swapped = ring.shortest_signed(0, 10).unsigned_abs()
            + ring.shortest_signed(360, 350).unsigned_abs();
        assert_eq!(total, direct.min(swapped));
        assert_eq!(total, swapped); // swapping is the cheaper assignment here
    }

    #[test]
    fn test_swap_optimization_property_random_pairs() {
        let ring = RING;
        let mut rng = crate::rng::SmallRng::new(0xC10C);
        for _ in 0..200 {
            let from0 = rng.next_range(720) as u16;
            let from1 = rng.next_range(720) as u16;
            let to0 = rng.next_range(720) as u16;
            let to1 = rng.next_range(720) as u16;

            let mut plan = Plan::new(ring, known_state(&[(0, from0), (1, from1)]));
            let mut goals: GoalState = [None; 48];
            goals[0] = Some(to0);
            goals[1] = Some(to1);
            plan.plan_direct(&goals, DirectionPolicy::Shortest, 8);

            let total: u32 = plan
                .commands()
                .iter()
                .map(|p| p.cmd.magnitude as u32)
                .sum();
            let direct = ring.shortest_signed(from0, to0).unsigned_abs()
                + ring.shortest_signed(from1, to1).unsigned_abs();
            let swapped = ring.shortest_signed(from0, to1).unsigned_abs()
                + ring.shortest_signed(from1, to0).unsigned_abs();
            assert!(total <= direct.min(swapped));
        }
    }

    #[test]
    fn test_reversal_tagging() {
        let mut plan = Plan::new(RING, known_state(&[(0, 0)]));
        // Fast clockwise then fast anticlockwise
        plan.add_relative(HandId(0), 100, 32);
        plan.add_relative(HandId(0), -100, 32);
        let first = plan.commands()[0].cmd;
        assert!(first.mode.contains(CmdMode::SWAP_SPEED));

        // Slow reversals are left alone
        let mut plan = Plan::new(RING, known_state(&[(0, 0)]));
        plan.add_relative(HandId(0), 100, 4);
        plan.add_relative(HandId(0), -100, 4);
        assert!(!plan.commands()[0].cmd.mode.contains(CmdMode::SWAP_SPEED));
    }

    #[test]
    fn test_ghost_align_equalizes_time() {
        let mut plan = Plan::new(RING, known_state(&[(0, 0), (2, 0)]));
        // Hand 0 travels half a revolution, hand 2 nothing
        plan.add_relative(HandId(0), 360, 8);
        plan.ghost_align(8);

        let s0 = plan.state().seconds(HandId(0));
        let s2 = plan.state().seconds(HandId(2));
        assert!((s0 - s2).abs() < 0.05, "s0={} s2={}", s0, s2);

        // The pad is a ghost, so hand 2 did not move
        assert_eq!(plan.state().position(HandId(2)), Some(0));
    }

    #[test]
    fn test_show_time_reaches_digit_poses() {
        use crate::glyphs;
        use crate::traits::ClockTime;

        let mut state = HandsState::new();
        state.set_all(0, 360);
        let mut plan = Plan::new(RING, state);
        let time = ClockTime { hour: 12, minute: 34 };
        plan.show_time(time, DirectionPolicy::Shortest, 12, false);

        // Every hand ends on a tick the digit font uses (the swap
        // optimization may exchange a pair's goals, which is invisible on
        // the display since both hands of a unit are interchangeable)
        let goals = glyphs::time_goals(RING, time);
        for hand in HandId::all() {
            let node = hand.node();
            let pose = plan.state().position(hand);
            let a = goals[node.short_hand().0 as usize];
            let b = goals[node.long_hand().0 as usize];
            assert!(pose == a || pose == b, "hand {} at {:?}", hand.0, pose);
        }
    }

    #[test]
    fn test_show_time_with_swipe_reaches_digit_poses() {
        use crate::glyphs;
        use crate::traits::ClockTime;

        let mut state = HandsState::new();
        state.set_all(100, 500);
        let mut plan = Plan::new(RING, state);
        let time = ClockTime { hour: 8, minute: 15 };
        plan.show_time(time, DirectionPolicy::Shortest, 12, true);

        let goals = glyphs::time_goals(RING, time);
        for hand in HandId::all() {
            assert_eq!(
                plan.state().position(hand),
                goals[hand.0 as usize],
                "hand {}",
                hand.0
            );
        }
    }

    #[test]
    fn test_follow_seconds_clears_position() {
        let mut plan = Plan::new(RING, known_state(&[(0, 100)]));
        plan.add(HandId(0), Command::follow_seconds(8, false));
        assert_eq!(plan.commands().len(), 1);
        assert!(plan.state().position(HandId(0)).is_none());
    }
}
