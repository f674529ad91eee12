//! Synchronized swipe: move the whole ensemble through one staging tick
//!
//! Used when an animation should pass every hand through a single moment of
//! visual alignment. The staging tick is chosen by exhaustive search: the one
//! minimizing the worst-case per-hand total travel
//! `dist(from, stage) + dist(stage, goal)`. All hands then ghost-wait until
//! simultaneously ready, travel to the stage, pause in lockstep, travel to
//! their goals, and ghost-pad again so they finish together.

use crate::hands::{GoalState, HandId};

use super::{DirectionPolicy, Plan};

/// Steps of shared pause at the staging tick
fn pause_steps(speed_rpm: u8) -> u16 {
    (100 / speed_rpm.max(1) as u16).max(1)
}

/// Worst-case travel through `stage` across all participating hands
fn max_total_via(
    plan: &Plan,
    goals: &GoalState,
    policy: DirectionPolicy,
    stage: u16,
    early_out: u32,
) -> u32 {
    let ring = plan.ring();
    let mut worst = 0u32;
    for hand in HandId::all() {
        let Some(from) = plan.state().position(hand) else {
            continue;
        };
        let Some(to) = goals[hand.0 as usize] else {
            continue;
        };
        let total = policy.signed_steps(ring, from, stage).unsigned_abs()
            + policy.signed_steps(ring, stage, to).unsigned_abs();
        if total > worst {
            worst = total;
            if worst > early_out {
                // cannot beat the current best, stop scoring this candidate
                break;
            }
        }
    }
    worst
}

/// Find the staging tick minimizing the worst-case per-hand total travel
pub fn find_staging_tick(plan: &Plan, goals: &GoalState, policy: DirectionPolicy) -> u16 {
    let ring = plan.ring();
    let mut best_tick = 0u16;
    let mut best_worst = u32::MAX;
    for stage in 0..ring.size() {
        let worst = max_total_via(plan, goals, policy, stage, best_worst);
        if worst < best_worst {
            best_worst = worst;
            best_tick = stage;
        }
    }
    best_tick
}

/// Swipe through an explicitly chosen staging tick
pub fn plan_swipe_via(
    plan: &mut Plan,
    goals: &GoalState,
    policy: DirectionPolicy,
    speed_rpm: u8,
    stage: u16,
) {
    let ring = plan.ring();
    let stage = ring.normalize(stage as i32);

    // Longest leg into and out of the stage, over participating hands
    let mut max_in = 0u32;
    let mut max_out = 0u32;
    for hand in HandId::all() {
        let Some(from) = plan.state().position(hand) else {
            continue;
        };
        let Some(to) = goals[hand.0 as usize] else {
            continue;
        };
        max_in = max_in.max(policy.signed_steps(ring, from, stage).unsigned_abs());
        max_out = max_out.max(policy.signed_steps(ring, stage, to).unsigned_abs());
    }

    for hand in HandId::all() {
        let Some(from) = plan.state().position(hand) else {
            continue;
        };
        let Some(to) = goals[hand.0 as usize] else {
            continue;
        };

        // Wait until everyone is ready to arrive at the stage together
        let inbound = policy.signed_steps(ring, from, stage);
        plan.add_ghost(hand, (max_in - inbound.unsigned_abs()) as u16, speed_rpm);
        plan.add_relative(hand, inbound, speed_rpm);

        // Shared beat at the stage
        plan.add_ghost(hand, pause_steps(speed_rpm), speed_rpm);

        // On to the goal, padding so all finish simultaneously
        let outbound = policy.signed_steps(ring, stage, to);
        plan.add_relative(hand, outbound, speed_rpm);
        plan.add_ghost(hand, (max_out - outbound.unsigned_abs()) as u16, speed_rpm);
    }
}

/// Swipe the ensemble through the optimal staging tick
pub fn plan_swipe(plan: &mut Plan, goals: &GoalState, policy: DirectionPolicy, speed_rpm: u8) {
    let stage = find_staging_tick(plan, goals, policy);
    #[cfg(feature = "defmt")]
    defmt::debug!("swipe staging tick: {}", stage);
    plan_swipe_via(plan, goals, policy, speed_rpm, stage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hands::HandsState;
    use crate::ticks::{Ring, RING};

    fn plan_with(ring: Ring, positions: &[(u8, u16)]) -> Plan {
        let mut state = HandsState::new();
        for &(hand, tick) in positions {
            state.set_position(HandId(hand), tick);
        }
        Plan::new(ring, state)
    }

    fn brute_force_best(plan: &Plan, goals: &GoalState, policy: DirectionPolicy) -> u32 {
        let ring = plan.ring();
        let mut best = u32::MAX;
        for stage in 0..ring.size() {
            let mut worst = 0u32;
            for hand in HandId::all() {
                let (Some(from), Some(to)) =
                    (plan.state().position(hand), goals[hand.0 as usize])
                else {
                    continue;
                };
                worst = worst.max(
                    policy.signed_steps(ring, from, stage).unsigned_abs()
                        + policy.signed_steps(ring, stage, to).unsigned_abs(),
                );
            }
            best = best.min(worst);
        }
        best
    }

    #[test]
    fn test_staging_tick_is_globally_optimal() {
        // Small ring so the brute-force reference stays readable
        let ring = Ring(24);
        let plan = plan_with(ring, &[(0, 2), (1, 10), (2, 17), (3, 5)]);
        let mut goals: GoalState = [None; 48];
        goals[0] = Some(20);
        goals[1] = Some(3);
        goals[2] = Some(8);
        goals[3] = Some(12);

        let policy = DirectionPolicy::Shortest;
        let stage = find_staging_tick(&plan, &goals, policy);
        let chosen_worst = {
            let ring = plan.ring();
            let mut worst = 0u32;
            for hand in [0u8, 1, 2, 3] {
                let from = plan.state().position(HandId(hand)).unwrap();
                let to = goals[hand as usize].unwrap();
                worst = worst.max(
                    policy.signed_steps(ring, from, stage).unsigned_abs()
                        + policy.signed_steps(ring, stage, to).unsigned_abs(),
                );
            }
            worst
        };
        assert_eq!(chosen_worst, brute_force_best(&plan, &goals, policy));
    }

    #[test]
    fn test_swipe_reaches_goals() {
        let mut plan = plan_with(RING, &[(0, 2), (1, 100), (2, 550)]);
        let mut goals: GoalState = [None; 48];
        goals[0] = Some(20);
        goals[1] = Some(300);
        goals[2] = Some(710);

        plan_swipe(&mut plan, &goals, DirectionPolicy::Shortest, 12);

        for hand in [0u8, 1, 2] {
            assert_eq!(
                plan.state().position(HandId(hand)),
                goals[hand as usize],
                "hand {}",
                hand
            );
        }
    }

    #[test]
    fn test_swipe_finishes_in_lockstep() {
        let mut plan = plan_with(RING, &[(0, 0), (1, 360), (2, 100)]);
        let mut goals: GoalState = [None; 48];
        goals[0] = Some(180);
        goals[1] = Some(0);
        goals[2] = Some(600);

        plan_swipe(&mut plan, &goals, DirectionPolicy::Shortest, 8);

        // Everything runs at one speed, so equal accumulated time means
        // simultaneous arrival
        let t0 = plan.state().seconds(HandId(0));
        for hand in [1u8, 2] {
            let t = plan.state().seconds(HandId(hand));
            assert!((t - t0).abs() < 1e-3, "hand {} t={} t0={}", hand, t, t0);
        }
    }

    #[test]
    fn test_swipe_skips_unknown_hands() {
        let mut plan = plan_with(RING, &[(0, 0)]);
        let mut goals: GoalState = [None; 48];
        goals[0] = Some(100);
        goals[1] = Some(200); // hand 1 is unknown

        plan_swipe(&mut plan, &goals, DirectionPolicy::Shortest, 8);

        assert!(plan.commands().iter().all(|p| p.hand == HandId(0)));
        assert_eq!(plan.skipped(), 0); // unknown hands never even planned
    }
}
