//! Decorative in-between choreographies
//!
//! Short figures played between showing one time and the next, purely for
//! show coverage: every hand moves to an intermediate pose derived from its
//! node's place in the grid, the ensemble pauses in lockstep, then scripted
//! relative offsets run (some with randomized magnitude). The only
//! requirement on these is that every emitted command is valid.

use core::f32::consts::PI;

use libm::atan2f;

use crate::hands::{GoalState, HandId, NodeId};
use crate::rng::SmallRng;

use super::{DirectionPolicy, Plan};

/// Choreography selection; `Random` picks one of the concrete figures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InBetween {
    #[default]
    None,
    /// Hands radiate outward from the display centre, then spin a revolution
    Star,
    /// Rows sweep half a revolution in alternating directions
    PacMan,
    /// Each unit forms a dash at a random angle, then jitters
    Dash,
    /// Everything points at the display centre, then unwinds
    Middle,
    Random,
}

/// Display centre in node-grid coordinates (3 rows x 8 columns)
const CENTRE_ROW: f32 = 1.0;
const CENTRE_COL: f32 = 3.5;

/// Tick at which a node's hands point straight away from the display centre
fn outward_tick(plan: &Plan, node: NodeId) -> u16 {
    let (row, col) = node.grid_position();
    let dx = col as f32 - CENTRE_COL;
    let dy = row as f32 - CENTRE_ROW;
    // Angle measured clockwise from 12 o'clock; grid rows grow downward
    let theta = atan2f(dx, -dy);
    let n = plan.ring().size() as f32;
    plan.ring().normalize((theta / (2.0 * PI) * n + 0.5) as i32)
}

fn goals_star(plan: &Plan) -> GoalState {
    let mut goals: GoalState = [None; 48];
    for node in NodeId::all() {
        let tick = outward_tick(plan, node);
        goals[node.short_hand().0 as usize] = Some(tick);
        goals[node.long_hand().0 as usize] = Some(tick);
    }
    goals
}

fn goals_middle(plan: &Plan) -> GoalState {
    let half = plan.ring().size() / 2;
    let mut goals = goals_star(plan);
    for goal in goals.iter_mut().flatten() {
        *goal = plan.ring().normalize(*goal as i32 + half as i32);
    }
    goals
}

fn goals_pacman(plan: &Plan) -> GoalState {
    let quarter = plan.ring().size() / 4;
    let mut goals: GoalState = [None; 48];
    for node in NodeId::all() {
        let (row, _) = node.grid_position();
        // Even rows look east, odd rows west
        let tick = if row % 2 == 0 { quarter } else { 3 * quarter };
        goals[node.short_hand().0 as usize] = Some(tick);
        goals[node.long_hand().0 as usize] = Some(tick);
    }
    goals
}

fn goals_dash(plan: &Plan, rng: &mut SmallRng) -> GoalState {
    let n = plan.ring().size();
    let mut goals: GoalState = [None; 48];
    for node in NodeId::all() {
        // A dash: the two hands oppose at a random orientation
        let tick = rng.next_range(n as u32) as u16;
        goals[node.short_hand().0 as usize] = Some(tick);
        goals[node.long_hand().0 as usize] = Some(plan.ring().normalize(tick as i32 + n as i32 / 2));
    }
    goals
}

/// Play the chosen figure into `plan`
pub fn apply(kind: InBetween, plan: &mut Plan, rng: &mut SmallRng, speed_rpm: u8) {
    let kind = match kind {
        InBetween::Random => match rng.next_range(4) {
            0 => InBetween::Star,
            1 => InBetween::PacMan,
            2 => InBetween::Dash,
            _ => InBetween::Middle,
        },
        other => other,
    };
    if kind == InBetween::None {
        return;
    }

    let goals = match kind {
        InBetween::Star => goals_star(plan),
        InBetween::PacMan => goals_pacman(plan),
        InBetween::Dash => goals_dash(plan, rng),
        InBetween::Middle => goals_middle(plan),
        InBetween::None | InBetween::Random => return,
    };

    // Strike the pose, arriving together
    plan.plan_direct(&goals, DirectionPolicy::Shortest, speed_rpm);
    plan.ghost_align(speed_rpm);

    // Scripted follow-through
    let n = plan.ring().size() as i32;
    match kind {
        InBetween::Star => {
            for hand in HandId::all() {
                plan.add_relative(hand, n, speed_rpm);
            }
        }
        InBetween::Middle => {
            for hand in HandId::all() {
                plan.add_relative(hand, -n, speed_rpm);
            }
        }
        InBetween::PacMan => {
            for hand in HandId::all() {
                let (row, _) = hand.node().grid_position();
                let steps = if row % 2 == 0 { n / 2 } else { -n / 2 };
                plan.add_relative(hand, steps, speed_rpm);
            }
        }
        InBetween::Dash => {
            for node in NodeId::all() {
                // Both hands of a unit jitter by the same random amount so
                // the dash stays a dash; columns alternate direction
                let steps = rng.next_between(60, 180) as i32;
                let (_, col) = node.grid_position();
                let steps = if col % 2 == 0 { steps } else { -steps };
                plan.add_relative(node.short_hand(), steps, speed_rpm);
                plan.add_relative(node.long_hand(), steps, speed_rpm);
            }
        }
        InBetween::None | InBetween::Random => {}
    }
    plan.ghost_align(speed_rpm);
}
