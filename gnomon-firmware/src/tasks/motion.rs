//! Motion task: homing and command execution for both hands
//!
//! Owns the two steppers. Runs a tight cooperative loop: poll both motors,
//! drain the mailbox, yield. Nothing in here blocks - the stepper and
//! executor state machines keep their own deadlines, so a late poll shifts
//! a pulse but never loses one.

use defmt::*;
use embassy_rp::gpio::{Input, Output};
use embassy_time::{Instant, Timer};

use gnomon_drivers::stepper::{CommandExecutor, HomingSequence, RampedStepper};
use gnomon_protocol::command::SpeedTable;

use crate::channels::{MotionMsg, PositionReport, MOTION, POSITIONS};

type Motor = RampedStepper<Output<'static>, Output<'static>, Input<'static>>;

/// Poll period of the motion loop; well under the fastest step delay
const LOOP_US: u64 = 100;

/// Default park positions before the coordinator sends calibration:
/// the short hand at half past, the long hand at twelve
const DEFAULT_INITIAL: [i16; 2] = [360, 0];

/// Stepper control task for both hands of this node
#[embassy_executor::task]
pub async fn motion_task(mut motor0: Motor, mut motor1: Motor) {
    info!("motion task started");

    let mut homing0 = HomingSequence::new(DEFAULT_INITIAL[0]);
    let mut homing1 = HomingSequence::new(DEFAULT_INITIAL[1]);
    let mut exec0 = CommandExecutor::new();
    let mut exec1 = CommandExecutor::new();

    let now = Instant::now().as_micros();
    homing0.begin(&mut motor0, now);
    homing1.begin(&mut motor1, now);

    loop {
        let now = Instant::now().as_micros();

        if homing0.busy() || homing1.busy() {
            homing0.poll(&mut motor0, now);
            homing1.poll(&mut motor1, now);
        } else {
            exec0.poll(&mut motor0, now);
            exec1.poll(&mut motor1, now);
        }

        while let Ok(msg) = MOTION.try_receive() {
            handle_message(
                msg,
                &mut motor0,
                &mut motor1,
                &mut homing0,
                &mut homing1,
                &mut exec0,
                &mut exec1,
            );
        }

        Timer::after_micros(LOOP_US).await;
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_message(
    msg: MotionMsg,
    motor0: &mut Motor,
    motor1: &mut Motor,
    homing0: &mut HomingSequence,
    homing1: &mut HomingSequence,
    exec0: &mut CommandExecutor,
    exec1: &mut CommandExecutor,
) {
    match msg {
        MotionMsg::Begin => {
            exec0.begin();
            exec1.begin();
        }

        MotionMsg::Add { hand, words } => {
            let exec = if hand == 0 { exec0 } else { exec1 };
            exec.add_words(&words);
        }

        MotionMsg::Start {
            speed_table,
            ramp_detect0,
            ramp_detect1,
            millis_left,
            turn_speed,
            turn_steps,
        } => {
            if homing0.busy() || homing1.busy() {
                warn!("batch start while homing, ignoring");
                return;
            }
            let table = SpeedTable::new(speed_table);
            let now = Instant::now().as_micros();
            exec0.start(
                motor0,
                table,
                ramp_detect0,
                millis_left,
                turn_speed,
                turn_steps,
                now,
            );
            exec1.start(
                motor1,
                table,
                ramp_detect1,
                millis_left,
                turn_speed,
                turn_steps,
                now,
            );
            debug!("batch started, {} ms left in period", millis_left);
        }

        MotionMsg::Config {
            magnet_offset0,
            magnet_offset1,
            initial_ticks0,
            initial_ticks1,
        } => {
            let mut changed = motor0.set_offset_steps(magnet_offset0);
            changed |= motor1.set_offset_steps(magnet_offset1);
            changed |= homing0.set_initial_ticks(initial_ticks0);
            changed |= homing1.set_initial_ticks(initial_ticks1);
            if changed {
                info!(
                    "calibration: offsets ({}, {}), initial ({}, {})",
                    magnet_offset0, magnet_offset1, initial_ticks0, initial_ticks1
                );
                let now = Instant::now().as_micros();
                homing0.begin(motor0, now);
                homing1.begin(motor1, now);
            }
        }

        MotionMsg::Home => {
            exec0.stop();
            exec1.stop();
            let now = Instant::now().as_micros();
            homing0.begin(motor0, now);
            homing1.begin(motor1, now);
        }

        MotionMsg::Stop => {
            exec0.stop();
            exec1.stop();
        }

        MotionMsg::QueryPositions => {
            let ready = !homing0.busy() && !homing1.busy() && !exec0.is_active() && !exec1.is_active();
            POSITIONS.signal(PositionReport {
                pos0: motor0.ticks(),
                pos1: motor1.ticks(),
                ready,
            });
        }
    }
}
