//! Bus task: half-duplex RS-485 protocol handling and discovery
//!
//! Single owner of the transceiver. The direction gate is switched to
//! transmit only for our own sends; any outbound send first abandons an
//! in-progress receive (the frame parser is reset with the gate), and the
//! gate reverts to receive immediately after the bytes are flushed.

use defmt::*;
use embassy_futures::select::{select, Either};
use embassy_rp::gpio::{Input, Output};
use embassy_rp::uart::{BufferedUartRx, BufferedUartTx};
use embassy_time::{Instant, Timer};
use embedded_io_async::{Read, Write};

use gnomon_core::discovery::{Action, Actions, FollowerDiscovery};
use gnomon_protocol::frame::{encode_frame, FrameParser, MAX_FRAME_SIZE};
use gnomon_protocol::messages::{accepts, Header, Message};

use crate::channels::{MotionMsg, MOTION, POSITIONS};

/// Even address outside the assignable range, used until discovery gives us
/// a real one (only broadcasts are accepted then)
const UNASSIGNED: u8 = 0xFC;

/// Barrier poll period while listening
const POLL_MS: u64 = 2;

/// RS-485 direction gate (DE/RE pin pair)
pub struct DirectionGate {
    de: Output<'static>,
    re: Output<'static>,
}

impl DirectionGate {
    pub fn new(de: Output<'static>, re: Output<'static>) -> Self {
        let mut gate = Self { de, re };
        gate.receive();
        gate
    }

    fn transmit(&mut self) {
        self.de.set_high();
        self.re.set_high();
    }

    fn receive(&mut self) {
        self.de.set_low();
        self.re.set_low();
    }
}

/// Protocol task: owns the UART, the gate, and the barrier pins
#[embassy_executor::task]
pub async fn bus_task(
    mut rx: BufferedUartRx,
    mut tx: BufferedUartTx,
    mut gate: DirectionGate,
    mut barrier_out: Output<'static>,
    barrier_in: Input<'static>,
) {
    info!("bus task started");

    let mut parser = FrameParser::new();
    // Contention during discovery is expected; count errors only when running
    parser.set_counting(false);

    let mut follower = FollowerDiscovery::new();
    let mut actions = Actions::new();
    follower.boot(&mut actions);
    apply_actions(
        &mut actions,
        &mut tx,
        &mut gate,
        &mut parser,
        &mut barrier_out,
        &follower,
    )
    .await;

    let mut buf = [0u8; 64];
    let mut was_running = false;
    loop {
        match select(rx.read(&mut buf), Timer::after_millis(POLL_MS)).await {
            Either::First(Ok(n)) if n > 0 => {
                for &byte in &buf[..n] {
                    let Some(payload) = parser.feed(byte) else {
                        continue;
                    };
                    match Message::decode(&payload) {
                        Ok((header, message)) => {
                            handle_message(
                                &header,
                                &message,
                                &mut follower,
                                &mut actions,
                                barrier_in.is_high(),
                            )
                            .await;
                        }
                        Err(e) => warn!("undecodable payload: {:?}", e),
                    }
                    apply_actions(
                        &mut actions,
                        &mut tx,
                        &mut gate,
                        &mut parser,
                        &mut barrier_out,
                        &follower,
                    )
                    .await;
                }
            }
            Either::First(Ok(_)) => {}
            Either::First(Err(e)) => warn!("uart read error: {:?}", e),
            Either::Second(()) => {
                follower.poll(barrier_in.is_high(), &mut actions);
                apply_actions(
                    &mut actions,
                    &mut tx,
                    &mut gate,
                    &mut parser,
                    &mut barrier_out,
                    &follower,
                )
                .await;
            }
        }

        // Error counting follows the discovery state
        let running = follower.is_running();
        if running != was_running {
            parser.set_counting(running);
            if running {
                info!(
                    "assigned address {}, link errors so far: {}",
                    follower.address().unwrap_or(UNASSIGNED),
                    parser.stats().errors()
                );
            }
            was_running = running;
        }
    }
}

async fn handle_message(
    header: &Header,
    message: &Message,
    follower: &mut FollowerDiscovery,
    actions: &mut Actions,
    barrier_high: bool,
) {
    let own = follower.address().unwrap_or(UNASSIGNED);
    if header.source == own {
        // our own transmission echoing back
        return;
    }
    if !accepts(header.dest, own) {
        return;
    }

    match message {
        Message::Reset | Message::Start | Message::Accept { .. } | Message::Done { .. } => {
            follower.on_message(message, barrier_high, actions);
        }

        Message::NodeConfig {
            magnet_offset0,
            magnet_offset1,
            initial_ticks0,
            initial_ticks1,
        } => {
            MOTION
                .send(MotionMsg::Config {
                    magnet_offset0: *magnet_offset0,
                    magnet_offset1: *magnet_offset1,
                    initial_ticks0: *initial_ticks0,
                    initial_ticks1: *initial_ticks1,
                })
                .await;
        }

        Message::BeginBatch => MOTION.send(MotionMsg::Begin).await,

        Message::AddCommands { words } => {
            MOTION
                .send(MotionMsg::Add {
                    hand: header.dest & 1,
                    words: words.clone(),
                })
                .await;
        }

        Message::EndBatch {
            speed_table,
            ramp_detect,
            millis_left,
            turn_speed,
            turn_steps,
        } => {
            // Batches mean nothing until discovery gave us an address
            let Some(addr) = follower.address() else {
                return;
            };
            MOTION
                .send(MotionMsg::Start {
                    speed_table: *speed_table,
                    ramp_detect0: ramp_detect & (1u64 << addr) != 0,
                    ramp_detect1: ramp_detect & (1u64 << (addr + 1)) != 0,
                    millis_left: *millis_left,
                    turn_speed: *turn_speed,
                    turn_steps: *turn_steps,
                })
                .await;
        }

        Message::PositionRequest { stop, .. } => {
            if *stop {
                MOTION.send(MotionMsg::Stop).await;
            }
            MOTION.send(MotionMsg::QueryPositions).await;
            let report = POSITIONS.wait().await;
            // Chained reply: next node in the discovery chain, or the
            // coordinator if we are the last
            let _ = actions.push(Action::Send {
                dest: follower.next_hop(),
                message: Message::PositionRequest {
                    stop: *stop,
                    pos0: report.pos0,
                    pos1: report.pos1,
                    ready: report.ready,
                },
            });
        }
    }
}

/// Apply queued discovery actions to the hardware
async fn apply_actions(
    actions: &mut Actions,
    tx: &mut BufferedUartTx,
    gate: &mut DirectionGate,
    parser: &mut FrameParser,
    barrier_out: &mut Output<'static>,
    follower: &FollowerDiscovery,
) {
    for action in actions.iter() {
        match action {
            Action::DriveBarrier(level) => {
                if *level {
                    barrier_out.set_high();
                } else {
                    barrier_out.set_low();
                }
            }
            Action::Send { dest, message } => {
                let source = follower.address().unwrap_or(UNASSIGNED);
                send_message(tx, gate, parser, source, *dest, message).await;
            }
            Action::HotReset => {
                info!("hot reset at {}", Instant::now());
                MOTION.send(MotionMsg::Stop).await;
                MOTION.send(MotionMsg::Begin).await;
                MOTION.send(MotionMsg::Home).await;
            }
        }
    }
    actions.clear();
}

/// Frame and transmit one message, managing the direction gate
async fn send_message(
    tx: &mut BufferedUartTx,
    gate: &mut DirectionGate,
    parser: &mut FrameParser,
    source: u8,
    dest: u8,
    message: &Message,
) {
    let mut payload = [0u8; 64];
    let Ok(len) = message.encode(source, dest, &mut payload) else {
        warn!("message too large for payload buffer");
        return;
    };
    let mut frame = [0u8; MAX_FRAME_SIZE];
    let Ok(frame_len) = encode_frame(&payload[..len], &mut frame) else {
        warn!("payload too large for frame");
        return;
    };

    // Outbound send terminates any receive in progress
    parser.reset();
    gate.transmit();
    if let Err(e) = tx.write_all(&frame[..frame_len]).await {
        warn!("uart write error: {:?}", e);
    }
    if let Err(e) = tx.flush().await {
        warn!("uart flush error: {:?}", e);
    }
    gate.receive();
}
