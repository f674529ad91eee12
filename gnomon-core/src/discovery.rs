//! Bus discovery: assigning addresses to anonymous followers
//!
//! All nodes share one serial bus plus one extra binary barrier line. The
//! bus alone cannot signal "every node has responded" (no collision
//! detection), so the barrier provides the hardware-level all-acknowledge:
//! each node drives the line toward its downstream neighbour and senses its
//! upstream one, with the coordinator closing the loop. A high level ripples
//! node to node, so the coordinator seeing high means every follower has
//! passed it along.
//!
//! Assignment is chained over the bus: the coordinator offers address 0;
//! the one follower currently sensing the barrier high claims the offer,
//! re-drives the barrier high (handing the claim token downstream), and
//! broadcasts the next address. When the token comes back around, every
//! follower holds an address and the highest forwarded offer equals twice
//! the node count.
//!
//! Both sides are pure state machines: inputs are messages, the sensed
//! barrier level, and the clock; outputs are [`Action`]s the caller applies
//! to real hardware (or to a simulated bus in tests). The original design
//! busy-waited forever on a silent follower; here every coordinator wait
//! carries a deadline, with bounded retries and a partial-network fallback.

use heapless::Vec;

use gnomon_protocol::messages::{Message, BROADCAST, MAX_NODES};

/// Hold the barrier before broadcasting `Reset`, letting slow followers
/// notice the forced re-discovery
pub const RESET_SETTLE_MS: u32 = 500;

/// How long the coordinator waits for the reset acknowledgement to ripple
pub const RESET_ACK_TIMEOUT_MS: u32 = 2_000;

/// How long the coordinator waits for the claim token without hearing a new
/// `Accept` reply
pub const ACCEPT_TIMEOUT_MS: u32 = 5_000;

/// Barrier settle time after `Done` before normal traffic flows
pub const DONE_SETTLE_MS: u32 = 100;

/// Full restarts before giving up and running with whatever was found
pub const MAX_DISCOVERY_RETRIES: u8 = 3;

/// Per-node calibration shipped right after discovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeCalibration {
    pub magnet_offset0: i16,
    pub magnet_offset1: i16,
    pub initial_ticks0: i16,
    pub initial_ticks1: i16,
}

/// Side effects requested by a state machine
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    /// Drive our barrier output high or low
    DriveBarrier(bool),
    /// Transmit a message on the bus
    Send { dest: u8, message: Message },
    /// Follower only: discovery restarted while motion could be running;
    /// stop motors and forget queued work
    HotReset,
}

/// Action buffer: one poll can emit a `Done` plus a `NodeConfig` per node
pub type Actions = Vec<Action, { MAX_NODES + 4 }>;

/// How discovery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryOutcome {
    /// Every follower answered before any deadline expired
    Complete { nodes: u8 },
    /// Deadlines expired; running with the followers found so far
    Partial { nodes: u8 },
}

impl DiscoveryOutcome {
    pub fn nodes(self) -> u8 {
        match self {
            DiscoveryOutcome::Complete { nodes } | DiscoveryOutcome::Partial { nodes } => nodes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinatorState {
    Idle,
    /// Barrier asserted, waiting out the settle time before `Reset`
    AssertReset { until: u32 },
    /// `Reset` sent, waiting for the low level to ripple back
    AwaitResetAck { deadline: u32 },
    /// `Accept` chain in flight, waiting for the claim token
    Accepting { deadline: u32 },
    /// `Done` sent, waiting for the release to ripple back
    AwaitDoneAck { deadline: u32 },
    /// Barrier settled low after `Done`
    Settling { until: u32 },
    Running,
}

/// Coordinator side of discovery
#[derive(Debug, Clone)]
pub struct CoordinatorDiscovery {
    state: CoordinatorState,
    calibration: [NodeCalibration; MAX_NODES],
    /// Highest forwarded offer heard; equals 2 x node count once the chain
    /// completes
    next_unclaimed: u8,
    retries: u8,
    degraded: bool,
    outcome: Option<DiscoveryOutcome>,
}

impl CoordinatorDiscovery {
    pub fn new(calibration: [NodeCalibration; MAX_NODES]) -> Self {
        Self {
            state: CoordinatorState::Idle,
            calibration,
            next_unclaimed: 0,
            retries: 0,
            degraded: false,
            outcome: None,
        }
    }

    /// Begin (or forcibly restart) discovery
    pub fn start(&mut self, now_ms: u32, actions: &mut Actions) {
        self.retries = 0;
        self.degraded = false;
        self.restart(now_ms, actions);
    }

    fn restart(&mut self, now_ms: u32, actions: &mut Actions) {
        self.next_unclaimed = 0;
        self.outcome = None;
        let _ = actions.push(Action::DriveBarrier(true));
        self.state = CoordinatorState::AssertReset {
            until: now_ms.wrapping_add(RESET_SETTLE_MS),
        };
    }

    pub fn is_running(&self) -> bool {
        self.state == CoordinatorState::Running
    }

    /// Set once discovery finishes
    pub fn outcome(&self) -> Option<DiscoveryOutcome> {
        self.outcome
    }

    /// Discovered node count (valid once running)
    pub fn nodes(&self) -> u8 {
        self.next_unclaimed / 2
    }

    fn restart_or_degrade(&mut self, now_ms: u32, actions: &mut Actions) {
        if self.retries < MAX_DISCOVERY_RETRIES {
            self.retries += 1;
            #[cfg(feature = "defmt")]
            defmt::warn!("discovery timeout, retry {}", self.retries);
            self.restart(now_ms, actions);
        } else {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "discovery gave up after {} retries, {} nodes found",
                self.retries,
                self.nodes()
            );
            self.degraded = true;
            self.finish(now_ms, actions);
        }
    }

    /// Close the accept phase: announce `Done` and ship calibration
    fn finish(&mut self, now_ms: u32, actions: &mut Actions) {
        let _ = actions.push(Action::DriveBarrier(false));
        let _ = actions.push(Action::Send {
            dest: BROADCAST,
            message: Message::Done {
                last_id: self.next_unclaimed,
            },
        });
        for node in 0..self.nodes() {
            let cal = self.calibration[node as usize];
            let _ = actions.push(Action::Send {
                dest: node * 2,
                message: Message::NodeConfig {
                    magnet_offset0: cal.magnet_offset0,
                    magnet_offset1: cal.magnet_offset1,
                    initial_ticks0: cal.initial_ticks0,
                    initial_ticks1: cal.initial_ticks1,
                },
            });
        }
        self.state = CoordinatorState::AwaitDoneAck {
            deadline: now_ms.wrapping_add(RESET_ACK_TIMEOUT_MS),
        };
    }

    /// Advance the machine; call every scheduler tick with the sensed
    /// barrier level
    pub fn poll(&mut self, now_ms: u32, barrier_high: bool, actions: &mut Actions) {
        match self.state {
            CoordinatorState::Idle | CoordinatorState::Running => {}

            CoordinatorState::AssertReset { until } => {
                if expired(now_ms, until) {
                    let _ = actions.push(Action::Send {
                        dest: BROADCAST,
                        message: Message::Reset,
                    });
                    self.state = CoordinatorState::AwaitResetAck {
                        deadline: now_ms.wrapping_add(RESET_ACK_TIMEOUT_MS),
                    };
                }
            }

            CoordinatorState::AwaitResetAck { deadline } => {
                if !barrier_high {
                    // Every follower acknowledged the reset; offer the first
                    // address with the claim token still in our hands
                    let _ = actions.push(Action::Send {
                        dest: BROADCAST,
                        message: Message::Start,
                    });
                    let _ = actions.push(Action::Send {
                        dest: BROADCAST,
                        message: Message::Accept { offered: 0 },
                    });
                    self.state = CoordinatorState::Accepting {
                        deadline: now_ms.wrapping_add(ACCEPT_TIMEOUT_MS),
                    };
                } else if expired(now_ms, deadline) {
                    self.restart_or_degrade(now_ms, actions);
                }
            }

            CoordinatorState::Accepting { deadline } => {
                if barrier_high {
                    // Claim token returned: every follower holds an address
                    self.finish(now_ms, actions);
                } else if expired(now_ms, deadline) {
                    self.restart_or_degrade(now_ms, actions);
                }
            }

            CoordinatorState::AwaitDoneAck { deadline } => {
                if !barrier_high {
                    self.state = CoordinatorState::Settling {
                        until: now_ms.wrapping_add(DONE_SETTLE_MS),
                    };
                } else if expired(now_ms, deadline) {
                    self.degraded = true;
                    self.state = CoordinatorState::Settling {
                        until: now_ms.wrapping_add(DONE_SETTLE_MS),
                    };
                }
            }

            CoordinatorState::Settling { until } => {
                if expired(now_ms, until) {
                    let nodes = self.nodes();
                    self.outcome = Some(if self.degraded {
                        DiscoveryOutcome::Partial { nodes }
                    } else {
                        DiscoveryOutcome::Complete { nodes }
                    });
                    self.state = CoordinatorState::Running;
                }
            }
        }
    }

    /// Feed a received bus message
    pub fn on_message(&mut self, message: &Message, now_ms: u32) {
        if let CoordinatorState::Accepting { .. } = self.state {
            if let Message::Accept { offered } = message {
                // A follower claimed and forwarded the next address; extend
                // the deadline so a long chain does not trip it
                if *offered > self.next_unclaimed {
                    self.next_unclaimed = *offered;
                }
                self.state = CoordinatorState::Accepting {
                    deadline: now_ms.wrapping_add(ACCEPT_TIMEOUT_MS),
                };
            }
        }
    }
}

fn expired(now_ms: u32, deadline: u32) -> bool {
    now_ms.wrapping_sub(deadline) < u32::MAX / 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowerState {
    /// Powered up or forced back; holding the barrier high
    AwaitingReset,
    /// Saw `Reset`; barrier released, waiting for an address offer
    AwaitingAccept,
    /// Address claimed, token passed on; waiting for `Done`
    Assigned,
    Running,
}

/// Follower side of discovery
#[derive(Debug, Clone)]
pub struct FollowerDiscovery {
    state: FollowerState,
    address: Option<u8>,
    /// Address we forwarded; `None` once `Done` names it (we are the chain's
    /// end and our upstream replies route to the coordinator)
    next: Option<u8>,
    started: bool,
}

impl Default for FollowerDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl FollowerDiscovery {
    pub const fn new() -> Self {
        Self {
            state: FollowerState::AwaitingReset,
            address: None,
            next: None,
            started: false,
        }
    }

    /// Announce ourselves unassigned; call once at boot
    pub fn boot(&mut self, actions: &mut Actions) {
        let _ = actions.push(Action::DriveBarrier(true));
        self.state = FollowerState::AwaitingReset;
    }

    /// Our assigned bus address, once claimed
    pub fn address(&self) -> Option<u8> {
        self.address
    }

    /// Where chained replies (position scans etc.) go: the node we handed
    /// the next address to, or the coordinator if that address was never
    /// claimed
    pub fn next_hop(&self) -> u8 {
        self.next.unwrap_or(gnomon_protocol::messages::COORDINATOR)
    }

    pub fn is_running(&self) -> bool {
        self.state == FollowerState::Running
    }

    /// Watch for a forced re-discovery: the coordinator re-asserting the
    /// barrier while we are in normal operation
    pub fn poll(&mut self, barrier_high: bool, actions: &mut Actions) {
        if self.state == FollowerState::Running && barrier_high {
            #[cfg(feature = "defmt")]
            defmt::info!("barrier re-asserted, hot reset");
            let _ = actions.push(Action::HotReset);
            // Propagate downstream so the whole chain resets
            let _ = actions.push(Action::DriveBarrier(true));
            self.address = None;
            self.next = None;
            self.started = false;
            self.state = FollowerState::AwaitingReset;
        }
    }

    /// Feed a received bus message together with the sensed barrier level
    pub fn on_message(&mut self, message: &Message, barrier_high: bool, actions: &mut Actions) {
        match message {
            Message::Reset => {
                if self.state == FollowerState::Running {
                    let _ = actions.push(Action::HotReset);
                }
                self.address = None;
                self.next = None;
                self.started = false;
                let _ = actions.push(Action::DriveBarrier(false));
                self.state = FollowerState::AwaitingAccept;
            }

            Message::Start => {
                if self.state == FollowerState::AwaitingAccept {
                    self.started = true;
                }
            }

            Message::Accept { offered } => {
                // Claim only while the upstream neighbour holds the token;
                // everyone else hears the same broadcast and stays quiet
                if self.state == FollowerState::AwaitingAccept
                    && self.started
                    && barrier_high
                    && self.address.is_none()
                {
                    self.address = Some(*offered);
                    self.next = Some(offered + 2);
                    let _ = actions.push(Action::DriveBarrier(true));
                    let _ = actions.push(Action::Send {
                        dest: BROADCAST,
                        message: Message::Accept {
                            offered: offered + 2,
                        },
                    });
                    self.state = FollowerState::Assigned;
                }
            }

            Message::Done { last_id } => {
                if self.state == FollowerState::Assigned {
                    if self.next == Some(*last_id) {
                        // Nobody claimed what we forwarded: we are the end
                        // of the chain
                        self.next = None;
                    }
                    let _ = actions.push(Action::DriveBarrier(false));
                    self.state = FollowerState::Running;
                }
            }

            _ => {}
        }
    }
}
