//! Live-relay viewer protocol.
//!
//! A viewer connects to the frame stream, sends a textual keepalive at a
//! fixed interval, treats a stream that has produced no frame for too long as
//! dead, and reconnects after a fixed delay. The relay side closes viewers that
//! have been silent past the same timeout.
//!
//! [`ViewerMachine`] models the client as explicit transitions: every timer is
//! returned as a [`ViewerAction`] for the caller to schedule, and the caller
//! feeds back [`ViewerEvent`]s. Nothing here sleeps or spawns.

use std::time::{Duration, Instant};

/// Keepalive message a viewer sends; no reply is expected.
pub const PING_TEXT: &str = "ping";

/// Timing parameters shared by the relay and its viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTimings {
    pub keepalive_interval: Duration,
    pub silence_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for RelayTimings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            silence_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    Disconnected,
    Connecting,
    Open {
        last_frame_at: Instant,
        last_ping_at: Instant,
    },
    WaitingToReconnect {
        retry_at: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerEvent {
    /// The user opened the live view.
    Start,
    /// The stream connection was established.
    Connected,
    /// A binary frame arrived.
    Frame,
    /// The connection closed or failed.
    Closed,
    /// A previously scheduled timer fired.
    Tick,
    /// The user closed the live view.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerAction {
    Connect,
    SendPing,
    CloseConnection,
    /// Deliver a [`ViewerEvent::Tick`] at the given instant.
    ScheduleTick { at: Instant },
}

/// Client-side state machine for one live view.
#[derive(Debug, Clone)]
pub struct ViewerMachine {
    state: ViewerState,
    timings: RelayTimings,
    reconnects: u32,
}

impl ViewerMachine {
    pub fn new(timings: RelayTimings) -> Self {
        Self {
            state: ViewerState::Disconnected,
            timings,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ViewerState {
        self.state
    }

    /// Number of reconnects scheduled so far.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    fn next_open_tick(&self, last_frame_at: Instant, last_ping_at: Instant) -> Instant {
        let ping_due = last_ping_at + self.timings.keepalive_interval;
        let silence_due = last_frame_at + self.timings.silence_timeout;
        ping_due.min(silence_due)
    }

    fn schedule_reconnect(&mut self, now: Instant) -> Vec<ViewerAction> {
        let retry_at = now + self.timings.reconnect_delay;
        self.state = ViewerState::WaitingToReconnect { retry_at };
        self.reconnects += 1;
        vec![ViewerAction::ScheduleTick { at: retry_at }]
    }

    /// Apply one event and return the actions the caller must perform.
    pub fn handle(&mut self, event: ViewerEvent, now: Instant) -> Vec<ViewerAction> {
        match (self.state, event) {
            (_, ViewerEvent::Stop) => {
                let was_connected = !matches!(self.state, ViewerState::Disconnected);
                self.state = ViewerState::Disconnected;
                if was_connected {
                    vec![ViewerAction::CloseConnection]
                } else {
                    Vec::new()
                }
            }

            (ViewerState::Disconnected, ViewerEvent::Start) => {
                self.state = ViewerState::Connecting;
                vec![ViewerAction::Connect]
            }

            (ViewerState::Connecting, ViewerEvent::Connected) => {
                self.state = ViewerState::Open {
                    last_frame_at: now,
                    last_ping_at: now,
                };
                vec![ViewerAction::ScheduleTick {
                    at: self.next_open_tick(now, now),
                }]
            }

            (ViewerState::Connecting, ViewerEvent::Closed)
            | (ViewerState::Open { .. }, ViewerEvent::Closed) => self.schedule_reconnect(now),

            (ViewerState::Open { last_ping_at, .. }, ViewerEvent::Frame) => {
                self.state = ViewerState::Open {
                    last_frame_at: now,
                    last_ping_at,
                };
                Vec::new()
            }

            (
                ViewerState::Open {
                    last_frame_at,
                    last_ping_at,
                },
                ViewerEvent::Tick,
            ) => {
                if now >= last_frame_at + self.timings.silence_timeout {
                    let mut actions = vec![ViewerAction::CloseConnection];
                    actions.extend(self.schedule_reconnect(now));
                    return actions;
                }
                let mut actions = Vec::new();
                let mut last_ping_at = last_ping_at;
                if now >= last_ping_at + self.timings.keepalive_interval {
                    actions.push(ViewerAction::SendPing);
                    last_ping_at = now;
                }
                self.state = ViewerState::Open {
                    last_frame_at,
                    last_ping_at,
                };
                actions.push(ViewerAction::ScheduleTick {
                    at: self.next_open_tick(last_frame_at, last_ping_at),
                });
                actions
            }

            (ViewerState::WaitingToReconnect { retry_at }, ViewerEvent::Tick) => {
                if now >= retry_at {
                    self.state = ViewerState::Connecting;
                    vec![ViewerAction::Connect]
                } else {
                    vec![ViewerAction::ScheduleTick { at: retry_at }]
                }
            }

            // Stale timers and out-of-order events are ignored.
            _ => Vec::new(),
        }
    }
}
