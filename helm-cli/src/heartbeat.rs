//! Per-connection liveness bookkeeping.
//!
//! The state machine never reads from the socket. The connection's single reader feeds
//! it pongs, and the session loop sleeps until [`Heartbeat::next_wakeup`] and then calls
//! [`Heartbeat::poll`].

use std::time::{Duration, Instant};

use helm_config::HeartbeatConfig;

/// What the session loop must do after a wakeup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatAction {
    /// Write a `ping` frame to the client.
    SendPing,
    /// The pong deadline passed; the connection is dead.
    Expired,
}

#[derive(Clone, Debug)]
pub struct Heartbeat {
    ping_interval: Duration,
    pong_timeout: Duration,
    next_ping_at: Instant,
    pong_deadline: Option<Instant>,
    last_pong_at: Option<Instant>,
    missed_pongs: u32,
}

impl Heartbeat {
    pub fn new(config: &HeartbeatConfig, now: Instant) -> Self {
        Self::with_timings(config.ping_interval(), config.pong_timeout(), now)
    }

    pub fn with_timings(ping_interval: Duration, pong_timeout: Duration, now: Instant) -> Self {
        Self {
            ping_interval,
            pong_timeout,
            next_ping_at: now + ping_interval,
            pong_deadline: None,
            last_pong_at: None,
            missed_pongs: 0,
        }
    }

    /// Earliest instant at which [`Heartbeat::poll`] can return an action.
    #[must_use]
    pub fn next_wakeup(&self) -> Instant {
        match self.pong_deadline {
            Some(deadline) => deadline.min(self.next_ping_at),
            None => self.next_ping_at,
        }
    }

    pub fn poll(&mut self, now: Instant) -> Option<HeartbeatAction> {
        if let Some(deadline) = self.pong_deadline {
            if now >= deadline {
                self.pong_deadline = None;
                self.missed_pongs += 1;
                return Some(HeartbeatAction::Expired);
            }
        }
        if now >= self.next_ping_at {
            self.next_ping_at = now + self.ping_interval;
            // An outstanding deadline is never pushed back by a later ping.
            if self.pong_deadline.is_none() {
                self.pong_deadline = Some(now + self.pong_timeout);
            }
            return Some(HeartbeatAction::SendPing);
        }
        None
    }

    pub fn on_pong(&mut self, now: Instant) {
        self.pong_deadline = None;
        self.last_pong_at = Some(now);
        self.missed_pongs = 0;
    }

    #[must_use]
    pub fn awaiting_pong(&self) -> bool {
        self.pong_deadline.is_some()
    }

    #[must_use]
    pub fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    #[must_use]
    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs
    }
}
