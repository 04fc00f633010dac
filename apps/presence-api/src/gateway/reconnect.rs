//! Client-side reconnection policy, co-designed with the server.
//!
//! One controller instance backs every logical channel a client opens, so
//! backoff behavior is uniform instead of being reimplemented per feature.
//! Pure state: the owner drives the actual socket IO and timers.

use std::time::Duration;

use rand::Rng;

use super::events::CLOSE_NORMAL;

/// Tunables for the reconnect schedule. Mirrors the server's
/// `reconnect_*` configuration handed to clients.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub growth_factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            growth_factor: 2.0,
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// What the owner should do after the transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    /// Wait this long, then attempt to reconnect.
    After(Duration),
    /// Attempt cap reached; surface a persistent "disconnected" state.
    GiveUp,
    /// Deliberate closure; schedule nothing.
    Stay,
}

pub struct ReconnectController {
    policy: ReconnectPolicy,
    attempts: u32,
    manual_close: bool,
    connected: bool,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            manual_close: false,
            connected: false,
        }
    }

    /// Successful (re)connect: the attempt counter resets and heartbeats
    /// may restart.
    pub fn on_connected(&mut self) {
        self.attempts = 0;
        self.connected = true;
    }

    /// The user closed this channel on purpose (navigation, logout).
    /// Suppresses the reconnect schedule for any close that follows.
    pub fn on_manual_close(&mut self) {
        self.manual_close = true;
    }

    /// Heartbeats run only while a connection is established.
    pub fn heartbeats_enabled(&self) -> bool {
        self.connected
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The transport closed with `code`. Normal closure and manual closes
    /// stay down; anything else follows the capped exponential schedule.
    pub fn on_close(&mut self, code: u16, rng: &mut impl Rng) -> Reconnect {
        self.connected = false;
        if self.manual_close || code == CLOSE_NORMAL {
            return Reconnect::Stay;
        }
        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            return Reconnect::GiveUp;
        }
        Reconnect::After(self.next_delay(rng))
    }

    fn next_delay(&self, rng: &mut impl Rng) -> Duration {
        let exponent = self.policy.growth_factor.powi(self.attempts as i32 - 1);
        let jitter: f64 = rng.gen_range(0.5..1.5);
        let raw_ms = self.policy.base.as_millis() as f64 * exponent * jitter;
        Duration::from_millis((raw_ms as u64).min(self.policy.cap.as_millis() as u64))
    }
}
