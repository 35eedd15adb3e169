//! Bounded fixed-delay reconnect policy

use std::time::Duration;

use crate::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS};

/// What to do after the socket dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    /// Attempt cap reached
    Exhausted,
    /// The close was requested locally
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    delay: Duration,
    attempts: u32,
    intentional: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempts: 0,
            intentional: false,
        }
    }

    /// Called on every drop and every failed attempt
    pub fn on_drop(&mut self) -> ReconnectDecision {
        if self.intentional {
            return ReconnectDecision::Suppressed;
        }
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted;
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.delay,
        }
    }

    /// Successful handshake
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn mark_intentional(&mut self) {
        self.intentional = true;
    }

    /// Arm for a new caller-initiated connect
    pub fn rearm(&mut self) {
        self.attempts = 0;
        self.intentional = false;
    }

    pub fn is_intentional(&self) -> bool {
        self.intentional
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS, Duration::from_millis(RECONNECT_DELAY_MS))
    }
}
