// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Bounded reconnect with backoff
//!
//! [`LinkSupervisor`] only decides; it never sleeps. The worker waits out
//! the returned delay on a timer that shutdown can cancel.
//!
//! ```text
//! Connected --failure--> Reconnecting(1) --failure--> ... --> Failed
//!     ^                        |
//!     +-------connected--------+
//! ```

use std::time::Duration;

use crate::config::ReconnectSettings;

/// Delay schedule between reconnect attempts
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RetryStrategy {
    /// Give up at the first failure
    #[default]
    None,
    /// Constant delay
    Fixed {
        /// Maximum number of attempts
        max_retries: u32,
        delay: Duration,
    },
    /// Delay multiplied on every attempt, capped at `max_delay`
    ExponentialBackoff {
        /// Maximum number of attempts
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
}

impl RetryStrategy {
    /// Delay before attempt `attempt` (0-indexed), `None` once exhausted
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_retries, delay } => (attempt < *max_retries).then_some(*delay),
            Self::ExponentialBackoff {
                max_retries,
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if attempt >= *max_retries {
                    return None;
                }
                let delay_ms = initial_delay.as_millis() as f64 * multiplier.powi(attempt as i32);
                let delay = Duration::from_millis(delay_ms.min(max_delay.as_millis() as f64) as u64);
                Some(delay.min(*max_delay))
            }
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } | Self::ExponentialBackoff { max_retries, .. } => {
                *max_retries
            }
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// Doubling backoff capped at 60s
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        Self::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl From<&ReconnectSettings> for RetryStrategy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self::ExponentialBackoff {
            max_retries: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.initial_delay_ms)),
            multiplier: 2.0,
        }
    }
}

/// Instrument link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Waiting before attempt number `attempt` (1-based)
    Reconnecting { attempt: u32 },
    /// Retries exhausted
    Failed,
}

/// Reconnect state machine of one sensor link
#[derive(Debug, Clone)]
pub struct LinkSupervisor {
    strategy: RetryStrategy,
    state: LinkState,
    failures: u32,
}

impl LinkSupervisor {
    /// Start in `Reconnecting(1)`: the first connect is attempt one
    pub fn new(strategy: RetryStrategy) -> Self {
        Self {
            strategy,
            state: LinkState::Reconnecting { attempt: 1 },
            failures: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Link is up. Returns true when it was down before, i.e. the metadata
    /// epoch must restart.
    pub fn on_connected(&mut self) -> bool {
        let was_down = self.state != LinkState::Connected;
        self.state = LinkState::Connected;
        self.failures = 0;
        was_down
    }

    /// Connect attempt failed or the link dropped. Returns the delay before
    /// the next attempt, or `None` when the link is given up.
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.state == LinkState::Failed {
            return None;
        }
        match self.strategy.delay_for_attempt(self.failures) {
            Some(delay) => {
                self.failures += 1;
                self.state = LinkState::Reconnecting {
                    attempt: self.failures,
                };
                Some(delay)
            }
            None => {
                self.state = LinkState::Failed;
                None
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == LinkState::Failed
    }
}
