//! Reconnect scheduling.
//!
//! The policy computes how long to wait before each reconnect attempt and
//! when to give up. The protocol does not prescribe a curve, so the shape
//! is a tunable parameter rather than a constant.

use rand::Rng;
use tokio::time::{Duration, Instant};

/// Delay curve between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `initial * (attempt + 1)`, capped at the maximum delay.
    Linear,
    /// `initial * 2^attempt`, capped at the maximum delay.
    Exponential,
}

/// Controls delay and attempt budget for reconnection.
///
/// The elapsed-time ceiling is not part of the policy: it is always the
/// negotiated disconnect timeout, enforced by the connection state machine
/// via [`ReconnectContext::deadline`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub backoff: Backoff,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Attempt ceiling. `None` means attempts are bounded only by the
    /// disconnect-timeout deadline.
    pub max_attempts: Option<u32>,
    /// Random factor applied to each delay, `0.0..=1.0`. A delay `d` with
    /// jitter `j` lands in `d * (1 - j) ..= d * (1 + j)`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            max_attempts: Some(5),
            jitter: 0.0,
        }
    }
}

impl ReconnectPolicy {
    /// Computes the delay before the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Linear => self.initial_delay.saturating_mul(attempt + 1),
            Backoff::Exponential => self
                .initial_delay
                .saturating_mul(2u32.saturating_pow(attempt.min(16))),
        };
        let capped = base.min(self.max_delay);

        if self.jitter > 0.0 {
            let spread = rand::rng().random_range(-self.jitter..=self.jitter);
            capped.mul_f64(1.0 + spread)
        } else {
            capped
        }
    }

    /// True once the attempt budget is spent.
    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Book-keeping for one reconnect episode. Created on entering
/// `Reconnecting`, discarded on reaching `Active` or `Disconnected`.
#[derive(Debug)]
pub struct ReconnectContext {
    /// Zero-based counter of attempts made in this episode.
    pub attempt: u32,
    /// Last cursor consumed before the connection was lost; echoed on the
    /// resume request.
    pub last_cursor: Option<u64>,
    /// Absolute point at which the episode fails: last successful receipt
    /// plus the negotiated disconnect timeout.
    pub deadline: Instant,
}
