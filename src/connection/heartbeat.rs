//! Heartbeat monitoring.
//!
//! One clock, re-armed on every successful receipt, with two thresholds
//! derived from the negotiated timings:
//!
//! - possibly dead: keep-alive interval times a factor; the connection
//!   should be reconnected,
//! - definitely dead: the disconnect timeout; the connection is gone.
//!
//! The monitor never touches the transport. It only raises events; the
//! state machine is the single authority for teardown.

use parking_lot::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

/// Raised when a threshold elapses with no intervening receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// No traffic for keep-alive × factor. The transport may be dead.
    PossiblyDead,
    /// No traffic for the full disconnect timeout.
    DefinitelyDead,
}

#[derive(Debug, Clone, Copy)]
struct Beat {
    at: Instant,
    seq: u64,
}

/// Tracks last-received-activity time for one transport's lifetime.
pub struct HeartbeatMonitor {
    last: Mutex<Beat>,
    /// Absent when the server offers no keep-alive interval; only the
    /// definitely-dead threshold applies then.
    warn_after: Option<Duration>,
    dead_after: Duration,
}

impl HeartbeatMonitor {
    pub fn new(keep_alive: Option<Duration>, disconnect_timeout: Duration, factor: u32) -> Self {
        Self {
            last: Mutex::new(Beat {
                at: Instant::now(),
                seq: 0,
            }),
            warn_after: keep_alive.map(|interval| interval * factor),
            dead_after: disconnect_timeout,
        }
    }

    /// Re-arms the clock. Called on every successful receipt.
    pub fn beat(&self) {
        let mut last = self.last.lock();
        last.at = Instant::now();
        last.seq += 1;
    }

    /// Instant of the last receipt (or of monitor creation).
    pub fn last_beat(&self) -> Instant {
        self.last.lock().at
    }

    /// Resolves once a threshold elapses with no receipt in between.
    ///
    /// Cancel-safe: dropping the future and calling again re-derives the
    /// deadlines from the current clock.
    pub async fn expired(&self) -> HeartbeatEvent {
        loop {
            let observed = *self.last.lock();
            let dead_deadline = observed.at + self.dead_after;
            let (deadline, event) = match self.warn_after {
                Some(warn) if observed.at + warn < dead_deadline => {
                    (observed.at + warn, HeartbeatEvent::PossiblyDead)
                }
                _ => (dead_deadline, HeartbeatEvent::DefinitelyDead),
            };

            sleep_until(deadline).await;

            if self.last.lock().seq == observed.seq {
                return event;
            }
            // A receipt arrived while sleeping; re-derive the deadlines.
        }
    }
}
