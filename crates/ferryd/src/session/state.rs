//! Retransmission timing for one session.
//!
//! Every unanswered send adds the current ACK timeout to the accumulated
//! lag. Once the lag has reached the current timeout the timeout doubles,
//! so after `k` consecutive timeouts it is `base * 2^k`, capped at the
//! not-responding threshold. When the lag reaches that threshold the client
//! is considered gone. A matching ACK clears the lag and resets the timeout
//! to the base.

use std::time::Duration;

/// Shortest ACK timeout. With a zero timeout the lag would never grow.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    NotResponding,
}

#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    base: Duration,
    current: Duration,
    lag: Duration,
    limit: Duration,
    consecutive_timeouts: u32,
}

impl RetransmitTimer {
    pub fn new(base: Duration, limit: Duration) -> Self {
        let base = base.max(MIN_TIMEOUT);
        let limit = limit.max(base);
        Self {
            base,
            current: base,
            lag: Duration::ZERO,
            limit,
            consecutive_timeouts: 0,
        }
    }

    /// How long to wait for the next ACK.
    pub fn timeout(&self) -> Duration {
        self.current
    }

    pub fn lag(&self) -> Duration {
        self.lag
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// The expected ACK arrived.
    pub fn on_ack(&mut self) {
        self.lag = Duration::ZERO;
        self.current = self.base;
        self.consecutive_timeouts = 0;
    }

    /// The wait for an ACK expired.
    pub fn on_timeout(&mut self) -> Liveness {
        self.lag = self.lag.saturating_add(self.current);
        self.consecutive_timeouts += 1;

        if self.lag >= self.current {
            let doubled = self.current.saturating_mul(2).min(self.limit);
            if doubled != self.current {
                tracing::warn!(
                    from_ms = self.current.as_millis() as u64,
                    to_ms = doubled.as_millis() as u64,
                    lag_ms = self.lag.as_millis() as u64,
                    "readjusting ACK timeout"
                );
            }
            self.current = doubled;
        }

        if self.lag >= self.limit {
            Liveness::NotResponding
        } else {
            Liveness::Alive
        }
    }
}
