//! Per-session token-bucket rate limiting.
//!
//! One bucket per live session, owned by the session's registry entry and
//! dropped with it on disconnect. Refill is computed lazily on each check
//! from a monotonic clock, so an idle session pays nothing.

use std::time::Instant;

/// Token bucket: capacity `max_tokens`, refill `refill_rate` tokens/second.
///
/// Admission costs one token. `tokens` is fractional so sub-second refill
/// accumulates precisely across bursts.
#[derive(Debug, Clone)]
pub struct RateBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64,
}

impl RateBucket {
    /// A full bucket, created when the session connects.
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Admit or reject one request at the current instant.
    pub fn try_admit(&mut self) -> bool {
        self.try_admit_at(Instant::now())
    }

    /// Admit or reject one request at an explicit instant.
    ///
    /// `now` earlier than the last refill is treated as no elapsed time.
    pub fn try_admit_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (diagnostic only — does not refill).
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}
