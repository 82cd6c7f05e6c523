//! Lazy-refill token bucket arithmetic.
//!
//! Buckets are never topped up in the background. Each check derives the
//! current fill level from the stored token count and the time of the
//! previous check, consumes from it, and writes both values back. Store
//! implementations run [`BucketState::apply`] (or an equivalent server-side
//! script) as one indivisible step.

use std::time::Duration;

/// Suffix of the key holding the refill timestamp of a bucket.
pub const REFRESHED_SUFFIX: &str = ":last_refreshed";

/// Upper bound on the idle lifetime of bucket state (one year).
pub const MAX_BUCKET_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Parameters of one atomic check-and-consume step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRequest {
    /// Bucket key; the token count lives under this exact key
    pub key: String,
    /// Tokens added per second
    pub rate: i64,
    /// Bucket capacity
    pub burst: i64,
    /// Current time, Unix seconds
    pub now: i64,
    /// Tokens this request consumes
    pub cost: i64,
}

impl BucketRequest {
    /// Key holding the token count.
    pub fn tokens_key(&self) -> &str {
        &self.key
    }

    /// Key holding the last refill timestamp.
    pub fn refreshed_key(&self) -> String {
        refreshed_key(&self.key)
    }

    /// Expiry applied to both bucket keys.
    pub fn ttl_secs(&self) -> u64 {
        bucket_ttl(self.rate, self.burst)
    }
}

/// Key holding the last refill timestamp for `key`.
pub fn refreshed_key(key: &str) -> String {
    format!("{}{}", key, REFRESHED_SUFFIX)
}

/// Idle lifetime of bucket state: two full refill cycles, `floor(2 * burst / rate)`.
///
/// Clamped to `1..=MAX_BUCKET_TTL_SECS`: stores reject a zero expiry, and
/// huge bursts must not push expiry timestamps out of range. A
/// non-positive rate yields the minimum instead of dividing by zero.
pub fn bucket_ttl(rate: i64, burst: i64) -> u64 {
    if rate <= 0 {
        return 1;
    }
    let ttl = burst.saturating_mul(2) / rate;
    (ttl.max(1) as u64).min(MAX_BUCKET_TTL_SECS)
}

/// Outcome of a check-and-consume step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whole tokens left in the bucket after this step
    pub remaining: i64,
}

impl Decision {
    /// Time until a request of `cost` tokens would next be admitted, for a
    /// denied decision. `None` when the request was allowed, or when `cost`
    /// exceeds `burst` and no amount of waiting admits it.
    pub fn retry_after(&self, rate: i64, burst: i64, cost: i64) -> Option<Duration> {
        if self.allowed || rate <= 0 || cost > burst {
            return None;
        }
        let deficit = cost.saturating_sub(self.remaining).max(1);
        let secs = deficit / rate + i64::from(deficit % rate != 0);
        Some(Duration::from_secs(secs.max(1) as u64))
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Token count at `last_refill`
    pub tokens: f64,
    /// Unix seconds of the last check
    pub last_refill: i64,
}

impl BucketState {
    /// Rebuild state from whatever the store held. A missing token count
    /// means a full bucket; a missing timestamp means "refilled just now".
    pub fn from_stored(tokens: Option<f64>, last_refill: Option<i64>, burst: i64, now: i64) -> Self {
        Self {
            tokens: tokens.unwrap_or(burst as f64),
            last_refill: last_refill.unwrap_or(now),
        }
    }

    /// Token count at `now`, capped at `burst`.
    ///
    /// Elapsed time is clamped at zero so a timestamp from the future
    /// (clock skew, retried requests) can never drain the bucket.
    pub fn refilled(&self, rate: i64, burst: i64, now: i64) -> f64 {
        let elapsed = now.saturating_sub(self.last_refill).max(0);
        (self.tokens + elapsed as f64 * rate as f64).min(burst as f64)
    }

    /// Refill, then consume `cost` tokens if enough are available.
    ///
    /// Returns the decision and the state to write back. A denied request
    /// still advances the bucket to its refilled level.
    pub fn apply(&self, request: &BucketRequest) -> (Decision, BucketState) {
        let filled = self.refilled(request.rate, request.burst, request.now);
        let allowed = filled >= request.cost as f64;
        let tokens = if allowed {
            filled - request.cost as f64
        } else {
            filled
        };

        let decision = Decision {
            allowed,
            remaining: tokens.floor().max(0.0) as i64,
        };
        let next = BucketState {
            tokens,
            last_refill: request.now,
        };
        (decision, next)
    }
}

/// Render a token count the way it is stored: integral values without a
/// fractional part.
pub fn format_tokens(tokens: f64) -> String {
    if tokens.fract() == 0.0 {
        format!("{}", tokens as i64)
    } else {
        format!("{}", tokens)
    }
}
