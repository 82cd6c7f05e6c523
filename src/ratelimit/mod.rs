//! Token bucket rate limiting over shared state.

pub mod bucket;
mod engine;
mod limiter;
mod rules;
mod stats;

pub use bucket::{bucket_ttl, BucketRequest, BucketState, Decision};
pub use engine::TokenBucketEngine;
pub use limiter::{CheckOutcome, RateLimiter, StatsReport};
pub use rules::{validate_key, Limits, Rule, RuleRecord, RuleStore, RULE_PREFIX};
pub use stats::{StatsProvider, StatsView, UNKNOWN};
