//! Shared state store abstraction.
//!
//! Rule records and bucket state live in an external key-value store shared
//! by every service instance. The store is the only shared mutable resource:
//! [`StateStore::consume_tokens`] must run the whole read-refill-consume-write
//! sequence for one bucket as a single indivisible step, because two
//! separate round trips would let concurrent callers admit on the same
//! pre-consumption token count.

mod memory;
mod redis_store;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{BucketRequest, Decision};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Capabilities the rate limiter needs from its backing store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a plain string value. `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Upsert fields of a hash record without expiry.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// Read selected fields of a hash record, in request order.
    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>>;

    /// Read every field of a hash record. Empty if the record is absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Enumerate keys starting with `prefix`. No ordering guarantee; keys
    /// written concurrently may or may not appear.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Run one token bucket step atomically and return its decision.
    async fn consume_tokens(&self, request: &BucketRequest) -> Result<Decision>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Release the connection. Later calls fail with `StoreClosed`.
    async fn close(&self) -> Result<()>;
}
