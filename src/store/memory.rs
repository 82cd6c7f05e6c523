//! In-process state store for development and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::StateStore;
use crate::clock::Clock;
use crate::error::{RatekeeperError, Result};
use crate::ratelimit::bucket::{format_tokens, BucketState};
use crate::ratelimit::{BucketRequest, Decision};

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    /// Unix seconds at which the entry disappears
    expires_at: Option<i64>,
}

/// A state store held in process memory.
///
/// Follows Redis semantics closely enough for the rate limiter: string and
/// hash values, per-key expiry measured against the injected clock, and a
/// bucket step that holds the map lock for its whole read-modify-write.
/// State is not shared between processes.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Drop every expired entry. Reads already ignore them; this only
    /// reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !is_expired(entry, now));
        let purged = before - entries.len();
        debug!(purged, "Purged expired entries");
        purged
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_secs();
        self.entries
            .lock()
            .values()
            .filter(|entry| !is_expired(entry, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RatekeeperError::StoreClosed)
        } else {
            Ok(())
        }
    }
}

fn is_expired(entry: &Entry, now: i64) -> bool {
    entry.expires_at.is_some_and(|at| now >= at)
}

/// Look up a live entry, evicting it first if it has expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: i64) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| is_expired(entry, now)) {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

fn wrong_type() -> RatekeeperError {
    RatekeeperError::Redis(redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    )))
}

fn text_value(entries: &mut HashMap<String, Entry>, key: &str, now: i64) -> Result<Option<String>> {
    match live(entries, key, now) {
        None => Ok(None),
        Some(Entry {
            slot: Slot::Text(value),
            ..
        }) => Ok(Some(value.clone())),
        Some(_) => Err(wrong_type()),
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock();
        text_value(&mut entries, key, now)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.ensure_open()?;
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock();

        match live(&mut entries, key, now) {
            Some(Entry {
                slot: Slot::Hash(hash),
                ..
            }) => {
                for (field, value) in fields {
                    hash.insert(field.to_string(), value.clone());
                }
            }
            Some(_) => return Err(wrong_type()),
            None => {
                let hash = fields
                    .iter()
                    .map(|(field, value)| (field.to_string(), value.clone()))
                    .collect();
                entries.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::Hash(hash),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        self.ensure_open()?;
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock();

        match live(&mut entries, key, now) {
            None => Ok(vec![None; fields.len()]),
            Some(Entry {
                slot: Slot::Hash(hash),
                ..
            }) => Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect()),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.ensure_open()?;
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock();

        match live(&mut entries, key, now) {
            None => Ok(HashMap::new()),
            Some(Entry {
                slot: Slot::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type()),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let now = self.clock.now_secs();
        let entries = self.entries.lock();

        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn consume_tokens(&self, request: &BucketRequest) -> Result<Decision> {
        self.ensure_open()?;
        let now = self.clock.now_secs();
        let refreshed_key = request.refreshed_key();

        // The lock is held across read, refill and write
        let mut entries = self.entries.lock();

        let tokens = text_value(&mut entries, request.tokens_key(), now)?
            .map(|raw| {
                raw.parse::<f64>().map_err(|_| {
                    RatekeeperError::MalformedResult(format!("token count {:?} is not a number", raw))
                })
            })
            .transpose()?;
        let last_refill = text_value(&mut entries, &refreshed_key, now)?
            .map(|raw| {
                raw.parse::<i64>().map_err(|_| {
                    RatekeeperError::MalformedResult(format!("refill timestamp {:?} is not an integer", raw))
                })
            })
            .transpose()?;

        let state = BucketState::from_stored(tokens, last_refill, request.burst, request.now);
        let (decision, next) = state.apply(request);

        let expires_at = Some(now.saturating_add(request.ttl_secs() as i64));
        entries.insert(
            request.tokens_key().to_string(),
            Entry {
                slot: Slot::Text(format_tokens(next.tokens)),
                expires_at,
            },
        );
        entries.insert(
            refreshed_key,
            Entry {
                slot: Slot::Text(next.last_refill.to_string()),
                expires_at,
            },
        );

        Ok(decision)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closing in-memory store");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        (MemoryStore::new(clock.clone()), clock)
    }

    fn request(key: &str, rate: i64, burst: i64, now: i64) -> BucketRequest {
        BucketRequest {
            key: key.to_string(),
            rate,
            burst,
            now,
            cost: 1,
        }
    }

    #[tokio::test]
    async fn test_consume_tokens_writes_bucket_layout() {
        let (store, clock) = store_with_clock();
        let now = clock.now_secs();

        let decision = store.consume_tokens(&request("k1", 10, 50, now)).await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 49 });

        assert_eq!(store.get("k1").await.unwrap().as_deref(), Some("49"));
        let stamp = store.get("k1:last_refreshed").await.unwrap();
        assert_eq!(stamp, Some(now.to_string()));
    }

    #[tokio::test]
    async fn test_bucket_state_expires_after_ttl() {
        let (store, clock) = store_with_clock();
        let now = clock.now_secs();

        // burst 2, rate 1 -> ttl 4s
        store.consume_tokens(&request("k", 1, 2, now)).await.unwrap();
        store.consume_tokens(&request("k", 1, 2, now)).await.unwrap();

        clock.advance(3);
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(1);
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.get("k:last_refreshed").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_huge_burst_keeps_bucket_state() {
        let (store, clock) = store_with_clock();
        let now = clock.now_secs();
        let huge = request("big", 1, i64::MAX, now);

        let first = store.consume_tokens(&huge).await.unwrap();
        assert!(first.allowed);
        let second = store.consume_tokens(&huge).await.unwrap();
        assert!(second.allowed);

        // State survives past the short TTL of ordinary buckets
        clock.advance(3600);
        assert!(store.get("big").await.unwrap().is_some());
        assert!(store.get("big:last_refreshed").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_hash_round_trip() {
        let (store, _) = store_with_clock();

        store
            .hash_set("rule:a", &[("rate", "5".to_string()), ("burst", "20".to_string())])
            .await
            .unwrap();
        store
            .hash_set("rule:a", &[("burst", "30".to_string())])
            .await
            .unwrap();

        let fields = store.hash_get("rule:a", &["rate", "burst", "nope"]).await.unwrap();
        assert_eq!(fields, vec![Some("5".to_string()), Some("30".to_string()), None]);

        let all = store.hash_get_all("rule:a").await.unwrap();
        assert_eq!(all.len(), 2);

        let missing = store.hash_get("rule:b", &["rate"]).await.unwrap();
        assert_eq!(missing, vec![None]);
        assert!(store.hash_get_all("rule:b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let (store, clock) = store_with_clock();
        store.hash_set("h", &[("f", "v".to_string())]).await.unwrap();
        assert!(store.get("h").await.is_err());

        store.consume_tokens(&request("t", 1, 1, clock.now_secs())).await.unwrap();
        assert!(store.hash_get_all("t").await.is_err());
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let (store, clock) = store_with_clock();
        store.hash_set("rule:a", &[("rate", "1".to_string())]).await.unwrap();
        store.hash_set("rule:b", &[("rate", "1".to_string())]).await.unwrap();
        store.consume_tokens(&request("a", 1, 1, clock.now_secs())).await.unwrap();

        let mut keys = store.keys_with_prefix("rule:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["rule:a".to_string(), "rule:b".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();
        store.consume_tokens(&request("a", 1, 1, clock.now_secs())).await.unwrap();
        store.hash_set("rule:a", &[("rate", "1".to_string())]).await.unwrap();
        assert_eq!(store.len(), 3);

        clock.advance(10);
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(), 2);
        assert!(!store.is_empty());
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let (store, _) = store_with_clock();
        store.ping().await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(store.ping().await, Err(RatekeeperError::StoreClosed)));
        assert!(matches!(store.get("k").await, Err(RatekeeperError::StoreClosed)));
    }

    #[tokio::test]
    async fn test_corrupt_token_count_is_malformed() {
        let (store, clock) = store_with_clock();
        store.entries.lock().insert(
            "k".to_string(),
            Entry {
                slot: Slot::Text("lots".to_string()),
                expires_at: None,
            },
        );

        let err = store
            .consume_tokens(&request("k", 1, 1, clock.now_secs()))
            .await
            .unwrap_err();
        assert!(matches!(err, RatekeeperError::MalformedResult(_)));
    }
}
