//! Read-only reporting over rules and bucket state.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use super::rules::RuleStore;
use crate::error::{RatekeeperError, Result};
use crate::store::StateStore;

/// Reported value for fields of a key without a rule.
pub const UNKNOWN: &str = "unknown";

/// Statistics for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsView {
    /// No rule is stored for the key
    Unknown,
    Known {
        rate: i64,
        burst: i64,
        current_tokens: i64,
    },
}

impl StatsView {
    /// Render as a `{rate, burst, current_tokens}` map, with the string
    /// `"unknown"` standing in for every field of a key without a rule.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match *self {
            StatsView::Unknown => {
                for field in ["rate", "burst", "current_tokens"] {
                    map.insert(field.to_string(), Value::from(UNKNOWN));
                }
            }
            StatsView::Known {
                rate,
                burst,
                current_tokens,
            } => {
                map.insert("rate".to_string(), Value::from(rate));
                map.insert("burst".to_string(), Value::from(burst));
                map.insert("current_tokens".to_string(), Value::from(current_tokens));
            }
        }
        map
    }
}

/// Combines stored rules with live bucket state.
///
/// Reading statistics never modifies a bucket; in particular the reported
/// token count is the value written by the last check, without projecting
/// refill up to the present.
#[derive(Clone)]
pub struct StatsProvider {
    rules: RuleStore,
    store: Arc<dyn StateStore>,
}

impl StatsProvider {
    pub fn new(rules: RuleStore, store: Arc<dyn StateStore>) -> Self {
        Self { rules, store }
    }

    /// Statistics for `key`.
    ///
    /// A missing rule yields [`StatsView::Unknown`] rather than an error. A
    /// rule whose bucket was never checked (or has expired) reports a full
    /// bucket.
    pub async fn get_stats(&self, key: &str) -> Result<StatsView> {
        debug!(key = %key, "Getting stats for key");

        let Some(rule) = self.rules.get_rule(key).await? else {
            debug!(key = %key, "Using unknown rate/burst for stats");
            return Ok(StatsView::Unknown);
        };

        let current_tokens = match self.store.get(key).await? {
            None => {
                debug!(key = %key, burst = rule.burst, "No token data found, using burst capacity");
                rule.burst
            }
            Some(raw) => {
                let tokens = raw.parse::<f64>().map_err(|_| {
                    RatekeeperError::MalformedResult(format!(
                        "token count {:?} for key {} is not a number",
                        raw, key
                    ))
                })?;
                tokens.floor() as i64
            }
        };

        Ok(StatsView::Known {
            rate: rule.rate,
            burst: rule.burst,
            current_tokens,
        })
    }

    /// Keys of all stored rules. Drives bulk reporting.
    pub async fn list_rule_keys(&self) -> Result<BTreeSet<String>> {
        Ok(self.rules.list_keys().await?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{Rule, TokenBucketEngine};
    use crate::store::MemoryStore;

    struct Fixture {
        rules: RuleStore,
        engine: TokenBucketEngine,
        stats: StatsProvider,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(clock.clone()));
        let rules = RuleStore::new(store.clone(), clock.clone());
        Fixture {
            engine: TokenBucketEngine::new(store.clone(), clock),
            stats: StatsProvider::new(rules.clone(), store),
            rules,
        }
    }

    #[tokio::test]
    async fn test_unknown_without_rule() {
        let f = fixture();
        let view = f.stats.get_stats("nobody").await.unwrap();
        assert_eq!(view, StatsView::Unknown);

        let map = view.to_map();
        assert_eq!(map["rate"], Value::from("unknown"));
        assert_eq!(map["current_tokens"], Value::from("unknown"));
    }

    #[tokio::test]
    async fn test_unchecked_key_reports_full_bucket() {
        let f = fixture();
        f.rules.set_rule("k", 5, 20).await.unwrap();

        let view = f.stats.get_stats("k").await.unwrap();
        assert_eq!(
            view,
            StatsView::Known {
                rate: 5,
                burst: 20,
                current_tokens: 20
            }
        );
    }

    #[tokio::test]
    async fn test_reports_live_token_count() {
        let f = fixture();
        f.rules.set_rule("k", 5, 20).await.unwrap();
        for _ in 0..3 {
            f.engine.allow(&Rule::new("k", 5, 20), 1).await.unwrap();
        }

        let map = f.stats.get_stats("k").await.unwrap().to_map();
        assert_eq!(map["current_tokens"], Value::from(17));
        assert_eq!(map["burst"], Value::from(20));
    }

    #[tokio::test]
    async fn test_list_rule_keys() {
        let f = fixture();
        f.rules.set_rule("b", 1, 1).await.unwrap();
        f.rules.set_rule("a", 1, 1).await.unwrap();
        f.engine.allow(&Rule::new("c", 1, 1), 1).await.unwrap();

        let keys: Vec<_> = f.stats.list_rule_keys().await.unwrap().into_iter().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
