//! Persistent per-key rate/burst rules.
//!
//! Rules live in the store as hash records under `rule:<key>` with the
//! fields `rate`, `burst` and `updated_at`. They never expire and are never
//! deleted; writes are blind overwrites, so the last write wins.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{RatekeeperError, Result};
use crate::store::StateStore;

/// Namespace of rule records. Bucket state uses bare keys, so caller keys
/// may not start with this prefix.
pub const RULE_PREFIX: &str = "rule:";

const FIELD_RATE: &str = "rate";
const FIELD_BURST: &str = "burst";
const FIELD_UPDATED_AT: &str = "updated_at";

/// The rate/burst pair governing one key's bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Caller-defined key, e.g. `apikey:model`
    pub key: String,
    /// Tokens added per second
    pub rate: i64,
    /// Bucket capacity
    pub burst: i64,
}

impl Rule {
    pub fn new(key: impl Into<String>, rate: i64, burst: i64) -> Self {
        Self {
            key: key.into(),
            rate,
            burst,
        }
    }
}

/// Rate and burst applied to keys without a stored rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub rate: i64,
    pub burst: i64,
}

impl Limits {
    pub fn for_key(&self, key: &str) -> Rule {
        Rule::new(key, self.rate, self.burst)
    }
}

/// A decoded rule record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub rate: i64,
    pub burst: i64,
    /// Unix seconds of the last write, if recorded
    pub updated_at: Option<i64>,
}

impl RuleRecord {
    /// Decode the raw hash fields of a stored rule.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let rate = parse_positive(key, FIELD_RATE, fields.get(FIELD_RATE).map(String::as_str))?;
        let burst = parse_positive(key, FIELD_BURST, fields.get(FIELD_BURST).map(String::as_str))?;
        let updated_at = fields
            .get(FIELD_UPDATED_AT)
            .and_then(|raw| raw.parse::<i64>().ok());

        Ok(Self {
            rate,
            burst,
            updated_at,
        })
    }
}

/// Reject keys that are empty or would collide with the rule namespace.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(RatekeeperError::Validation("key must not be empty".to_string()));
    }
    if key.starts_with(RULE_PREFIX) {
        return Err(RatekeeperError::Validation(format!(
            "key must not start with the reserved prefix {:?}",
            RULE_PREFIX
        )));
    }
    Ok(())
}

fn rule_key(key: &str) -> String {
    format!("{}{}", RULE_PREFIX, key)
}

fn parse_positive(key: &str, field: &str, raw: Option<&str>) -> Result<i64> {
    let raw = raw.ok_or_else(|| RatekeeperError::CorruptRule {
        key: key.to_string(),
        reason: format!("missing {} field", field),
    })?;
    match raw.parse::<i64>() {
        Ok(value) if value > 0 => Ok(value),
        Ok(value) => Err(RatekeeperError::CorruptRule {
            key: key.to_string(),
            reason: format!("{} must be positive, found {}", field, value),
        }),
        Err(e) => Err(RatekeeperError::CorruptRule {
            key: key.to_string(),
            reason: format!("invalid {} value {:?}: {}", field, raw, e),
        }),
    }
}

/// Reads and writes rule records.
#[derive(Clone)]
pub struct RuleStore {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl RuleStore {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create or overwrite the rule for `key`.
    ///
    /// Non-positive values are rejected before the store is touched.
    pub async fn set_rule(&self, key: &str, rate: i64, burst: i64) -> Result<()> {
        validate_key(key)?;
        if rate <= 0 {
            return Err(RatekeeperError::Validation(
                "rate must be greater than 0".to_string(),
            ));
        }
        if burst <= 0 {
            return Err(RatekeeperError::Validation(
                "burst must be greater than 0".to_string(),
            ));
        }

        info!(key = %key, rate, burst, "Setting rate limit rule");

        let fields = [
            (FIELD_RATE, rate.to_string()),
            (FIELD_BURST, burst.to_string()),
            (FIELD_UPDATED_AT, self.clock.now_secs().to_string()),
        ];
        self.store
            .hash_set(&rule_key(key), &fields)
            .await
            .map_err(|e| {
                error!(key = %key, error = %e, "Failed to set rate limit rule");
                e
            })?;

        info!(key = %key, "Rate limit rule set successfully");
        Ok(())
    }

    /// Look up the rule for `key`.
    ///
    /// `Ok(None)` means no rule is stored and the caller should apply its
    /// own default. It is distinct from a store failure, which is an `Err`.
    pub async fn get_rule(&self, key: &str) -> Result<Option<Rule>> {
        validate_key(key)?;
        debug!(key = %key, "Getting rate limit rule");

        let fields = self
            .store
            .hash_get(&rule_key(key), &[FIELD_RATE, FIELD_BURST])
            .await?;

        let (rate, burst) = match fields.as_slice() {
            [Some(rate), Some(burst)] => (rate.as_str(), burst.as_str()),
            _ => {
                debug!(key = %key, "Rate limit rule not found");
                return Ok(None);
            }
        };

        let rule = Rule::new(
            key,
            parse_positive(key, FIELD_RATE, Some(rate))?,
            parse_positive(key, FIELD_BURST, Some(burst))?,
        );
        debug!(key = %key, rate = rule.rate, burst = rule.burst, "Retrieved rate limit rule");
        Ok(Some(rule))
    }

    /// The stored rule for `key`, or `defaults` if there is none.
    ///
    /// Store failures are returned as errors, never papered over with the
    /// defaults.
    pub async fn resolve(&self, key: &str, defaults: Limits) -> Result<Rule> {
        match self.get_rule(key).await? {
            Some(rule) => Ok(rule),
            None => {
                debug!(
                    key = %key,
                    rate = defaults.rate,
                    burst = defaults.burst,
                    "Rule not found, using defaults"
                );
                Ok(defaults.for_key(key))
            }
        }
    }

    /// The full decoded record for `key`, including its write time.
    pub async fn get_record(&self, key: &str) -> Result<Option<RuleRecord>> {
        validate_key(key)?;
        let fields = self.store.hash_get_all(&rule_key(key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        RuleRecord::from_fields(key, &fields).map(Some)
    }

    /// Caller keys of every stored rule, without the namespace prefix.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let keys = self.store.keys_with_prefix(RULE_PREFIX).await?;
        info!(count = keys.len(), "Found rate limit rules");

        Ok(keys
            .into_iter()
            .filter_map(|record_key| record_key.strip_prefix(RULE_PREFIX).map(str::to_string))
            .collect())
    }

    /// Raw fields of every stored rule, keyed by caller key.
    ///
    /// A snapshot without ordering; rules written concurrently may or may
    /// not be included. Records that fail to load are logged and skipped.
    pub async fn list_rules(&self) -> Result<HashMap<String, HashMap<String, String>>> {
        debug!("Getting all rate limit rules");

        let keys = self.list_keys().await?;
        let mut rules = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.store.hash_get_all(&rule_key(&key)).await {
                Ok(fields) if fields.is_empty() => {}
                Ok(fields) => {
                    rules.insert(key, fields);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to get rule data");
                }
            }
        }

        Ok(rules)
    }
}
