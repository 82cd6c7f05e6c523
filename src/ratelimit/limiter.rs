//! The rate limiter as seen by the front end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::bucket::Decision;
use super::engine::TokenBucketEngine;
use super::rules::{Limits, Rule, RuleRecord, RuleStore};
use super::stats::{StatsProvider, StatsView};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::StateStore;

/// Result of a rate limit check together with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub rule: Rule,
    pub cost: i64,
    pub decision: Decision,
}

impl StatsReport {
    /// Render as `{"rules": {key: record}, "stats": {key: stats}}`.
    pub fn to_json(&self) -> Value {
        let rules: Map<String, Value> = self
            .rules
            .iter()
            .map(|(key, record)| {
                (
                    key.clone(),
                    json!({
                        "rate": record.rate,
                        "burst": record.burst,
                        "updated_at": record.updated_at,
                    }),
                )
            })
            .collect();
        let stats: Map<String, Value> = self
            .stats
            .iter()
            .map(|(key, view)| (key.clone(), Value::Object(view.to_map())))
            .collect();

        json!({ "rules": rules, "stats": stats })
    }
}

impl CheckOutcome {
    /// Time until the same request would be admitted, if it was denied.
    pub fn retry_after(&self) -> Option<Duration> {
        self.decision.retry_after(self.rule.rate, self.rule.burst, self.cost)
    }
}

/// Every stored rule with its statistics.
#[derive(Debug, Clone, Default)]
pub struct StatsReport {
    pub rules: HashMap<String, RuleRecord>,
    pub stats: HashMap<String, StatsView>,
}

/// Rule lookup, admission control and reporting over one store handle.
///
/// Holds no mutable state of its own and can be shared freely across tasks.
pub struct RateLimiter {
    rules: RuleStore,
    engine: TokenBucketEngine,
    stats: StatsProvider,
    defaults: Limits,
}

impl RateLimiter {
    /// Create a rate limiter. `defaults` apply to keys without a stored rule.
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, defaults: Limits) -> Self {
        let rules = RuleStore::new(store.clone(), clock.clone());
        Self {
            engine: TokenBucketEngine::new(store.clone(), clock),
            stats: StatsProvider::new(rules.clone(), store),
            rules,
            defaults,
        }
    }

    /// Resolve the rule for `key` and consume `cost` tokens under it.
    pub async fn check(&self, key: &str, cost: i64) -> Result<CheckOutcome> {
        let rule = self.rules.resolve(key, self.defaults).await?;
        let decision = self.engine.allow(&rule, cost).await?;

        if !decision.allowed {
            warn!(key = %key, rate = rule.rate, burst = rule.burst, "Rate limit exceeded");
        }

        Ok(CheckOutcome {
            rule,
            cost,
            decision,
        })
    }

    /// Store a rule for `key`. A zero burst selects the default burst.
    pub async fn update_rule(&self, key: &str, rate: i64, burst: i64) -> Result<Rule> {
        let burst = if burst == 0 {
            debug!(key = %key, burst = self.defaults.burst, "Using default burst value");
            self.defaults.burst
        } else {
            burst
        };

        self.rules.set_rule(key, rate, burst).await?;
        Ok(Rule::new(key, rate, burst))
    }

    /// Statistics for a single key.
    pub async fn rule_stats(&self, key: &str) -> Result<StatsView> {
        self.stats.get_stats(key).await
    }

    /// Statistics for every stored rule.
    ///
    /// Keys whose record or statistics cannot be read are logged and left
    /// out; only a failure to enumerate the rules fails the whole report.
    pub async fn all_stats(&self) -> Result<StatsReport> {
        let keys = self.stats.list_rule_keys().await?;
        let mut report = StatsReport::default();

        for key in keys {
            match self.rules.get_record(&key).await {
                Ok(Some(record)) => {
                    report.rules.insert(key.clone(), record);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable rule");
                    continue;
                }
            }

            match self.stats.get_stats(&key).await {
                Ok(view) => {
                    report.stats.insert(key, view);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to get stats for key");
                }
            }
        }

        info!(
            rules_count = report.rules.len(),
            stats_count = report.stats.len(),
            "Stats retrieved successfully"
        );
        Ok(report)
    }
}
