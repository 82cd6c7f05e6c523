//! Atomic admission control over shared bucket state.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::bucket::{BucketRequest, Decision};
use super::rules::{validate_key, Rule};
use crate::clock::Clock;
use crate::error::{RatekeeperError, Result};
use crate::store::StateStore;

/// Token bucket admission control.
///
/// The engine keeps no state and takes no locks. Each check is a single
/// call to [`StateStore::consume_tokens`], which the store executes as one
/// indivisible step, so any number of tasks or service instances can share
/// a bucket without over-admitting.
///
/// There is no retry here. A store failure is returned as is, and a
/// [`RatekeeperError::Timeout`] means the decision is unknown: the store may
/// or may not have consumed the tokens.
#[derive(Clone)]
pub struct TokenBucketEngine {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketEngine {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Consume `cost` tokens from the bucket of `rule.key` at the current time.
    pub async fn allow(&self, rule: &Rule, cost: i64) -> Result<Decision> {
        self.allow_at(rule, cost, self.clock.now_secs()).await
    }

    /// Consume `cost` tokens from the bucket of `rule.key` as of `now`
    /// (Unix seconds).
    pub async fn allow_at(&self, rule: &Rule, cost: i64, now: i64) -> Result<Decision> {
        validate_key(&rule.key)?;
        if rule.rate <= 0 {
            return Err(RatekeeperError::Validation(format!(
                "rate must be greater than 0, got {}",
                rule.rate
            )));
        }
        if rule.burst <= 0 {
            return Err(RatekeeperError::Validation(format!(
                "burst must be greater than 0, got {}",
                rule.burst
            )));
        }
        if cost <= 0 {
            return Err(RatekeeperError::Validation(format!(
                "cost must be greater than 0, got {}",
                cost
            )));
        }

        debug!(
            key = %rule.key,
            rate = rule.rate,
            burst = rule.burst,
            cost,
            "Checking rate limit"
        );

        let request = BucketRequest {
            key: rule.key.clone(),
            rate: rule.rate,
            burst: rule.burst,
            now,
            cost,
        };

        let decision = self.store.consume_tokens(&request).await.map_err(|e| {
            error!(key = %rule.key, error = %e, "Rate limit check failed");
            e
        })?;

        info!(
            key = %rule.key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            rate = rule.rate,
            burst = rule.burst,
            "Rate limit check result"
        );

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const START: i64 = 1_700_000_000;

    fn engine() -> (TokenBucketEngine, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (TokenBucketEngine::new(store.clone(), clock.clone()), clock, store)
    }

    async fn check(engine: &TokenBucketEngine, rule: &Rule) -> (bool, i64) {
        let decision = engine.allow(rule, 1).await.unwrap();
        (decision.allowed, decision.remaining)
    }

    #[tokio::test]
    async fn test_first_access_starts_full() {
        let (engine, _, _) = engine();
        let rule = Rule::new("k1", 10, 50);

        assert_eq!(check(&engine, &rule).await, (true, 49));
    }

    #[tokio::test]
    async fn test_depletion_then_refill() {
        let (engine, clock, _) = engine();
        let rule = Rule::new("k3", 1, 2);

        assert_eq!(check(&engine, &rule).await, (true, 1));
        assert_eq!(check(&engine, &rule).await, (true, 0));
        assert_eq!(check(&engine, &rule).await, (false, 0));
        assert_eq!(check(&engine, &rule).await, (false, 0));

        clock.advance(2);
        assert_eq!(check(&engine, &rule).await, (true, 1));
    }

    #[tokio::test]
    async fn test_same_second_sees_no_refill() {
        let (engine, _, _) = engine();
        let rule = Rule::new("fast", 1_000, 3);

        for expected in [2, 1, 0] {
            assert_eq!(check(&engine, &rule).await, (true, expected));
        }
        assert_eq!(check(&engine, &rule).await, (false, 0));
    }

    #[tokio::test]
    async fn test_full_refill_after_idle() {
        let (engine, clock, _) = engine();
        let rule = Rule::new("idle", 2, 10);

        for _ in 0..10 {
            engine.allow(&rule, 1).await.unwrap();
        }
        assert_eq!(check(&engine, &rule).await, (false, 0));

        // burst / rate seconds refill everything
        clock.advance(5);
        assert_eq!(check(&engine, &rule).await, (true, 9));
    }

    #[tokio::test]
    async fn test_expired_state_is_a_fresh_bucket() {
        let (engine, clock, store) = engine();
        let rule = Rule::new("gone", 1, 4);

        engine.allow(&rule, 4).await.unwrap();
        clock.advance(100);
        assert!(store.get("gone").await.unwrap().is_none());

        assert_eq!(check(&engine, &rule).await, (true, 3));
    }

    #[tokio::test]
    async fn test_remaining_stays_within_bounds() {
        let (engine, clock, _) = engine();
        let rule = Rule::new("bounded", 3, 5);

        for step in 0..40 {
            let cost = (step % 3) + 1;
            let decision = engine.allow(&rule, cost).await.unwrap();
            assert!(decision.remaining >= 0);
            assert!(decision.remaining <= rule.burst);
            if step % 4 == 0 {
                clock.advance(1);
            }
        }
    }

    #[tokio::test]
    async fn test_denied_cost_is_not_consumed() {
        let (engine, _, _) = engine();
        let rule = Rule::new("costly", 1, 5);

        let decision = engine.allow(&rule, 6).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 5);

        let decision = engine.allow(&rule, 5).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_explicit_time_and_backwards_clock() {
        let (engine, _, _) = engine();
        let rule = Rule::new("skew", 1, 3);

        engine.allow_at(&rule, 3, START + 10).await.unwrap();
        // A timestamp from the past neither refills nor drains
        let decision = engine.allow_at(&rule, 1, START + 5).await.unwrap();
        assert_eq!(decision, Decision { allowed: false, remaining: 0 });
    }

    #[tokio::test]
    async fn test_rule_change_applies_on_next_check() {
        let (engine, clock, _) = engine();

        engine.allow(&Rule::new("k", 1, 10), 10).await.unwrap();
        clock.advance(1);
        // Faster rate and smaller burst take effect immediately
        let decision = engine.allow(&Rule::new("k", 100, 4), 1).await.unwrap();
        assert_eq!(decision, Decision { allowed: true, remaining: 3 });
    }

    #[tokio::test]
    async fn test_validation_happens_before_store_access() {
        let (engine, _, store) = engine();

        let bad = [
            (Rule::new("k", 0, 10), 1),
            (Rule::new("k", 1, 0), 1),
            (Rule::new("k", 1, 1), 0),
            (Rule::new("rule:k", 1, 1), 1),
            (Rule::new("", 1, 1), 1),
        ];
        for (rule, cost) in bad {
            let err = engine.allow(&rule, cost).await.unwrap_err();
            assert!(matches!(err, RatekeeperError::Validation(_)), "{:?}", rule);
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_propagated() {
        let (engine, _, store) = engine();
        store.close().await.unwrap();

        let err = engine.allow(&Rule::new("k", 1, 1), 1).await.unwrap_err();
        assert!(matches!(err, RatekeeperError::StoreClosed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_over_admission_under_concurrency() {
        let (engine, _, _) = engine();
        let rule = Rule::new("contended", 1, 25);

        let tasks = (0..200).map(|_| {
            let engine = engine.clone();
            let rule = rule.clone();
            tokio::spawn(async move { engine.allow(&rule, 1).await.unwrap() })
        });
        let decisions = futures::future::join_all(tasks).await;

        let admitted = decisions
            .into_iter()
            .map(|joined| joined.unwrap())
            .filter(|decision| decision.allowed)
            .count();
        assert_eq!(admitted, 25);
    }
}
