//! RateKeeper service implementation.

use std::collections::HashMap;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use super::proto::ratekeeper::v1 as pb;
use super::proto::ratekeeper::v1::rate_keeper_server::RateKeeper;
use crate::config::FailureMode;
use crate::error::RatekeeperError;
use crate::ratelimit::{RateLimiter, RuleRecord, StatsView};

/// Reported as `remaining` when the failure policy decided instead of the store.
const REMAINING_UNKNOWN: i64 = -1;

/// Implementation of the `ratekeeper.v1.RateKeeper` gRPC interface.
pub struct RateKeeperService {
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Answer policy when the store is unavailable
    failure_mode: FailureMode,
}

impl RateKeeperService {
    /// Create a new service over the given rate limiter.
    pub fn new(rate_limiter: Arc<RateLimiter>, failure_mode: FailureMode) -> Self {
        Self {
            rate_limiter,
            failure_mode,
        }
    }

    /// Apply the configured policy to a failed check.
    fn check_failed(&self, key: &str, err: RatekeeperError) -> Result<pb::CheckRateLimitResponse, Status> {
        if !err.is_store_unavailable() {
            if matches!(err, RatekeeperError::Validation(_)) {
                warn!(key = %key, error = %err, "Invalid rate limit check");
            } else {
                error!(key = %key, error = %err, "Rate limit check failed");
            }
            return Err(err.into());
        }

        match self.failure_mode {
            FailureMode::Propagate => {
                error!(key = %key, error = %err, "Rate limit check failed");
                Err(err.into())
            }
            FailureMode::Open => {
                warn!(key = %key, error = %err, "Store unavailable, failing open");
                Ok(pb::CheckRateLimitResponse {
                    allowed: true,
                    remaining: REMAINING_UNKNOWN,
                    message: "Rate limit store unavailable; request admitted".to_string(),
                    retry_after: None,
                })
            }
            FailureMode::Closed => {
                warn!(key = %key, error = %err, "Store unavailable, failing closed");
                Ok(pb::CheckRateLimitResponse {
                    allowed: false,
                    remaining: REMAINING_UNKNOWN,
                    message: "Rate limit store unavailable; request rejected".to_string(),
                    retry_after: None,
                })
            }
        }
    }
}

fn require_key(key: &str) -> Result<(), Status> {
    if key.is_empty() {
        warn!("Received request with empty key");
        return Err(Status::invalid_argument("key is required"));
    }
    Ok(())
}

fn key_stats(view: StatsView) -> pb::KeyStats {
    match view {
        StatsView::Unknown => pb::KeyStats {
            known: false,
            ..Default::default()
        },
        StatsView::Known {
            rate,
            burst,
            current_tokens,
        } => pb::KeyStats {
            known: true,
            rate,
            burst,
            current_tokens,
        },
    }
}

fn rule_record(record: RuleRecord) -> pb::RuleRecord {
    pb::RuleRecord {
        rate: record.rate,
        burst: record.burst,
        updated_at: record.updated_at.map(|seconds| prost_types::Timestamp { seconds, nanos: 0 }),
    }
}

#[tonic::async_trait]
impl RateKeeper for RateKeeperService {
    /// Consume tokens for a key.
    ///
    /// The rule stored for the key is used, or the configured default when
    /// there is none.
    #[instrument(
        skip(self, request),
        fields(key = %request.get_ref().key, cost = request.get_ref().cost)
    )]
    async fn check_rate_limit(
        &self,
        request: Request<pb::CheckRateLimitRequest>,
    ) -> Result<Response<pb::CheckRateLimitResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;

        // Get the number of tokens to consume (default to 1 if not specified)
        let cost = if req.cost == 0 { 1 } else { req.cost };

        let outcome = match self.rate_limiter.check(&req.key, cost).await {
            Ok(outcome) => outcome,
            Err(e) => return self.check_failed(&req.key, e).map(Response::new),
        };

        let retry_after = outcome.retry_after().map(|wait| prost_types::Duration {
            seconds: wait.as_secs() as i64,
            nanos: 0,
        });
        let message = if outcome.decision.allowed {
            String::new()
        } else {
            "Rate limit exceeded".to_string()
        };

        info!(
            key = %req.key,
            allowed = outcome.decision.allowed,
            remaining = outcome.decision.remaining,
            "Rate limit check completed"
        );

        Ok(Response::new(pb::CheckRateLimitResponse {
            allowed: outcome.decision.allowed,
            remaining: outcome.decision.remaining,
            message,
            retry_after,
        }))
    }

    #[instrument(
        skip(self, request),
        fields(key = %request.get_ref().key, rate = request.get_ref().rate, burst = request.get_ref().burst)
    )]
    async fn update_rule(
        &self,
        request: Request<pb::UpdateRuleRequest>,
    ) -> Result<Response<pb::UpdateRuleResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;

        let rule = self
            .rate_limiter
            .update_rule(&req.key, req.rate, req.burst)
            .await
            .map_err(|e| {
                warn!(key = %req.key, error = %e, "Failed to update rate limit rule");
                Status::from(e)
            })?;

        info!(
            key = %rule.key,
            rate = rule.rate,
            burst = rule.burst,
            "Rate limit rule updated successfully"
        );

        Ok(Response::new(pb::UpdateRuleResponse {
            status: "success".to_string(),
            message: "Rate limit rule updated successfully".to_string(),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn get_stats(
        &self,
        _request: Request<pb::GetStatsRequest>,
    ) -> Result<Response<pb::GetStatsResponse>, Status> {
        let report = self.rate_limiter.all_stats().await.map_err(|e| {
            error!(error = %e, "Failed to get rules");
            Status::from(e)
        })?;

        let rules: HashMap<String, pb::RuleRecord> = report
            .rules
            .into_iter()
            .map(|(key, record)| (key, rule_record(record)))
            .collect();
        let stats: HashMap<String, pb::KeyStats> = report
            .stats
            .into_iter()
            .map(|(key, view)| (key, key_stats(view)))
            .collect();

        debug!(rules_count = rules.len(), stats_count = stats.len(), "Returning stats");
        Ok(Response::new(pb::GetStatsResponse { rules, stats }))
    }

    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn get_rule_stats(
        &self,
        request: Request<pb::GetRuleStatsRequest>,
    ) -> Result<Response<pb::GetRuleStatsResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;

        let view = self.rate_limiter.rule_stats(&req.key).await.map_err(|e| {
            error!(key = %req.key, error = %e, "Failed to get stats");
            Status::from(e)
        })?;

        Ok(Response::new(pb::GetRuleStatsResponse {
            key: req.key,
            stats: Some(key_stats(view)),
        }))
    }
}
