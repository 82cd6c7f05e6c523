//! Redis-backed state store.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{IntoConnectionInfo, Value};
use tracing::{debug, error, info, warn};

use super::StateStore;
use crate::config::RedisConfig;
use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{BucketRequest, Decision};

/// Server-side token bucket step, see `token_bucket.lua`.
const TOKEN_BUCKET_SCRIPT: &str = include_str!("token_bucket.lua");

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 100;

/// Redis state store.
///
/// Atomicity of the bucket step comes from running it as a Lua script,
/// which Redis executes without interleaving other commands. Reconnects
/// with exponential backoff are handled by the connection manager; this
/// type never retries a command itself.
pub struct RedisStore {
    connection: ConnectionManager,
    script: redis::Script,
    command_timeout: Duration,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connect and verify the server answers a PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!(
            url = %config.url,
            db = config.db,
            max_retries = config.max_retries,
            "Initializing Redis connection"
        );

        let mut info = config.url.as_str().into_connection_info()?;
        info.redis.db = config.db;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }
        let client = redis::Client::open(info)?;

        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(config.max_retries)
            .set_max_delay(config.max_retry_backoff_ms)
            .set_connection_timeout(config.connect_timeout())
            .set_response_timeout(config.command_timeout());

        let connection = tokio::time::timeout(
            config.connect_timeout(),
            ConnectionManager::new_with_config(client, manager_config),
        )
        .await
        .map_err(|_| RatekeeperError::Timeout(config.connect_timeout()))?
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            RatekeeperError::from(e)
        })?;

        let store = Self {
            connection,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
            command_timeout: config.command_timeout(),
            closed: AtomicBool::new(false),
        };
        store.ping().await?;

        info!("Redis connection established successfully");
        Ok(store)
    }

    /// Run one round trip under the command timeout.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>> + Send,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RatekeeperError::StoreClosed);
        }

        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(operation, error = %e, "Redis command failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = self.command_timeout.as_millis() as u64,
                    "Redis command timed out"
                );
                Err(RatekeeperError::Timeout(self.command_timeout))
            }
        }
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.bounded("GET", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value.as_str());
        }
        let _: Value = self
            .bounded("HSET", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key).arg(fields);
        self.bounded("HMGET", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.bounded("HGETALL", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut seen = HashSet::new();
        let mut cursor: u64 = 0;

        loop {
            let mut conn = self.connection.clone();
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) = self
                .bounded("SCAN", async move { cmd.query_async(&mut conn).await })
                .await?;

            // SCAN may return a key more than once
            seen.extend(batch.into_iter().filter(|k| k.starts_with(prefix)));

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix, count = seen.len(), "Scanned keys by prefix");
        Ok(seen.into_iter().collect())
    }

    async fn consume_tokens(&self, request: &BucketRequest) -> Result<Decision> {
        let mut conn = self.connection.clone();
        let mut invocation = self.script.key(request.tokens_key());
        invocation
            .key(request.refreshed_key())
            .arg(request.rate)
            .arg(request.burst)
            .arg(request.now)
            .arg(request.cost)
            .arg(request.ttl_secs());

        let reply: Value = self
            .bounded("EVALSHA", async move { invocation.invoke_async(&mut conn).await })
            .await?;

        parse_decision(reply)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let cmd = redis::cmd("PING");
        let _: String = self
            .bounded("PING", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closing Redis connection");
        }
        Ok(())
    }
}

/// Decode the script reply `{allowed, remaining}`.
///
/// Anything else is a hard failure; guessing a decision from a reply we
/// do not understand would silently admit or reject traffic.
fn parse_decision(reply: Value) -> Result<Decision> {
    match reply {
        Value::Array(items) if items.len() == 2 => match (&items[0], &items[1]) {
            (Value::Int(flag @ (0 | 1)), Value::Int(remaining)) if *remaining >= 0 => {
                Ok(Decision {
                    allowed: *flag == 1,
                    remaining: *remaining,
                })
            }
            _ => Err(RatekeeperError::MalformedResult(format!(
                "unexpected element types: {:?}",
                items
            ))),
        },
        other => Err(RatekeeperError::MalformedResult(format!(
            "expected [allowed, remaining], got {:?}",
            other
        ))),
    }
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::refreshed_key;

    #[test]
    fn test_parse_decision_allowed() {
        let reply = Value::Array(vec![Value::Int(1), Value::Int(49)]);
        let decision = parse_decision(reply).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 49);
    }

    #[test]
    fn test_parse_decision_denied() {
        let reply = Value::Array(vec![Value::Int(0), Value::Int(0)]);
        let decision = parse_decision(reply).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_parse_decision_rejects_malformed_replies() {
        let cases = vec![
            Value::Nil,
            Value::Int(1),
            Value::Array(vec![Value::Int(1)]),
            Value::Array(vec![Value::Int(2), Value::Int(3)]),
            Value::Array(vec![Value::Int(1), Value::Int(-1)]),
            Value::Array(vec![Value::Int(1), Value::BulkString(b"49".to_vec())]),
        ];

        for reply in cases {
            let err = parse_decision(reply).unwrap_err();
            assert!(matches!(err, RatekeeperError::MalformedResult(_)));
        }
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("rule:"), "rule:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_script_uses_both_bucket_keys() {
        assert!(TOKEN_BUCKET_SCRIPT.contains("KEYS[1]"));
        assert!(TOKEN_BUCKET_SCRIPT.contains("KEYS[2]"));
        assert_eq!(refreshed_key("k"), "k:last_refreshed");
    }

    fn redis_config() -> Option<RedisConfig> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(RedisConfig {
            url,
            ..RedisConfig::default()
        })
    }

    #[tokio::test]
    #[ignore = "requires a running Redis; set REDIS_URL"]
    async fn test_redis_consume_tokens() {
        let Some(config) = redis_config() else { return };
        let store = RedisStore::connect(&config).await.unwrap();
        let key = format!("ratekeeper-test:{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let now = chrono::Utc::now().timestamp();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let request = BucketRequest {
                key: key.clone(),
                rate: 1,
                burst: 2,
                now,
                cost: 1,
            };
            let decision = store.consume_tokens(&request).await.unwrap();
            outcomes.push((decision.allowed, decision.remaining));
        }
        assert_eq!(outcomes, vec![(true, 1), (true, 0), (false, 0)]);

        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("0"));
        store.close().await.unwrap();
        assert!(matches!(store.get(&key).await, Err(RatekeeperError::StoreClosed)));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis; set REDIS_URL"]
    async fn test_redis_hash_and_scan() {
        let Some(config) = redis_config() else { return };
        let store = RedisStore::connect(&config).await.unwrap();
        let key = format!("rule:ratekeeper-test:{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));

        store
            .hash_set(&key, &[("rate", "5".to_string()), ("burst", "20".to_string())])
            .await
            .unwrap();

        let fields = store.hash_get(&key, &["rate", "burst", "missing"]).await.unwrap();
        assert_eq!(fields, vec![Some("5".to_string()), Some("20".to_string()), None]);

        let keys = store.keys_with_prefix("rule:ratekeeper-test:").await.unwrap();
        assert!(keys.contains(&key));
    }
}
