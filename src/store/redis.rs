//! Redis-backed rate-limit store.

use crate::error::{LimiterError, Result};
use crate::store::{script, RateLimitStore, StoreRequest, StoreResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;

/// Redis-backed store executing the atomic evaluation script.
///
/// Holds one long-lived multiplexed connection; the script is loaded by SHA
/// on first use and invoked by hash afterwards.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| LimiterError::Store(format!("Failed to create Redis client: {}", e)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| LimiterError::Store(format!("Failed to connect to Redis: {}", e)))?;

        let mut test_conn = connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut test_conn)
            .await
            .map_err(|e| LimiterError::Store(format!("Redis connection test failed: {}", e)))?;

        tracing::info!("Initialized Redis rate-limit store");

        Ok(Self {
            connection,
            timeout,
        })
    }

    /// Build a store from an existing connection manager
    pub fn from_manager(connection: ConnectionManager, timeout: Duration) -> Self {
        Self {
            connection,
            timeout,
        }
    }

    async fn invoke(&self, request: &StoreRequest) -> Result<StoreResult> {
        let mut conn = self.connection.clone();

        let mut invocation = script::EVALUATE.prepare_invoke();
        invocation
            .key(&request.bucket_key)
            .key(&request.block_key)
            .key(&request.violation_key)
            .arg(request.capacity)
            // Rust's Display is invariant; the script sees `10` or `2.5`
            // regardless of process locale.
            .arg(format!("{}", request.window.as_secs_f64()))
            .arg(request.cost)
            .arg(request.penalty.violation_window.as_secs())
            .arg(request.penalty.penalties.len());

        for penalty in &request.penalty.penalties {
            invocation.arg(penalty.as_secs());
        }

        let reply: redis::Value = invocation.invoke_async(&mut conn).await?;
        script::parse_reply(reply)
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn evaluate(&self, request: &StoreRequest) -> Result<StoreResult> {
        match tokio::time::timeout(self.timeout, self.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(LimiterError::StoreTimeout(self.timeout)),
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}
