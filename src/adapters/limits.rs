//! Per-user active-alert counters.
//!
//! Counters are incremented when an alert is registered and decremented when
//! it is removed or fires. Decrement-on-fire is guarded by a per-alert
//! idempotency set so a retried decrement never double-counts. Counter errors
//! are tolerated by callers; drift is reconcilable offline.

use crate::error::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

const PRICE_COUNTS_KEY: &str = "user_active_alerts:price";
const STRATEGY_COUNTS_KEY: &str = "user_active_alerts:strategy";
const PRICE_DECREMENTS_KEY: &str = "price_alert_decrements";
const STRATEGY_DECREMENTS_KEY: &str = "strategy_alert_decrements";

/// Limits collaborator tracking active alerts per user.
#[async_trait]
pub trait UserLimits: Send + Sync {
    async fn increment_active_price_alerts(&self, user_id: i64) -> Result<()>;
    /// Idempotent per `alert_id`; safe to retry after partial failure.
    async fn decrement_active_price_alerts(&self, user_id: i64, alert_id: i64) -> Result<()>;
    async fn increment_active_strategy_alerts(&self, user_id: i64) -> Result<()>;
    async fn decrement_active_strategy_alerts(&self, user_id: i64, strategy_id: i64) -> Result<()>;
}

/// Cache-backed counters used in production.
#[derive(Clone)]
pub struct RedisUserLimits {
    conn: ConnectionManager,
}

impl RedisUserLimits {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn increment(&self, counts_key: &str, user_id: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hincr(counts_key, user_id, 1).await?;
        Ok(())
    }

    async fn decrement(
        &self,
        counts_key: &str,
        guard_key: &str,
        user_id: i64,
        related_id: i64,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let newly_seen: i64 = conn.sadd(guard_key, related_id).await?;
        if newly_seen == 0 {
            // Already decremented for this alert
            return Ok(());
        }
        let count: i64 = conn.hincr(counts_key, user_id, -1).await?;
        if count < 0 {
            // Tolerate decrement of an absent counter
            let _: () = conn.hset(counts_key, user_id, 0).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UserLimits for RedisUserLimits {
    async fn increment_active_price_alerts(&self, user_id: i64) -> Result<()> {
        self.increment(PRICE_COUNTS_KEY, user_id).await
    }

    async fn decrement_active_price_alerts(&self, user_id: i64, alert_id: i64) -> Result<()> {
        self.decrement(PRICE_COUNTS_KEY, PRICE_DECREMENTS_KEY, user_id, alert_id)
            .await
    }

    async fn increment_active_strategy_alerts(&self, user_id: i64) -> Result<()> {
        self.increment(STRATEGY_COUNTS_KEY, user_id).await
    }

    async fn decrement_active_strategy_alerts(&self, user_id: i64, strategy_id: i64) -> Result<()> {
        self.decrement(
            STRATEGY_COUNTS_KEY,
            STRATEGY_DECREMENTS_KEY,
            user_id,
            strategy_id,
        )
        .await
    }
}

/// In-memory counters used for testing.
#[derive(Default)]
pub struct InMemoryUserLimits {
    inner: Mutex<LimitsState>,
}

#[derive(Default)]
struct LimitsState {
    price_counts: HashMap<i64, i64>,
    strategy_counts: HashMap<i64, i64>,
    price_decrements: HashSet<i64>,
    strategy_decrements: HashSet<i64>,
}

impl InMemoryUserLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Helper used in tests.
    pub fn active_price_alerts(&self, user_id: i64) -> i64 {
        self.inner
            .lock()
            .unwrap()
            .price_counts
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    /// Helper used in tests.
    pub fn active_strategy_alerts(&self, user_id: i64) -> i64 {
        self.inner
            .lock()
            .unwrap()
            .strategy_counts
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl UserLimits for InMemoryUserLimits {
    async fn increment_active_price_alerts(&self, user_id: i64) -> Result<()> {
        *self
            .inner
            .lock()
            .unwrap()
            .price_counts
            .entry(user_id)
            .or_default() += 1;
        Ok(())
    }

    async fn decrement_active_price_alerts(&self, user_id: i64, alert_id: i64) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if !state.price_decrements.insert(alert_id) {
            return Ok(());
        }
        let count = state.price_counts.entry(user_id).or_default();
        *count = (*count - 1).max(0);
        Ok(())
    }

    async fn increment_active_strategy_alerts(&self, user_id: i64) -> Result<()> {
        *self
            .inner
            .lock()
            .unwrap()
            .strategy_counts
            .entry(user_id)
            .or_default() += 1;
        Ok(())
    }

    async fn decrement_active_strategy_alerts(&self, user_id: i64, strategy_id: i64) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if !state.strategy_decrements.insert(strategy_id) {
            return Ok(());
        }
        let count = state.strategy_counts.entry(user_id).or_default();
        *count = (*count - 1).max(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_decrement_is_idempotent_per_alert() {
        let limits = InMemoryUserLimits::new();
        limits.increment_active_price_alerts(1).await.unwrap();
        limits.increment_active_price_alerts(1).await.unwrap();
        assert_eq!(limits.active_price_alerts(1), 2);

        limits.decrement_active_price_alerts(1, 100).await.unwrap();
        limits.decrement_active_price_alerts(1, 100).await.unwrap();
        assert_eq!(limits.active_price_alerts(1), 1);

        limits.decrement_active_price_alerts(1, 101).await.unwrap();
        assert_eq!(limits.active_price_alerts(1), 0);
    }

    #[tokio::test]
    async fn test_decrement_tolerates_absent_counter() {
        let limits = InMemoryUserLimits::new();
        limits.decrement_active_strategy_alerts(5, 9).await.unwrap();
        assert_eq!(limits.active_strategy_alerts(5), 0);
    }
}
