//! PostgreSQL implementation of the engine's store contract.

use crate::adapters::store::AlertStore;
use crate::domain::{
    AlertLogEntry, Direction, NewPriceAlert, PriceAlert, StrategyAlert, Timeframe, Universe,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{info, warn};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool (zero-cost reuse)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AlertStore for PostgresStore {
    async fn load_active_price_alerts(&self) -> Result<Vec<PriceAlert>> {
        let rows = sqlx::query(
            r#"
            SELECT a.alert_id, a.user_id, a.security_id, a.price, a.direction, s.ticker
            FROM alerts a
            JOIN securities s ON s.security_id = a.security_id
            WHERE a.active = true
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut alerts = Vec::with_capacity(rows.len());
        for row in rows {
            let direction_str: String = row.get("direction");
            let direction = match Direction::try_from(direction_str.as_str()) {
                Ok(direction) => direction,
                Err(e) => {
                    warn!("Skipping alert {} with {}", row.get::<i64, _>("alert_id"), e);
                    continue;
                }
            };
            alerts.push(PriceAlert {
                alert_id: row.get("alert_id"),
                user_id: row.get("user_id"),
                security_id: row.get("security_id"),
                ticker: row.get("ticker"),
                price: row.get("price"),
                direction,
            });
        }
        Ok(alerts)
    }

    async fn load_active_strategy_alerts(&self) -> Result<Vec<StrategyAlert>> {
        let rows = sqlx::query(
            r#"
            SELECT strategy_id, user_id, name, alert_threshold, alert_universe,
                   alert_universe_full, min_timeframe, alert_last_trigger_at
            FROM strategies
            WHERE alert_active = true
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let strategies = rows
            .iter()
            .map(|row| {
                let strategy_id: i64 = row.get("strategy_id");
                let universe: Vec<String> = row
                    .get::<Option<Vec<String>>, _>("alert_universe")
                    .unwrap_or_default();
                let discovered: Vec<String> = row
                    .get::<Option<Vec<String>>, _>("alert_universe_full")
                    .unwrap_or_default();
                let min_timeframe = row
                    .get::<Option<String>, _>("min_timeframe")
                    .and_then(|raw| match Timeframe::parse(&raw) {
                        Ok(tf) => Some(tf),
                        Err(e) => {
                            warn!("Strategy {strategy_id} has unusable timeframe: {e}");
                            None
                        }
                    });

                StrategyAlert {
                    strategy_id,
                    user_id: row.get("user_id"),
                    name: row.get("name"),
                    threshold: row.get("alert_threshold"),
                    universe: Universe::from_columns(&universe, &discovered),
                    min_timeframe,
                    last_trigger: row.get::<Option<DateTime<Utc>>, _>("alert_last_trigger_at"),
                }
            })
            .collect();
        Ok(strategies)
    }

    async fn resolve_ticker(&self, security_id: i64) -> Result<String> {
        let row = sqlx::query("SELECT ticker FROM securities WHERE security_id = $1")
            .bind(security_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("ticker"))
    }

    async fn insert_price_alert(&self, alert: &NewPriceAlert) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO alerts (user_id, price, direction, security_id, active)
            VALUES ($1, $2, $3, $4, true)
            RETURNING alert_id
            "#,
        )
        .bind(alert.user_id)
        .bind(alert.price)
        .bind(alert.direction.as_str())
        .bind(alert.security_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("alert_id"))
    }

    async fn deactivate_price_alert(&self, alert_id: i64) -> Result<()> {
        sqlx::query("UPDATE alerts SET active = false WHERE alert_id = $1")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_alert_log(&self, entry: &AlertLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_logs (user_id, alert_type, related_id, ticker, timestamp, message, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.kind.as_str())
        .bind(entry.related_id)
        .bind(&entry.ticker)
        .bind(entry.timestamp)
        .bind(&entry.message)
        .bind(&entry.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_strategy_last_trigger(
        &self,
        strategy_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE strategies SET alert_last_trigger_at = $2 WHERE strategy_id = $1")
            .bind(strategy_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_strategy_universe(&self, strategy_id: i64, symbols: &[String]) -> Result<()> {
        sqlx::query("UPDATE strategies SET alert_universe_full = $2 WHERE strategy_id = $1")
            .bind(strategy_id)
            .bind(symbols)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_strategy_alert_active(&self, strategy_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE strategies SET alert_active = $2 WHERE strategy_id = $1")
            .bind(strategy_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
