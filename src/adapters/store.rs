//! Persistent-store contract used by the engine.
//!
//! The engine touches a narrow slice of the platform schema: the initial load
//! of active alerts, alert-state flips, append-only alert logs, and the
//! asynchronous persistence of discovered universes. `PostgresStore` is the
//! production implementation; `InMemoryAlertStore` backs the tests.

use crate::domain::{AlertLogEntry, NewPriceAlert, PriceAlert, StrategyAlert};
use crate::error::{AlertError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Price alerts with `active = true`, tickers resolved.
    async fn load_active_price_alerts(&self) -> Result<Vec<PriceAlert>>;

    /// Strategies with `alert_active = true`.
    async fn load_active_strategy_alerts(&self) -> Result<Vec<StrategyAlert>>;

    /// Ticker for a security, from the catalog.
    async fn resolve_ticker(&self, security_id: i64) -> Result<String>;

    /// Persist a new price alert; the store assigns the id.
    async fn insert_price_alert(&self, alert: &NewPriceAlert) -> Result<i64>;

    /// Flip `active = false` after a fire or removal.
    async fn deactivate_price_alert(&self, alert_id: i64) -> Result<()>;

    async fn insert_alert_log(&self, entry: &AlertLogEntry) -> Result<()>;

    async fn update_strategy_last_trigger(
        &self,
        strategy_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Persist a worker-discovered universe (`alert_universe_full`).
    async fn update_strategy_universe(&self, strategy_id: i64, symbols: &[String]) -> Result<()>;

    async fn set_strategy_alert_active(&self, strategy_id: i64, active: bool) -> Result<()>;
}

/// In-memory AlertStore used for testing.
#[derive(Default)]
pub struct InMemoryAlertStore {
    inner: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    next_alert_id: i64,
    securities: HashMap<i64, String>,
    price_alerts: HashMap<i64, (PriceAlert, bool)>,
    strategies: HashMap<i64, StrategyAlert>,
    strategy_active: HashMap<i64, bool>,
    universes: HashMap<i64, Vec<String>>,
    last_triggers: HashMap<i64, DateTime<Utc>>,
    logs: Vec<AlertLogEntry>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_security(self, security_id: i64, ticker: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .securities
            .insert(security_id, ticker.to_string());
        self
    }

    /// Seed an already-persisted active alert (initial-load fixture).
    pub fn seed_price_alert(&self, alert: PriceAlert) {
        let mut state = self.inner.lock().unwrap();
        state.next_alert_id = state.next_alert_id.max(alert.alert_id);
        state.price_alerts.insert(alert.alert_id, (alert, true));
    }

    pub fn seed_strategy(&self, strategy: StrategyAlert) {
        let mut state = self.inner.lock().unwrap();
        state.strategy_active.insert(strategy.strategy_id, true);
        state.strategies.insert(strategy.strategy_id, strategy);
    }

    /// Helper used in tests.
    pub fn is_alert_active(&self, alert_id: i64) -> Option<bool> {
        self.inner
            .lock()
            .unwrap()
            .price_alerts
            .get(&alert_id)
            .map(|(_, active)| *active)
    }

    /// Helper used in tests.
    pub fn logged_entries(&self) -> Vec<AlertLogEntry> {
        self.inner.lock().unwrap().logs.clone()
    }

    /// Helper used in tests.
    pub fn persisted_universe(&self, strategy_id: i64) -> Option<Vec<String>> {
        self.inner.lock().unwrap().universes.get(&strategy_id).cloned()
    }

    /// Helper used in tests.
    pub fn persisted_last_trigger(&self, strategy_id: i64) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .last_triggers
            .get(&strategy_id)
            .copied()
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn load_active_price_alerts(&self) -> Result<Vec<PriceAlert>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .price_alerts
            .values()
            .filter(|(_, active)| *active)
            .map(|(alert, _)| alert.clone())
            .collect())
    }

    async fn load_active_strategy_alerts(&self) -> Result<Vec<StrategyAlert>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .strategies
            .values()
            .filter(|s| state.strategy_active.get(&s.strategy_id).copied().unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn resolve_ticker(&self, security_id: i64) -> Result<String> {
        self.inner
            .lock()
            .unwrap()
            .securities
            .get(&security_id)
            .cloned()
            .ok_or_else(|| AlertError::Internal(format!("unknown security {security_id}")))
    }

    async fn insert_price_alert(&self, alert: &NewPriceAlert) -> Result<i64> {
        let mut state = self.inner.lock().unwrap();
        state.next_alert_id += 1;
        let alert_id = state.next_alert_id;
        let ticker = state
            .securities
            .get(&alert.security_id)
            .cloned()
            .unwrap_or_default();
        state.price_alerts.insert(
            alert_id,
            (
                PriceAlert {
                    alert_id,
                    user_id: alert.user_id,
                    security_id: alert.security_id,
                    ticker,
                    price: alert.price,
                    direction: alert.direction,
                },
                true,
            ),
        );
        Ok(alert_id)
    }

    async fn deactivate_price_alert(&self, alert_id: i64) -> Result<()> {
        if let Some((_, active)) = self.inner.lock().unwrap().price_alerts.get_mut(&alert_id) {
            *active = false;
        }
        Ok(())
    }

    async fn insert_alert_log(&self, entry: &AlertLogEntry) -> Result<()> {
        self.inner.lock().unwrap().logs.push(entry.clone());
        Ok(())
    }

    async fn update_strategy_last_trigger(
        &self,
        strategy_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .last_triggers
            .insert(strategy_id, at);
        Ok(())
    }

    async fn update_strategy_universe(&self, strategy_id: i64, symbols: &[String]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .universes
            .insert(strategy_id, symbols.to_vec());
        Ok(())
    }

    async fn set_strategy_alert_active(&self, strategy_id: i64, active: bool) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .strategy_active
            .insert(strategy_id, active);
        Ok(())
    }
}
