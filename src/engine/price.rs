//! Per-security price-alert shards and the 1-second evaluation pass.
//!
//! All alerts for one security live in one shard. Each shard tracks the
//! nearest alert price in each direction (`lowest_above`, `highest_below`) so
//! the common no-fire case is a pair of comparisons, independent of how many
//! alerts the shard holds. Removals may leave the boundaries stale; a dirty
//! flag forces a recompute before the next evaluation on that shard.

use crate::adapters::ClosePriceSource;
use crate::domain::{Direction, FiredAlert, PriceAlert};
use crate::engine::dispatch::Dispatcher;
use crate::engine::metrics::EngineMetrics;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// All price alerts for a single security.
pub struct PriceShard {
    security_id: i64,
    inner: RwLock<ShardInner>,
}

struct ShardInner {
    alerts: HashMap<i64, PriceAlert>,
    /// Minimum price among above-alerts; +inf when there are none
    lowest_above: f64,
    /// Maximum price among below-alerts; -inf when there are none
    highest_below: f64,
    dirty: bool,
}

impl ShardInner {
    fn new() -> Self {
        Self {
            alerts: HashMap::new(),
            lowest_above: f64::INFINITY,
            highest_below: f64::NEG_INFINITY,
            dirty: false,
        }
    }

    fn recompute_boundaries(&mut self) {
        self.lowest_above = f64::INFINITY;
        self.highest_below = f64::NEG_INFINITY;
        for alert in self.alerts.values() {
            match alert.direction {
                Direction::Above => self.lowest_above = self.lowest_above.min(alert.price),
                Direction::Below => self.highest_below = self.highest_below.max(alert.price),
            }
        }
        self.dirty = false;
    }

    fn crossed(&self, close: f64) -> bool {
        close >= self.lowest_above || close <= self.highest_below
    }
}

impl PriceShard {
    fn new(security_id: i64) -> Self {
        Self {
            security_id,
            inner: RwLock::new(ShardInner::new()),
        }
    }

    pub fn security_id(&self) -> i64 {
        self.security_id
    }

    /// Insert an alert, tightening the matching boundary in O(1).
    pub async fn insert(&self, alert: PriceAlert) {
        let mut inner = self.inner.write().await;
        match alert.direction {
            Direction::Above => inner.lowest_above = inner.lowest_above.min(alert.price),
            Direction::Below => inner.highest_below = inner.highest_below.max(alert.price),
        }
        inner.alerts.insert(alert.alert_id, alert);
    }

    /// Remove an alert. If the alert held a boundary the shard turns dirty;
    /// recomputation is deferred to the next evaluation pass.
    pub async fn remove(&self, alert_id: i64) -> Option<PriceAlert> {
        let mut inner = self.inner.write().await;
        let removed = inner.alerts.remove(&alert_id)?;
        let held_boundary = match removed.direction {
            Direction::Above => removed.price <= inner.lowest_above,
            Direction::Below => removed.price >= inner.highest_below,
        };
        if held_boundary {
            inner.dirty = true;
        }
        Some(removed)
    }

    /// Evaluate the shard against the latest close. Fired alerts are removed
    /// and the boundaries recomputed in the same critical section.
    ///
    /// A close that crosses both boundaries fires both groups.
    pub async fn evaluate(&self, close: f64) -> Vec<PriceAlert> {
        {
            let inner = self.inner.read().await;
            if inner.alerts.is_empty() || (!inner.dirty && !inner.crossed(close)) {
                return Vec::new();
            }
        }

        let mut inner = self.inner.write().await;
        if inner.dirty {
            inner.recompute_boundaries();
        }
        if !inner.crossed(close) {
            return Vec::new();
        }

        let fired_ids: Vec<i64> = inner
            .alerts
            .values()
            .filter(|alert| match alert.direction {
                Direction::Above => close >= alert.price,
                Direction::Below => close <= alert.price,
            })
            .map(|alert| alert.alert_id)
            .collect();

        let mut fired = Vec::with_capacity(fired_ids.len());
        for alert_id in fired_ids {
            if let Some(alert) = inner.alerts.remove(&alert_id) {
                fired.push(alert);
            }
        }
        if !fired.is_empty() {
            inner.recompute_boundaries();
        }
        fired
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.alerts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.alerts.is_empty()
    }

    /// Current `(lowest_above, highest_below)` pair.
    pub async fn boundaries(&self) -> (f64, f64) {
        let inner = self.inner.read().await;
        (inner.lowest_above, inner.highest_below)
    }

    /// Force a boundary recompute if the shard is dirty (test hook and
    /// consistency check; evaluation does this on its own).
    pub async fn settle(&self) {
        let mut inner = self.inner.write().await;
        if inner.dirty {
            inner.recompute_boundaries();
        }
    }
}

/// Registry of price-alert shards keyed by security, with a reverse index for
/// removal by alert id. Shards persist for the process lifetime.
#[derive(Default)]
pub struct PriceAlertBook {
    shards: DashMap<i64, Arc<PriceShard>>,
    security_by_alert: DashMap<i64, i64>,
}

impl PriceAlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an alert, creating the security's shard on first use.
    pub async fn insert(&self, alert: PriceAlert) {
        let shard = self
            .shards
            .entry(alert.security_id)
            .or_insert_with(|| Arc::new(PriceShard::new(alert.security_id)))
            .clone();
        self.security_by_alert
            .insert(alert.alert_id, alert.security_id);
        shard.insert(alert).await;
    }

    /// Remove an alert via the reverse index.
    pub async fn remove(&self, alert_id: i64) -> Option<PriceAlert> {
        let (_, security_id) = self.security_by_alert.remove(&alert_id)?;
        let shard = self.shards.get(&security_id)?.clone();
        shard.remove(alert_id).await
    }

    /// Drop the reverse-index entry of an alert that fired.
    pub fn forget(&self, alert_id: i64) {
        self.security_by_alert.remove(&alert_id);
    }

    pub fn shard(&self, security_id: i64) -> Option<Arc<PriceShard>> {
        self.shards.get(&security_id).map(|entry| entry.clone())
    }

    pub fn security_ids(&self) -> Vec<i64> {
        self.shards.iter().map(|entry| *entry.key()).collect()
    }

    pub async fn total_alerts(&self) -> usize {
        let mut total = 0;
        for entry in self.shards.iter() {
            total += entry.value().len().await;
        }
        total
    }

    pub fn clear(&self) {
        self.shards.clear();
        self.security_by_alert.clear();
    }
}

/// Runs one price-evaluation pass per tick of the price loop.
pub struct PriceEvaluator {
    book: Arc<PriceAlertBook>,
    prices: Arc<dyn ClosePriceSource>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<EngineMetrics>,
}

impl PriceEvaluator {
    pub fn new(
        book: Arc<PriceAlertBook>,
        prices: Arc<dyn ClosePriceSource>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            book,
            prices,
            dispatcher,
            metrics,
        }
    }

    /// Evaluate every shard against its latest close. Shards run
    /// concurrently; each shard's fires are dispatched before the pass joins.
    pub async fn run_once(&self) {
        let evaluations = self.book.security_ids().into_iter().filter_map(|security_id| {
            let shard = self.book.shard(security_id)?;
            let close = self.prices.latest_close(security_id)?;
            Some(self.evaluate_shard(shard, close))
        });
        futures::future::join_all(evaluations).await;
        self.metrics.inc_price_passes();
    }

    async fn evaluate_shard(&self, shard: Arc<PriceShard>, close: f64) {
        let fired = shard.evaluate(close).await;
        for alert in fired {
            debug!(
                "price alert {} fired: {} {} {} at close {}",
                alert.alert_id, alert.ticker, alert.direction, alert.price, close
            );
            self.book.forget(alert.alert_id);
            self.metrics.inc_price_alerts_fired();
            self.dispatcher
                .dispatch(FiredAlert::Price { alert, close })
                .await;
        }
    }
}
