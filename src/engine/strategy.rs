//! Strategy-alert evaluation: bucket alignment, universe intersection,
//! per-(strategy, ticker) duplicate suppression, and task submission.
//!
//! Every pass runs all active strategies concurrently. A strategy only
//! reaches the worker pool when something in its universe ticked inside the
//! current bucket and has not already fired in that bucket.

use crate::adapters::{AlertStore, QueueClient, TickerIndex};
use crate::domain::{
    AlertTaskArgs, AlertTaskResult, FiredAlert, StrategyAlert, TaskKind, Universe,
};
use crate::engine::dispatch::Dispatcher;
use crate::engine::metrics::EngineMetrics;
use crate::error::{AlertError, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Why a strategy was skipped this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No valid timeframe, empty universe, or nothing ticked in the bucket
    NoUpdate,
    /// Everything that ticked already fired in the current bucket
    BucketDup,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoUpdate => "no-update",
            SkipReason::BucketDup => "bucket-dup",
        }
    }
}

/// Outcome of one strategy iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    Skipped(SkipReason),
    Submitted {
        dispatched: bool,
        /// Tickers the submission covered; empty for sentinel-universe runs
        evaluated: Vec<String>,
    },
}

/// Registry of resident strategy alerts.
#[derive(Default)]
pub struct StrategyRegistry {
    inner: RwLock<HashMap<i64, StrategyAlert>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous entry if any.
    pub async fn insert(&self, strategy: StrategyAlert) -> Option<StrategyAlert> {
        self.inner
            .write()
            .await
            .insert(strategy.strategy_id, strategy)
    }

    pub async fn remove(&self, strategy_id: i64) -> Option<StrategyAlert> {
        self.inner.write().await.remove(&strategy_id)
    }

    pub async fn get(&self, strategy_id: i64) -> Option<StrategyAlert> {
        self.inner.read().await.get(&strategy_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<StrategyAlert> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    pub async fn set_last_trigger(&self, strategy_id: i64, at: DateTime<Utc>) {
        if let Some(strategy) = self.inner.write().await.get_mut(&strategy_id) {
            strategy.last_trigger = Some(at);
        }
    }

    /// Universe discovery: replace the strategy's universe with the symbols
    /// the worker actually referenced.
    pub async fn set_universe(&self, strategy_id: i64, tickers: HashSet<String>) {
        if let Some(strategy) = self.inner.write().await.get_mut(&strategy_id) {
            strategy.universe = Universe::Explicit(tickers);
        }
    }
}

/// Per-pass strategy evaluator.
pub struct StrategyProcessor {
    registry: Arc<StrategyRegistry>,
    index: Arc<dyn TickerIndex>,
    queue: Arc<QueueClient>,
    store: Arc<dyn AlertStore>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<EngineMetrics>,
    task_timeout: Duration,
    lua_threshold: usize,
    per_ticker_throttle: bool,
}

impl StrategyProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<StrategyRegistry>,
        index: Arc<dyn TickerIndex>,
        queue: Arc<QueueClient>,
        store: Arc<dyn AlertStore>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<EngineMetrics>,
        task_timeout: Duration,
        lua_threshold: usize,
        per_ticker_throttle: bool,
    ) -> Self {
        Self {
            registry,
            index,
            queue,
            store,
            dispatcher,
            metrics,
            task_timeout,
            lua_threshold,
            per_ticker_throttle,
        }
    }

    /// Evaluate all resident strategies concurrently. Iteration errors are
    /// logged and counted; one failing strategy never halts the others.
    pub async fn run_once(&self, now: DateTime<Utc>) {
        let strategies = self.registry.snapshot().await;
        let evaluations = strategies.into_iter().map(|strategy| async move {
            let strategy_id = strategy.strategy_id;
            match self.evaluate_strategy(strategy, now).await {
                Ok(StrategyOutcome::Skipped(reason)) => {
                    debug!("strategy {strategy_id} skipped: {}", reason.as_str());
                    match reason {
                        SkipReason::NoUpdate => self.metrics.inc_skips_no_update(),
                        SkipReason::BucketDup => self.metrics.inc_skips_bucket_dup(),
                    }
                }
                Ok(StrategyOutcome::Submitted { dispatched, .. }) => {
                    debug!("strategy {strategy_id} evaluated (dispatched: {dispatched})");
                }
                Err(e) => {
                    warn!("strategy {strategy_id} evaluation failed: {e}");
                    self.metrics.inc_strategy_failures();
                }
            }
        });
        futures::future::join_all(evaluations).await;
        self.metrics.inc_strategy_passes();
    }

    /// One strategy through the throttling pipeline.
    pub async fn evaluate_strategy(
        &self,
        strategy: StrategyAlert,
        now: DateTime<Utc>,
    ) -> Result<StrategyOutcome> {
        let Some(timeframe) = strategy.min_timeframe else {
            return Ok(StrategyOutcome::Skipped(SkipReason::NoUpdate));
        };
        let curr_bucket = timeframe.bucket_start(now);
        let curr_bucket_ms = curr_bucket.timestamp_millis();

        // Sentinel universes (and everything, when the per-ticker throttle is
        // off) use the coarse last-trigger check.
        if strategy.universe.is_all() || !self.per_ticker_throttle {
            if let Some(last_trigger) = strategy.last_trigger {
                if timeframe.bucket_start(last_trigger) == curr_bucket {
                    return Ok(StrategyOutcome::Skipped(SkipReason::BucketDup));
                }
            }
            let result = self.submit(&strategy, None).await?;
            let dispatched = self
                .apply_result(&strategy, result, &[], curr_bucket_ms, now)
                .await?;
            return Ok(StrategyOutcome::Submitted {
                dispatched,
                evaluated: Vec::new(),
            });
        }

        let updated = self.index.get_tickers_updated_since(curr_bucket_ms).await?;
        let universe = self.index.get_strategy_universe(strategy.strategy_id).await?;
        if universe.is_empty() {
            return Ok(StrategyOutcome::Skipped(SkipReason::NoUpdate));
        }

        let changed = self
            .intersect(&strategy, &updated, &universe, curr_bucket_ms)
            .await;
        if changed.is_empty() {
            return Ok(StrategyOutcome::Skipped(SkipReason::NoUpdate));
        }

        let last_buckets = self
            .index
            .get_strategy_last_buckets(strategy.strategy_id, &changed)
            .await?;
        let survivors: Vec<String> = changed
            .into_iter()
            .filter(|ticker| last_buckets.get(ticker).copied() != Some(curr_bucket_ms))
            .collect();
        if survivors.is_empty() {
            return Ok(StrategyOutcome::Skipped(SkipReason::BucketDup));
        }

        let result = self.submit(&strategy, Some(survivors.clone())).await?;
        let dispatched = self
            .apply_result(&strategy, result, &survivors, curr_bucket_ms, now)
            .await?;
        Ok(StrategyOutcome::Submitted {
            dispatched,
            evaluated: survivors,
        })
    }

    /// `updated ∩ universe`, server-side for large universes with a
    /// client-side fallback that is observationally identical.
    async fn intersect(
        &self,
        strategy: &StrategyAlert,
        updated: &HashSet<String>,
        universe: &HashSet<String>,
        since_ms: i64,
    ) -> Vec<String> {
        if universe.len() > self.lua_threshold {
            match self
                .index
                .intersect_tickers_server_side(strategy.strategy_id, since_ms)
                .await
            {
                Ok(tickers) => {
                    let mut tickers: Vec<String> = tickers.into_iter().collect();
                    tickers.sort();
                    return tickers;
                }
                Err(e) => {
                    self.metrics.inc_lua_fallbacks();
                    warn!(
                        "server-side intersection failed for strategy {}, using client side: {e}",
                        strategy.strategy_id
                    );
                }
            }
        }
        let mut tickers: Vec<String> = updated.intersection(universe).cloned().collect();
        tickers.sort();
        tickers
    }

    async fn submit(
        &self,
        strategy: &StrategyAlert,
        symbols: Option<Vec<String>>,
    ) -> Result<AlertTaskResult> {
        let args = serde_json::to_value(AlertTaskArgs {
            strategy_id: strategy.strategy_id,
            user_id: strategy.user_id,
            symbols,
        })?;
        self.metrics.inc_tasks_submitted();
        self.queue
            .submit_and_await::<AlertTaskResult>(
                TaskKind::Alert,
                strategy.strategy_id,
                args,
                self.task_timeout,
                None,
            )
            .await
    }

    /// Apply a successful worker result: universe discovery, dispatch when
    /// instances matched, and last-bucket bookkeeping for every evaluated
    /// ticker.
    async fn apply_result(
        &self,
        strategy: &StrategyAlert,
        result: AlertTaskResult,
        evaluated: &[String],
        curr_bucket_ms: i64,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        if !result.success {
            let message = result
                .error
                .map(|e| format!("{}: {}", e.kind, e.message))
                .unwrap_or_else(|| "worker reported failure".to_string());
            return Err(AlertError::Worker { message });
        }

        if let Some(used_symbols) = &result.used_symbols {
            if !used_symbols.is_empty() {
                self.discover_universe(strategy.strategy_id, used_symbols.clone())
                    .await;
            }
        }

        let mut dispatched = false;
        if !result.instances.is_empty() {
            let mut matched: Vec<String> = Vec::new();
            for instance in &result.instances {
                if !matched.contains(&instance.symbol) {
                    matched.push(instance.symbol.clone());
                }
            }
            self.dispatcher
                .dispatch(FiredAlert::Strategy {
                    strategy: strategy.clone(),
                    matched,
                })
                .await;
            self.registry
                .set_last_trigger(strategy.strategy_id, fired_at)
                .await;
            self.metrics.inc_strategy_alerts_fired();
            dispatched = true;
        }

        if !evaluated.is_empty() {
            let buckets: HashMap<String, i64> = evaluated
                .iter()
                .map(|ticker| (ticker.clone(), curr_bucket_ms))
                .collect();
            if let Err(e) = self
                .index
                .set_strategy_last_buckets(strategy.strategy_id, &buckets)
                .await
            {
                warn!(
                    "failed to record last buckets for strategy {}: {e}",
                    strategy.strategy_id
                );
            }
        }

        Ok(dispatched)
    }

    /// The worker told us which symbols the strategy really uses: overwrite
    /// the cache universe, update the resident copy, and persist the refined
    /// set without blocking the pass.
    async fn discover_universe(&self, strategy_id: i64, used_symbols: Vec<String>) {
        info!(
            "strategy {strategy_id} universe discovered: {} symbols",
            used_symbols.len()
        );
        let set: HashSet<String> = used_symbols.iter().cloned().collect();
        if let Err(e) = self.index.set_strategy_universe(strategy_id, &set).await {
            warn!("failed to cache discovered universe for {strategy_id}: {e}");
        }
        self.registry.set_universe(strategy_id, set).await;

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_strategy_universe(strategy_id, &used_symbols).await {
                warn!("failed to persist discovered universe for {strategy_id}: {e}");
            }
        });
    }
}
