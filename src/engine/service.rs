//! Alert engine lifecycle: dependency wiring, initial load, and supervision
//! of the four long-running workers (price loop, strategy loop, metrics loop,
//! daily cleanup loop).

use crate::adapters::{
    escalate_critical, AlertStore, ClosePriceSource, Notifier, PushHub, QueueClient,
    QueueTransport, TickerIndex, UserLimits,
};
use crate::config::EngineConfig;
use crate::domain::{NewPriceAlert, PriceAlert, StrategyAlert, Universe};
use crate::engine::dispatch::Dispatcher;
use crate::engine::metrics::EngineMetrics;
use crate::engine::price::{PriceAlertBook, PriceEvaluator};
use crate::engine::strategy::{StrategyProcessor, StrategyRegistry};
use crate::error::{AlertError, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// External collaborators the engine is wired with at start.
pub struct AlertServiceDeps {
    pub store: Arc<dyn AlertStore>,
    pub index: Arc<dyn TickerIndex>,
    pub queue_transport: Arc<dyn QueueTransport>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub push: Arc<PushHub>,
    pub limits: Arc<dyn UserLimits>,
    pub prices: Arc<dyn ClosePriceSource>,
}

/// Single-instance supervisor with idempotent start/stop.
pub struct AlertService {
    deps: AlertServiceDeps,
    config: EngineConfig,
    environment: String,
    book: Arc<PriceAlertBook>,
    registry: Arc<StrategyRegistry>,
    metrics: Arc<EngineMetrics>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AlertService {
    pub fn new(environment: String, config: EngineConfig, deps: AlertServiceDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            config,
            environment,
            book: Arc::new(PriceAlertBook::new()),
            registry: Arc::new(StrategyRegistry::new()),
            metrics: Arc::new(EngineMetrics::new()),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            workers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_dev(&self) -> bool {
        self.environment.eq_ignore_ascii_case("dev")
            || self.environment.eq_ignore_ascii_case("development")
    }

    /// Start the engine: load active alerts, seed universes, launch workers.
    ///
    /// Idempotent; calling start on a running service is a no-op success.
    /// Partial init failure rolls everything back and leaves the service
    /// stopped.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("alert service already running");
            return Ok(());
        }

        if !self.is_dev() && self.deps.notifier.is_none() {
            let err = AlertError::Config(
                "notifier credentials are required outside dev".to_string(),
            );
            self.running.store(false, Ordering::SeqCst);
            escalate_critical(
                None,
                &self.environment,
                "AlertService::start",
                &err.to_string(),
            )
            .await;
            return Err(err);
        }

        if let Err(e) = self.initialize().await {
            // No half-started state: undo the partial load.
            self.book.clear();
            self.registry.clear().await;
            self.running.store(false, Ordering::SeqCst);
            escalate_critical(
                self.deps.notifier.as_ref(),
                &self.environment,
                "AlertService::start",
                &e.to_string(),
            )
            .await;
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Arc::new(Dispatcher::new(
            self.deps.store.clone(),
            self.deps.notifier.clone(),
            self.deps.push.clone(),
            self.deps.limits.clone(),
            self.metrics.clone(),
        ));
        let evaluator = Arc::new(PriceEvaluator::new(
            self.book.clone(),
            self.deps.prices.clone(),
            dispatcher.clone(),
            self.metrics.clone(),
        ));
        let queue = Arc::new(
            QueueClient::new(self.deps.queue_transport.clone())
                .with_shutdown(shutdown_rx.clone()),
        );
        let processor = Arc::new(StrategyProcessor::new(
            self.registry.clone(),
            self.deps.index.clone(),
            queue,
            self.deps.store.clone(),
            dispatcher,
            self.metrics.clone(),
            Duration::from_secs(self.config.task_timeout_secs),
            self.config.lua_intersect_threshold,
            self.config.per_ticker_throttle,
        ));

        let mut workers = self.workers.lock().await;
        workers.push(spawn_price_loop(
            evaluator,
            self.config.price_interval_secs,
            shutdown_rx.clone(),
        ));
        workers.push(spawn_strategy_loop(
            processor,
            self.config.strategy_interval_secs,
            shutdown_rx.clone(),
        ));
        workers.push(spawn_metrics_loop(
            self.metrics.clone(),
            self.deps.index.clone(),
            self.config.metrics_interval_secs,
            shutdown_rx.clone(),
        ));
        workers.push(spawn_cleanup_loop(
            self.deps.index.clone(),
            self.config.cleanup_initial_delay_secs,
            self.config.cleanup_interval_hours,
            self.config.ticker_update_max_age_days,
            shutdown_rx,
        ));

        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        info!(
            "alert service started ({} price alerts, {} strategies)",
            self.book.total_alerts().await,
            self.registry.len().await
        );
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let price_alerts = self
            .deps
            .store
            .load_active_price_alerts()
            .await
            .map_err(|e| AlertError::Init(format!("price alerts: {e}")))?;
        for alert in price_alerts {
            self.book.insert(alert).await;
        }

        let strategies = self
            .deps
            .store
            .load_active_strategy_alerts()
            .await
            .map_err(|e| AlertError::Init(format!("strategy alerts: {e}")))?;
        for strategy in strategies {
            if let Universe::Explicit(tickers) = &strategy.universe {
                self.deps
                    .index
                    .set_strategy_universe(strategy.strategy_id, tickers)
                    .await
                    .map_err(|e| AlertError::Init(format!("universe seed: {e}")))?;
            }
            self.registry.insert(strategy).await;
        }
        Ok(())
    }

    /// Signal all workers and wait for them. Safe to call multiple times.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                error!("worker join failed: {e}");
            }
        }
        info!("alert service stopped");
    }

    // ==================== API-facing operations ====================

    /// Register a price alert: persist, resolve the ticker, insert into the
    /// shard, bump the user's counter.
    pub async fn add_price_alert(&self, request: NewPriceAlert) -> Result<PriceAlert> {
        if !(request.price.is_finite() && request.price > 0.0) {
            return Err(AlertError::Config(format!(
                "alert price must be a positive number, got {}",
                request.price
            )));
        }

        let ticker = self.deps.store.resolve_ticker(request.security_id).await?;
        let alert_id = self.deps.store.insert_price_alert(&request).await?;
        let alert = PriceAlert {
            alert_id,
            user_id: request.user_id,
            security_id: request.security_id,
            ticker,
            price: request.price,
            direction: request.direction,
        };
        self.book.insert(alert.clone()).await;

        if let Err(e) = self
            .deps
            .limits
            .increment_active_price_alerts(request.user_id)
            .await
        {
            warn!("counter increment failed for user {}: {e}", request.user_id);
        }
        Ok(alert)
    }

    /// Remove a price alert: flip the row inactive, drop it from its shard,
    /// decrement the user's counter.
    pub async fn remove_price_alert(&self, alert_id: i64) -> Result<Option<PriceAlert>> {
        self.deps.store.deactivate_price_alert(alert_id).await?;
        let Some(alert) = self.book.remove(alert_id).await else {
            return Ok(None);
        };
        if let Err(e) = self
            .deps
            .limits
            .decrement_active_price_alerts(alert.user_id, alert_id)
            .await
        {
            warn!("counter decrement failed for alert {alert_id}: {e}");
        }
        Ok(Some(alert))
    }

    /// Add or update a strategy subscription; explicit universes are written
    /// through to the cache.
    pub async fn upsert_strategy_alert(&self, strategy: StrategyAlert) -> Result<()> {
        if let Universe::Explicit(tickers) = &strategy.universe {
            self.deps
                .index
                .set_strategy_universe(strategy.strategy_id, tickers)
                .await?;
        }
        let user_id = strategy.user_id;
        let previous = self.registry.insert(strategy).await;
        if previous.is_none() {
            if let Err(e) = self
                .deps
                .limits
                .increment_active_strategy_alerts(user_id)
                .await
            {
                warn!("counter increment failed for user {user_id}: {e}");
            }
        }
        Ok(())
    }

    pub async fn remove_strategy_alert(&self, strategy_id: i64) -> Result<Option<StrategyAlert>> {
        let Some(strategy) = self.registry.remove(strategy_id).await else {
            return Ok(None);
        };
        self.deps
            .store
            .set_strategy_alert_active(strategy_id, false)
            .await?;
        if let Err(e) = self
            .deps
            .limits
            .decrement_active_strategy_alerts(strategy.user_id, strategy_id)
            .await
        {
            warn!("counter decrement failed for strategy {strategy_id}: {e}");
        }
        Ok(Some(strategy))
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    pub fn book(&self) -> Arc<PriceAlertBook> {
        self.book.clone()
    }

    pub fn registry(&self) -> Arc<StrategyRegistry> {
        self.registry.clone()
    }
}

/// True when the stop signal has fired or the sender is gone.
fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

fn spawn_price_loop(
    evaluator: Arc<PriceEvaluator>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => evaluator.run_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || stop_requested(&shutdown) {
                        break;
                    }
                }
            }
        }
        info!("price alert loop stopped");
    })
}

fn spawn_strategy_loop(
    processor: Arc<StrategyProcessor>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => processor.run_once(Utc::now()).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || stop_requested(&shutdown) {
                        break;
                    }
                }
            }
        }
        info!("strategy alert loop stopped");
    })
}

fn spawn_metrics_loop(
    metrics: Arc<EngineMetrics>,
    index: Arc<dyn TickerIndex>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first interval tick fires immediately; skip the startup report.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => metrics.log_status(index.counters()),
                changed = shutdown.changed() => {
                    if changed.is_err() || stop_requested(&shutdown) {
                        break;
                    }
                }
            }
        }
        info!("metrics loop stopped");
    })
}

fn spawn_cleanup_loop(
    index: Arc<dyn TickerIndex>,
    initial_delay_secs: u64,
    interval_hours: u64,
    max_age_days: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(initial_delay_secs)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || stop_requested(&shutdown) {
                    info!("cleanup loop stopped before first pass");
                    return;
                }
            }
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(interval_hours * 3600));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Each pass runs to completion; stop only takes effect
                    // between passes.
                    match index.cleanup_ticker_updates(max_age_days).await {
                        Ok(removed) => info!("ticker-update cleanup removed {removed} entries"),
                        Err(e) => warn!("ticker-update cleanup failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || stop_requested(&shutdown) {
                        break;
                    }
                }
            }
        }
        info!("cleanup loop stopped");
    })
}
