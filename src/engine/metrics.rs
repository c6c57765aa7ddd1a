use crate::adapters::IndexCounters;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Metrics collector for observability
#[derive(Default)]
pub struct EngineMetrics {
    /// Price evaluation passes completed
    pub price_passes: AtomicU64,
    /// Price alerts dispatched
    pub price_alerts_fired: AtomicU64,
    /// Strategy evaluation passes completed
    pub strategy_passes: AtomicU64,
    /// Strategy tasks submitted to the worker pool
    pub tasks_submitted: AtomicU64,
    /// Strategy alerts dispatched
    pub strategy_alerts_fired: AtomicU64,
    /// Strategy iterations skipped: nothing new in the current bucket
    pub skips_no_update: AtomicU64,
    /// Strategy iterations skipped: already fired in the current bucket
    pub skips_bucket_dup: AtomicU64,
    /// Server-side intersection failures that fell back to the client path
    pub lua_fallbacks: AtomicU64,
    /// Per-strategy iteration failures (worker errors, timeouts, cache)
    pub strategy_failures: AtomicU64,
    /// Notification sink failures
    pub notifier_failures: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_price_passes(&self) {
        self.price_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_price_alerts_fired(&self) {
        self.price_alerts_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_strategy_passes(&self) {
        self.strategy_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_strategy_alerts_fired(&self) {
        self.strategy_alerts_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skips_no_update(&self) {
        self.skips_no_update.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skips_bucket_dup(&self) {
        self.skips_bucket_dup.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lua_fallbacks(&self) {
        self.lua_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_strategy_failures(&self) {
        self.strategy_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifier_failures(&self) {
        self.notifier_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics as a formatted string
    pub fn summary(&self, index: IndexCounters) -> String {
        format!(
            r#"
=== ALERT ENGINE STATUS ===
Price: passes {} | fired {}
Strategy: passes {} | submitted {} | fired {} | failures {}
Skips: no-update {} | bucket-dup {}
Cache: ticker reads {} | universe reads {} | bucket reads {} | lua {} (fallbacks {}) | cleaned {}
Notifier failures: {}
===========================
"#,
            self.price_passes.load(Ordering::Relaxed),
            self.price_alerts_fired.load(Ordering::Relaxed),
            self.strategy_passes.load(Ordering::Relaxed),
            self.tasks_submitted.load(Ordering::Relaxed),
            self.strategy_alerts_fired.load(Ordering::Relaxed),
            self.strategy_failures.load(Ordering::Relaxed),
            self.skips_no_update.load(Ordering::Relaxed),
            self.skips_bucket_dup.load(Ordering::Relaxed),
            index.ticker_reads,
            index.universe_reads,
            index.last_bucket_reads,
            index.lua_intersections,
            self.lua_fallbacks.load(Ordering::Relaxed),
            index.cleanup_removed,
            self.notifier_failures.load(Ordering::Relaxed),
        )
    }

    /// Log periodic status
    pub fn log_status(&self, index: IndexCounters) {
        info!("{}", self.summary(index));
    }
}
