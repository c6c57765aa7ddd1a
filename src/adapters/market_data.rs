//! Read-only view of the tick pipeline's per-security aggregates.
//!
//! The tick pipeline owns the OHLCV ring; the alert engine only reads the
//! latest second-bar close through this seam.

use dashmap::DashMap;
use std::sync::Arc;

/// Source of the most recent second-level close per security.
pub trait ClosePriceSource: Send + Sync {
    /// Latest close, or `None` when no tick has arrived for the security yet.
    /// Must not block against the tick writer.
    fn latest_close(&self, security_id: i64) -> Option<f64>;
}

/// Shared close cache the tick pipeline writes and the engine reads.
#[derive(Default)]
pub struct SharedCloseCache {
    closes: DashMap<i64, f64>,
}

impl SharedCloseCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Writer side, called by the tick pipeline on each second bar.
    pub fn set_close(&self, security_id: i64, close: f64) {
        self.closes.insert(security_id, close);
    }
}

impl ClosePriceSource for SharedCloseCache {
    fn latest_close(&self, security_id: i64) -> Option<f64> {
        self.closes.get(&security_id).map(|entry| *entry.value())
    }
}
