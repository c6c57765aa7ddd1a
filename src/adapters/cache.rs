//! Shared-cache client for ticker updates, strategy universes and
//! per-(strategy, ticker) last-trigger buckets.
//!
//! Key layout (owners in parentheses):
//!   ticker_updates              hash ticker -> last tick ms   (tick pipeline)
//!   strategy_universe:<id>      set of tickers                (engine)
//!   strategy_last_buckets:<id>  hash ticker -> bucket ms      (engine)

use crate::error::{AlertError, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const TICKER_UPDATES_KEY: &str = "ticker_updates";

fn universe_key(strategy_id: i64) -> String {
    format!("strategy_universe:{strategy_id}")
}

fn last_buckets_key(strategy_id: i64) -> String {
    format!("strategy_last_buckets:{strategy_id}")
}

/// Server-side intersection of recently-updated tickers with a strategy's
/// universe. One call instead of shipping a large universe to the client.
const INTERSECT_SCRIPT: &str = r#"
local updates = redis.call('HGETALL', KEYS[1])
local result = {}
for i = 1, #updates, 2 do
    if tonumber(updates[i + 1]) >= tonumber(ARGV[1])
        and redis.call('SISMEMBER', KEYS[2], updates[i]) == 1 then
        result[#result + 1] = updates[i]
    end
end
return result
"#;

/// Snapshot of the index counters, read by the metrics loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexCounters {
    pub ticker_reads: u64,
    pub universe_reads: u64,
    pub last_bucket_reads: u64,
    pub lua_intersections: u64,
    pub cleanup_removed: u64,
}

#[derive(Default)]
struct CounterCells {
    ticker_reads: AtomicU64,
    universe_reads: AtomicU64,
    last_bucket_reads: AtomicU64,
    lua_intersections: AtomicU64,
    cleanup_removed: AtomicU64,
}

impl CounterCells {
    fn snapshot(&self) -> IndexCounters {
        IndexCounters {
            ticker_reads: self.ticker_reads.load(Ordering::Relaxed),
            universe_reads: self.universe_reads.load(Ordering::Relaxed),
            last_bucket_reads: self.last_bucket_reads.load(Ordering::Relaxed),
            lua_intersections: self.lua_intersections.load(Ordering::Relaxed),
            cleanup_removed: self.cleanup_removed.load(Ordering::Relaxed),
        }
    }
}

/// Cache-backed index of ticker updates and per-strategy throttle state.
#[async_trait]
pub trait TickerIndex: Send + Sync {
    /// Tickers whose last tick is at or after `since_ms`.
    async fn get_tickers_updated_since(&self, since_ms: i64) -> Result<HashSet<String>>;

    async fn get_strategy_universe(&self, strategy_id: i64) -> Result<HashSet<String>>;

    /// Overwrite the strategy's universe set.
    async fn set_strategy_universe(
        &self,
        strategy_id: i64,
        tickers: &HashSet<String>,
    ) -> Result<()>;

    /// Last fired bucket per ticker; absent tickers are omitted.
    async fn get_strategy_last_buckets(
        &self,
        strategy_id: i64,
        tickers: &[String],
    ) -> Result<HashMap<String, i64>>;

    async fn set_strategy_last_buckets(
        &self,
        strategy_id: i64,
        buckets: &HashMap<String, i64>,
    ) -> Result<()>;

    /// Best-effort server-side `updated ∩ universe`; callers fall back to the
    /// client-side intersection on error.
    async fn intersect_tickers_server_side(
        &self,
        strategy_id: i64,
        since_ms: i64,
    ) -> Result<HashSet<String>>;

    /// Drop ticker-update entries older than `max_age_days`. Returns the
    /// number removed.
    async fn cleanup_ticker_updates(&self, max_age_days: u32) -> Result<u64>;

    fn counters(&self) -> IndexCounters;
}

/// Redis-backed index used in production.
#[derive(Clone)]
pub struct RedisTickerIndex {
    conn: ConnectionManager,
    intersect: Script,
    counters: Arc<CounterCells>,
}

impl RedisTickerIndex {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            intersect: Script::new(INTERSECT_SCRIPT),
            counters: Arc::new(CounterCells::default()),
        }
    }
}

#[async_trait]
impl TickerIndex for RedisTickerIndex {
    async fn get_tickers_updated_since(&self, since_ms: i64) -> Result<HashSet<String>> {
        self.counters.ticker_reads.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn.clone();
        let updates: HashMap<String, i64> = conn.hgetall(TICKER_UPDATES_KEY).await?;
        Ok(updates
            .into_iter()
            .filter(|(_, ts)| *ts >= since_ms)
            .map(|(ticker, _)| ticker)
            .collect())
    }

    async fn get_strategy_universe(&self, strategy_id: i64) -> Result<HashSet<String>> {
        self.counters.universe_reads.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(universe_key(strategy_id)).await?;
        Ok(members.into_iter().collect())
    }

    async fn set_strategy_universe(
        &self,
        strategy_id: i64,
        tickers: &HashSet<String>,
    ) -> Result<()> {
        let key = universe_key(strategy_id);
        let mut conn = self.conn.clone();
        let members: Vec<&String> = tickers.iter().collect();
        if members.is_empty() {
            let _: () = conn.del(&key).await?;
            return Ok(());
        }
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .sadd(&key, members)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_strategy_last_buckets(
        &self,
        strategy_id: i64,
        tickers: &[String],
    ) -> Result<HashMap<String, i64>> {
        self.counters
            .last_bucket_reads
            .fetch_add(1, Ordering::Relaxed);
        if tickers.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<i64>> = redis::cmd("HMGET")
            .arg(last_buckets_key(strategy_id))
            .arg(tickers)
            .query_async(&mut conn)
            .await?;
        Ok(tickers
            .iter()
            .zip(values)
            .filter_map(|(ticker, bucket)| bucket.map(|b| (ticker.clone(), b)))
            .collect())
    }

    async fn set_strategy_last_buckets(
        &self,
        strategy_id: i64,
        buckets: &HashMap<String, i64>,
    ) -> Result<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let items: Vec<(&String, i64)> = buckets.iter().map(|(t, b)| (t, *b)).collect();
        let _: () = conn
            .hset_multiple(last_buckets_key(strategy_id), &items)
            .await?;
        Ok(())
    }

    async fn intersect_tickers_server_side(
        &self,
        strategy_id: i64,
        since_ms: i64,
    ) -> Result<HashSet<String>> {
        self.counters
            .lua_intersections
            .fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn.clone();
        let tickers: Vec<String> = self
            .intersect
            .key(TICKER_UPDATES_KEY)
            .key(universe_key(strategy_id))
            .arg(since_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(tickers.into_iter().collect())
    }

    async fn cleanup_ticker_updates(&self, max_age_days: u32) -> Result<u64> {
        let cutoff_ms =
            Utc::now().timestamp_millis() - i64::from(max_age_days) * 24 * 3600 * 1000;
        let mut conn = self.conn.clone();
        let updates: HashMap<String, i64> = conn.hgetall(TICKER_UPDATES_KEY).await?;
        let stale: Vec<String> = updates
            .into_iter()
            .filter(|(_, ts)| *ts < cutoff_ms)
            .map(|(ticker, _)| ticker)
            .collect();

        let mut removed = 0u64;
        for chunk in stale.chunks(500) {
            let deleted: u64 = redis::cmd("HDEL")
                .arg(TICKER_UPDATES_KEY)
                .arg(chunk)
                .query_async(&mut conn)
                .await?;
            removed += deleted;
        }
        self.counters
            .cleanup_removed
            .fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    fn counters(&self) -> IndexCounters {
        self.counters.snapshot()
    }
}

/// In-memory TickerIndex used for testing.
#[derive(Default)]
pub struct InMemoryTickerIndex {
    inner: Mutex<IndexState>,
    counters: CounterCells,
    fail_server_side: AtomicBool,
}

#[derive(Default)]
struct IndexState {
    ticker_updates: HashMap<String, i64>,
    universes: HashMap<i64, HashSet<String>>,
    last_buckets: HashMap<i64, HashMap<String, i64>>,
}

impl InMemoryTickerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer side of the tick pipeline, for tests.
    pub fn record_ticker_update(&self, ticker: &str, at_ms: i64) {
        self.inner
            .lock()
            .unwrap()
            .ticker_updates
            .insert(ticker.to_string(), at_ms);
    }

    /// Force `intersect_tickers_server_side` to fail, for fallback tests.
    pub fn set_fail_server_side(&self, fail: bool) {
        self.fail_server_side.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TickerIndex for InMemoryTickerIndex {
    async fn get_tickers_updated_since(&self, since_ms: i64) -> Result<HashSet<String>> {
        self.counters.ticker_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .inner
            .lock()
            .unwrap()
            .ticker_updates
            .iter()
            .filter(|(_, ts)| **ts >= since_ms)
            .map(|(ticker, _)| ticker.clone())
            .collect())
    }

    async fn get_strategy_universe(&self, strategy_id: i64) -> Result<HashSet<String>> {
        self.counters.universe_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .inner
            .lock()
            .unwrap()
            .universes
            .get(&strategy_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_strategy_universe(
        &self,
        strategy_id: i64,
        tickers: &HashSet<String>,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .universes
            .insert(strategy_id, tickers.clone());
        Ok(())
    }

    async fn get_strategy_last_buckets(
        &self,
        strategy_id: i64,
        tickers: &[String],
    ) -> Result<HashMap<String, i64>> {
        self.counters
            .last_bucket_reads
            .fetch_add(1, Ordering::Relaxed);
        let state = self.inner.lock().unwrap();
        let Some(buckets) = state.last_buckets.get(&strategy_id) else {
            return Ok(HashMap::new());
        };
        Ok(tickers
            .iter()
            .filter_map(|t| buckets.get(t).map(|b| (t.clone(), *b)))
            .collect())
    }

    async fn set_strategy_last_buckets(
        &self,
        strategy_id: i64,
        buckets: &HashMap<String, i64>,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .last_buckets
            .entry(strategy_id)
            .or_default()
            .extend(buckets.iter().map(|(t, b)| (t.clone(), *b)));
        Ok(())
    }

    async fn intersect_tickers_server_side(
        &self,
        strategy_id: i64,
        since_ms: i64,
    ) -> Result<HashSet<String>> {
        if self.fail_server_side.load(Ordering::SeqCst) {
            return Err(AlertError::Cache("scripting disabled".to_string()));
        }
        self.counters
            .lua_intersections
            .fetch_add(1, Ordering::Relaxed);
        let state = self.inner.lock().unwrap();
        let Some(universe) = state.universes.get(&strategy_id) else {
            return Ok(HashSet::new());
        };
        Ok(state
            .ticker_updates
            .iter()
            .filter(|(ticker, ts)| **ts >= since_ms && universe.contains(*ticker))
            .map(|(ticker, _)| ticker.clone())
            .collect())
    }

    async fn cleanup_ticker_updates(&self, max_age_days: u32) -> Result<u64> {
        let cutoff_ms =
            Utc::now().timestamp_millis() - i64::from(max_age_days) * 24 * 3600 * 1000;
        let mut state = self.inner.lock().unwrap();
        let before = state.ticker_updates.len();
        state.ticker_updates.retain(|_, ts| *ts >= cutoff_ms);
        let removed = (before - state.ticker_updates.len()) as u64;
        self.counters
            .cleanup_removed
            .fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    fn counters(&self) -> IndexCounters {
        self.counters.snapshot()
    }
}
