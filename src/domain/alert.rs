use crate::domain::timeframe::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Direction a price alert watches for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Fire when the close rises to or past the alert price
    Above,
    /// Fire when the close falls to or past the alert price
    Below,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Above => "above",
            Direction::Below => "below",
        }
    }
}

impl TryFrom<&str> for Direction {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "above" => Ok(Direction::Above),
            "below" => Ok(Direction::Below),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user's one-shot request to be notified when a security crosses a price.
///
/// The ticker is resolved from the securities catalog at registration time and
/// stays fixed until the alert fires or is removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAlert {
    pub alert_id: i64,
    pub user_id: i64,
    pub security_id: i64,
    pub ticker: String,
    pub price: f64,
    pub direction: Direction,
}

/// Registration request for a price alert, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewPriceAlert {
    pub user_id: i64,
    pub security_id: i64,
    pub price: f64,
    pub direction: Direction,
}

/// The set of tickers a strategy is allowed to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Universe {
    /// Sentinel: the strategy runs against the whole market
    All,
    Explicit(HashSet<String>),
}

impl Universe {
    pub fn is_all(&self) -> bool {
        matches!(self, Universe::All)
    }

    /// Build from the persisted columns. `alert_universe` holds the
    /// user-selected set (or the literal sentinel "all"); `alert_universe_full`
    /// holds worker-discovered symbols for strategies created with the
    /// sentinel.
    pub fn from_columns(universe: &[String], discovered: &[String]) -> Self {
        let explicit: HashSet<String> = universe
            .iter()
            .filter(|t| !t.eq_ignore_ascii_case("all"))
            .cloned()
            .collect();
        if !explicit.is_empty() {
            return Universe::Explicit(explicit);
        }
        if !discovered.is_empty() {
            return Universe::Explicit(discovered.iter().cloned().collect());
        }
        Universe::All
    }
}

/// An active strategy subscription, resident while `alertActive` is true.
#[derive(Debug, Clone)]
pub struct StrategyAlert {
    pub strategy_id: i64,
    pub user_id: i64,
    pub name: String,
    pub threshold: f64,
    pub universe: Universe,
    pub min_timeframe: Option<Timeframe>,
    /// Time of the last dispatched notification; `None` when never fired
    pub last_trigger: Option<DateTime<Utc>>,
}

/// Discriminant shared by the alert log and the push payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Price,
    Strategy,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Price => "price",
            AlertKind::Strategy => "strategy",
        }
    }
}

/// Append-only record of a dispatched alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertLogEntry {
    pub user_id: i64,
    pub kind: AlertKind,
    pub related_id: i64,
    pub ticker: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub payload: serde_json::Value,
}

/// Payload broadcast on the per-user push channel.
#[derive(Debug, Clone, Serialize)]
pub struct UserAlert {
    pub user_id: i64,
    pub alert_id: i64,
    pub timestamp_ms: i64,
    pub message: String,
    pub channel: &'static str,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub tickers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_id: Option<i64>,
}

impl UserAlert {
    pub fn new(user_id: i64, alert_id: i64, kind: AlertKind, message: String) -> Self {
        Self {
            user_id,
            alert_id,
            timestamp_ms: Utc::now().timestamp_millis(),
            message,
            channel: "alert",
            kind,
            tickers: Vec::new(),
            security_id: None,
        }
    }

    pub fn with_tickers(mut self, tickers: Vec<String>) -> Self {
        self.tickers = tickers;
        self
    }

    pub fn with_security(mut self, security_id: i64) -> Self {
        self.security_id = Some(security_id);
        self
    }
}

/// A fired alert handed to the dispatcher. Price and strategy loops share no
/// evaluation type but share this dispatch contract.
#[derive(Debug, Clone)]
pub enum FiredAlert {
    Price {
        alert: PriceAlert,
        close: f64,
    },
    Strategy {
        strategy: StrategyAlert,
        matched: Vec<String>,
    },
}
