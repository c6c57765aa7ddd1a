//! Notification fan-out for fired alerts.
//!
//! Ordering per fire: chat notifier (best-effort), per-user push channel,
//! alert-log persistence, then alert-state bookkeeping (deactivation and
//! counter decrement for price alerts, last-trigger persistence for strategy
//! alerts). Failures late in the chain never undo steps already taken.

use crate::adapters::{AlertStore, Notifier, PushHub, UserLimits};
use crate::domain::{AlertKind, AlertLogEntry, FiredAlert, PriceAlert, StrategyAlert, UserAlert};
use crate::engine::metrics::EngineMetrics;
use crate::error::{AlertError, Result};
use chrono::Utc;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BASE_DELAY: Duration = Duration::from_millis(200);

/// Retry a persistence operation with bounded exponential backoff.
async fn with_retries<T, F, Fut>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = PERSIST_BASE_DELAY;
    let mut last_error = None;
    for attempt in 1..=PERSIST_ATTEMPTS {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = Some(e);
                if attempt < PERSIST_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| AlertError::Internal("retries exhausted".to_string())))
}

pub struct Dispatcher {
    store: Arc<dyn AlertStore>,
    notifier: Option<Arc<dyn Notifier>>,
    push: Arc<PushHub>,
    limits: Arc<dyn UserLimits>,
    metrics: Arc<EngineMetrics>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn AlertStore>,
        notifier: Option<Arc<dyn Notifier>>,
        push: Arc<PushHub>,
        limits: Arc<dyn UserLimits>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            notifier,
            push,
            limits,
            metrics,
        }
    }

    pub async fn dispatch(&self, fired: FiredAlert) {
        match fired {
            FiredAlert::Price { alert, close } => self.dispatch_price(alert, close).await,
            FiredAlert::Strategy { strategy, matched } => {
                self.dispatch_strategy(strategy, matched).await
            }
        }
    }

    async fn dispatch_price(&self, alert: PriceAlert, close: f64) {
        let message = format!(
            "Price alert: {} crossed {} {:.2} (close {:.2})",
            alert.ticker, alert.direction, alert.price, close
        );

        self.notify(&message).await;

        self.push.send_alert_to_user(
            UserAlert::new(alert.user_id, alert.alert_id, AlertKind::Price, message.clone())
                .with_tickers(vec![alert.ticker.clone()])
                .with_security(alert.security_id),
        );

        let entry = AlertLogEntry {
            user_id: alert.user_id,
            kind: AlertKind::Price,
            related_id: alert.alert_id,
            ticker: Some(alert.ticker.clone()),
            timestamp: Utc::now(),
            message,
            payload: json!({
                "security_id": alert.security_id,
                "price": alert.price,
                "direction": alert.direction.as_str(),
                "close": close,
            }),
        };
        if let Err(e) = with_retries(|| self.store.insert_alert_log(&entry)).await {
            error!("failed to persist alert log for {}: {e}", alert.alert_id);
        }

        // One-shot: the row goes inactive once fired.
        if let Err(e) = with_retries(|| self.store.deactivate_price_alert(alert.alert_id)).await {
            error!("failed to deactivate fired alert {}: {e}", alert.alert_id);
        }

        // Counter drift is tolerated and reconcilable; never blocks dispatch.
        if let Err(e) = self
            .limits
            .decrement_active_price_alerts(alert.user_id, alert.alert_id)
            .await
        {
            warn!("counter decrement failed for alert {}: {e}", alert.alert_id);
        }
    }

    async fn dispatch_strategy(&self, strategy: StrategyAlert, matched: Vec<String>) {
        let message = format!(
            "Strategy alert: '{}' matched {}",
            strategy.name,
            matched.join(", ")
        );

        self.notify(&message).await;

        self.push.send_alert_to_user(
            UserAlert::new(
                strategy.user_id,
                strategy.strategy_id,
                AlertKind::Strategy,
                message.clone(),
            )
            .with_tickers(matched.clone()),
        );

        let now = Utc::now();
        let entry = AlertLogEntry {
            user_id: strategy.user_id,
            kind: AlertKind::Strategy,
            related_id: strategy.strategy_id,
            ticker: None,
            timestamp: now,
            message,
            payload: json!({
                "threshold": strategy.threshold,
                "matched": matched,
            }),
        };
        if let Err(e) = with_retries(|| self.store.insert_alert_log(&entry)).await {
            error!(
                "failed to persist alert log for strategy {}: {e}",
                strategy.strategy_id
            );
        }

        if let Err(e) = with_retries(|| {
            self.store
                .update_strategy_last_trigger(strategy.strategy_id, now)
        })
        .await
        {
            error!(
                "failed to persist last trigger for strategy {}: {e}",
                strategy.strategy_id
            );
        }
    }

    async fn notify(&self, message: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let channel = notifier.alert_channel().to_string();
        if let Err(e) = notifier.send_message(message, &channel).await {
            self.metrics.inc_notifier_failures();
            error!("notifier send failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::notifier::MockNotifier;
    use crate::adapters::{InMemoryAlertStore, InMemoryUserLimits};
    use crate::domain::Direction;

    fn price_alert() -> PriceAlert {
        PriceAlert {
            alert_id: 42,
            user_id: 7,
            security_id: 3,
            ticker: "AAPL".to_string(),
            price: 150.0,
            direction: Direction::Above,
        }
    }

    fn dispatcher_with(
        store: Arc<InMemoryAlertStore>,
        limits: Arc<InMemoryUserLimits>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Dispatcher {
        Dispatcher::new(
            store,
            notifier,
            Arc::new(PushHub::new()),
            limits,
            Arc::new(EngineMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_price_dispatch_persists_and_deactivates() {
        let store = Arc::new(InMemoryAlertStore::new());
        let limits = Arc::new(InMemoryUserLimits::new());
        store.seed_price_alert(price_alert());
        limits.increment_active_price_alerts(7).await.unwrap();

        let dispatcher = dispatcher_with(store.clone(), limits.clone(), None);
        dispatcher
            .dispatch(FiredAlert::Price {
                alert: price_alert(),
                close: 152.3,
            })
            .await;

        assert_eq!(store.is_alert_active(42), Some(false));
        let logs = store.logged_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, AlertKind::Price);
        assert_eq!(logs[0].related_id, 42);
        assert!(logs[0].message.contains("AAPL"));
        assert_eq!(limits.active_price_alerts(7), 0);
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_block_persistence() {
        let store = Arc::new(InMemoryAlertStore::new());
        let limits = Arc::new(InMemoryUserLimits::new());
        store.seed_price_alert(price_alert());

        let mut mock = MockNotifier::new();
        mock.expect_alert_channel().return_const("alerts".to_string());
        mock.expect_send_message()
            .times(1)
            .returning(|_, _| Err(AlertError::Notifier("sink down".to_string())));

        let dispatcher =
            dispatcher_with(store.clone(), limits.clone(), Some(Arc::new(mock)));
        dispatcher
            .dispatch(FiredAlert::Price {
                alert: price_alert(),
                close: 152.3,
            })
            .await;

        assert_eq!(store.is_alert_active(42), Some(false));
        assert_eq!(store.logged_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_strategy_dispatch_updates_last_trigger() {
        let store = Arc::new(InMemoryAlertStore::new());
        let limits = Arc::new(InMemoryUserLimits::new());
        let dispatcher = dispatcher_with(store.clone(), limits, None);

        let strategy = StrategyAlert {
            strategy_id: 9,
            user_id: 7,
            name: "momentum".to_string(),
            threshold: 0.8,
            universe: crate::domain::Universe::All,
            min_timeframe: None,
            last_trigger: None,
        };
        dispatcher
            .dispatch(FiredAlert::Strategy {
                strategy,
                matched: vec!["AAPL".to_string(), "MSFT".to_string()],
            })
            .await;

        let logs = store.logged_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, AlertKind::Strategy);
        assert!(logs[0].message.contains("AAPL, MSFT"));
        assert!(store.persisted_last_trigger(9).is_some());
    }
}
