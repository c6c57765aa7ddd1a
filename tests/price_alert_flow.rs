//! End-to-end price-alert behaviour over the in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;
use tickwatch::adapters::{
    InMemoryAlertStore, InMemoryQueueTransport, InMemoryTickerIndex, InMemoryUserLimits, PushHub,
    SharedCloseCache, UserLimits,
};
use tickwatch::domain::{Direction, NewPriceAlert, PriceAlert};
use tickwatch::engine::{
    AlertService, AlertServiceDeps, Dispatcher, EngineMetrics, PriceAlertBook, PriceEvaluator,
};
use tickwatch::config::EngineConfig;
use tickwatch::AlertError;

fn engine_config() -> EngineConfig {
    EngineConfig::default()
}

fn alert(alert_id: i64, security_id: i64, price: f64, direction: Direction) -> PriceAlert {
    PriceAlert {
        alert_id,
        user_id: 1,
        security_id,
        ticker: format!("SEC{security_id}"),
        price,
        direction,
    }
}

struct PriceHarness {
    book: Arc<PriceAlertBook>,
    prices: Arc<SharedCloseCache>,
    store: Arc<InMemoryAlertStore>,
    limits: Arc<InMemoryUserLimits>,
    push: Arc<PushHub>,
    evaluator: PriceEvaluator,
}

fn price_harness() -> PriceHarness {
    let book = Arc::new(PriceAlertBook::new());
    let prices = SharedCloseCache::new();
    let store = Arc::new(InMemoryAlertStore::new().with_security(10, "SEC10"));
    let limits = Arc::new(InMemoryUserLimits::new());
    let push = Arc::new(PushHub::new());
    let metrics = Arc::new(EngineMetrics::new());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        None,
        push.clone(),
        limits.clone(),
        metrics.clone(),
    ));
    let evaluator = PriceEvaluator::new(book.clone(), prices.clone(), dispatcher, metrics);
    PriceHarness {
        book,
        prices,
        store,
        limits,
        push,
        evaluator,
    }
}

#[tokio::test]
async fn test_above_crossing_fires_and_tightens_boundary() {
    let harness = price_harness();
    harness.store.seed_price_alert(alert(1, 10, 150.0, Direction::Above));
    harness.store.seed_price_alert(alert(2, 10, 160.0, Direction::Above));
    harness.book.insert(alert(1, 10, 150.0, Direction::Above)).await;
    harness.book.insert(alert(2, 10, 160.0, Direction::Above)).await;

    let mut push_rx = harness.push.subscribe();

    // Below both boundaries: nothing fires.
    harness.prices.set_close(10, 140.0);
    harness.evaluator.run_once().await;
    assert_eq!(harness.book.total_alerts().await, 2);

    // Tick to 152: only the 150 alert fires.
    harness.prices.set_close(10, 152.0);
    harness.evaluator.run_once().await;

    assert_eq!(harness.book.total_alerts().await, 1);
    let shard = harness.book.shard(10).unwrap();
    assert_eq!(shard.boundaries().await.0, 160.0);

    // Fired alert left the store inactive and reached the push channel.
    assert_eq!(harness.store.is_alert_active(1), Some(false));
    assert_eq!(harness.store.is_alert_active(2), Some(true));
    let pushed = push_rx.recv().await.unwrap();
    assert_eq!(pushed.alert_id, 1);
    assert_eq!(pushed.tickers, vec!["SEC10".to_string()]);
}

#[tokio::test]
async fn test_boundary_recompute_after_remove_then_fire() {
    let harness = price_harness();
    for (id, price) in [(1, 100.0), (2, 105.0), (3, 110.0)] {
        harness.store.seed_price_alert(alert(id, 10, price, Direction::Below));
        harness.book.insert(alert(id, 10, price, Direction::Below)).await;
    }

    // Removing the boundary holder leaves the shard dirty.
    harness.book.remove(3).await.unwrap();

    // Next evaluation at 108 must recompute to 105 and fire that alert.
    harness.prices.set_close(10, 108.0);
    harness.evaluator.run_once().await;

    assert_eq!(harness.store.is_alert_active(2), Some(false));
    assert_eq!(harness.store.is_alert_active(1), Some(true));
    let shard = harness.book.shard(10).unwrap();
    assert_eq!(shard.boundaries().await.1, 100.0);
}

#[tokio::test]
async fn test_fired_alert_decrements_counter_once() {
    let harness = price_harness();
    harness.limits.increment_active_price_alerts(1).await.unwrap();
    harness.store.seed_price_alert(alert(1, 10, 150.0, Direction::Above));
    harness.book.insert(alert(1, 10, 150.0, Direction::Above)).await;

    harness.prices.set_close(10, 151.0);
    harness.evaluator.run_once().await;
    // A second pass with the same close must not fire or decrement again.
    harness.evaluator.run_once().await;

    assert_eq!(harness.limits.active_price_alerts(1), 0);
    assert_eq!(harness.store.logged_entries().len(), 1);
}

fn service_deps(
    store: Arc<InMemoryAlertStore>,
    limits: Arc<InMemoryUserLimits>,
    prices: Arc<SharedCloseCache>,
) -> AlertServiceDeps {
    AlertServiceDeps {
        store,
        index: Arc::new(InMemoryTickerIndex::new()),
        queue_transport: Arc::new(InMemoryQueueTransport::new()),
        notifier: None,
        push: Arc::new(PushHub::new()),
        limits,
        prices,
    }
}

#[tokio::test]
async fn test_service_start_is_idempotent_and_loads_state() {
    let store = Arc::new(InMemoryAlertStore::new().with_security(10, "SEC10"));
    store.seed_price_alert(alert(1, 10, 150.0, Direction::Above));
    let limits = Arc::new(InMemoryUserLimits::new());
    let prices = SharedCloseCache::new();

    let service = AlertService::new(
        "dev".to_string(),
        engine_config(),
        service_deps(store, limits, prices),
    );

    assert!(!service.is_running());
    service.start().await.unwrap();
    assert!(service.is_running());
    assert_eq!(service.book().total_alerts().await, 1);

    // Second start is a no-op success.
    service.start().await.unwrap();

    service.stop().await;
    assert!(!service.is_running());
    // Stop is safe to repeat.
    service.stop().await;
}

#[tokio::test]
async fn test_production_start_requires_notifier() {
    let store = Arc::new(InMemoryAlertStore::new());
    let limits = Arc::new(InMemoryUserLimits::new());
    let prices = SharedCloseCache::new();

    let service = AlertService::new(
        "production".to_string(),
        engine_config(),
        service_deps(store, limits, prices),
    );

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, AlertError::Config(_)));
    assert!(!service.is_running());
}

#[tokio::test]
async fn test_add_and_remove_price_alert_api() {
    let store = Arc::new(InMemoryAlertStore::new().with_security(10, "SEC10"));
    let limits = Arc::new(InMemoryUserLimits::new());
    let prices = SharedCloseCache::new();

    let service = AlertService::new(
        "dev".to_string(),
        engine_config(),
        service_deps(store.clone(), limits.clone(), prices),
    );

    let added = service
        .add_price_alert(NewPriceAlert {
            user_id: 1,
            security_id: 10,
            price: 150.0,
            direction: Direction::Above,
        })
        .await
        .unwrap();
    assert_eq!(added.ticker, "SEC10");
    assert_eq!(limits.active_price_alerts(1), 1);
    assert_eq!(service.book().total_alerts().await, 1);

    let rejected = service
        .add_price_alert(NewPriceAlert {
            user_id: 1,
            security_id: 10,
            price: -5.0,
            direction: Direction::Below,
        })
        .await;
    assert!(matches!(rejected, Err(AlertError::Config(_))));

    let removed = service.remove_price_alert(added.alert_id).await.unwrap();
    assert_eq!(removed.unwrap().alert_id, added.alert_id);
    assert_eq!(store.is_alert_active(added.alert_id), Some(false));
    assert_eq!(limits.active_price_alerts(1), 0);
    assert_eq!(service.book().total_alerts().await, 0);
}

#[tokio::test]
async fn test_running_service_fires_alert_from_loop() {
    let store = Arc::new(InMemoryAlertStore::new().with_security(10, "SEC10"));
    store.seed_price_alert(alert(1, 10, 150.0, Direction::Above));
    let limits = Arc::new(InMemoryUserLimits::new());
    let prices = SharedCloseCache::new();

    let service = AlertService::new(
        "dev".to_string(),
        engine_config(),
        service_deps(store.clone(), limits, prices.clone()),
    );
    service.start().await.unwrap();

    prices.set_close(10, 152.0);

    // Price loop runs at 1s cadence; give it two ticks.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if store.is_alert_active(1) == Some(false) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "alert did not fire within the deadline"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    service.stop().await;
}
