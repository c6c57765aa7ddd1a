pub mod adapters;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;

pub use adapters::{
    AlertStore, ChatNotifier, ClosePriceSource, InMemoryAlertStore, InMemoryQueueTransport,
    InMemoryTickerIndex, InMemoryUserLimits, Notifier, PostgresStore, PushHub, QueueClient,
    QueueTransport, RedisQueueTransport, RedisTickerIndex, RedisUserLimits, SharedCloseCache,
    TickerIndex, UserLimits,
};
pub use config::AppConfig;
pub use domain::{
    AlertKind, AlertLogEntry, AlertTaskArgs, AlertTaskResult, Direction, FiredAlert,
    NewPriceAlert, PriceAlert, ResultEnvelope, StrategyAlert, TaskEnvelope, TaskKind, TaskStatus,
    Timeframe, Universe, UserAlert,
};
pub use engine::{
    AlertService, AlertServiceDeps, Dispatcher, EngineMetrics, PriceAlertBook, PriceEvaluator,
    SkipReason, StrategyOutcome, StrategyProcessor, StrategyRegistry,
};
pub use error::{AlertError, Result};
