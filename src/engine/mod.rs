pub mod dispatch;
pub mod metrics;
pub mod price;
pub mod service;
pub mod strategy;

pub use dispatch::Dispatcher;
pub use metrics::EngineMetrics;
pub use price::{PriceAlertBook, PriceEvaluator, PriceShard};
pub use service::{AlertService, AlertServiceDeps};
pub use strategy::{SkipReason, StrategyOutcome, StrategyProcessor, StrategyRegistry};
