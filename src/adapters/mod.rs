pub mod cache;
pub mod limits;
pub mod market_data;
pub mod notifier;
pub mod postgres;
pub mod push;
pub mod queue;
pub mod store;

pub use cache::{InMemoryTickerIndex, IndexCounters, RedisTickerIndex, TickerIndex};
pub use limits::{InMemoryUserLimits, RedisUserLimits, UserLimits};
pub use market_data::{ClosePriceSource, SharedCloseCache};
pub use notifier::{escalate_critical, ChatNotifier, Notifier};
pub use postgres::PostgresStore;
pub use push::PushHub;
pub use queue::{
    InMemoryQueueTransport, QueueClient, QueueTransport, RedisQueueTransport, RESULT_TOPIC,
};
pub use store::{AlertStore, InMemoryAlertStore};
