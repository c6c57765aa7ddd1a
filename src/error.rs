use thiserror::Error;

/// Main error type for the alert engine
#[derive(Error, Debug)]
pub enum AlertError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    // Startup errors
    #[error("Initial load failed: {0}")]
    Init(String),

    // Persistent store errors
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    // Shared cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    // Queue / worker-pool errors
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Timed out waiting for task result: {task_id}")]
    Timeout { task_id: String },

    #[error("Failed to decode task result: {0}")]
    Decode(String),

    #[error("Worker reported failure: {message}")]
    Worker { message: String },

    // Notification sink errors
    #[error("Notifier error: {0}")]
    Notifier(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AlertError {
    /// Conditions that warrant out-of-band escalation in production.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            AlertError::Config(_) | AlertError::ConfigFile(_) | AlertError::Init(_)
        )
    }
}

/// Result type alias for AlertError
pub type Result<T> = std::result::Result<T, AlertError>;
