use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Deployment environment: "dev" skips notifier init, anything else is
    /// treated as production
    #[serde(default = "default_environment")]
    pub environment: String,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL, e.g. redis://127.0.0.1:6379
    pub url: String,
}

/// Tunables of the evaluation loops.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_price_interval_secs")]
    pub price_interval_secs: u64,
    #[serde(default = "default_strategy_interval_secs")]
    pub strategy_interval_secs: u64,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,
    /// Delay before the first cleanup pass
    #[serde(default = "default_cleanup_initial_delay_secs")]
    pub cleanup_initial_delay_secs: u64,
    /// Deadline for one strategy task submit-and-await
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Universe size above which the server-side intersection script is used
    #[serde(default = "default_lua_intersect_threshold")]
    pub lua_intersect_threshold: usize,
    /// Ticker-update entries older than this are dropped by the daily cleanup
    #[serde(default = "default_ticker_update_max_age_days")]
    pub ticker_update_max_age_days: u32,
    /// Per-(strategy, ticker) throttling; when off every strategy falls back
    /// to the coarse last-trigger bucket check
    #[serde(default = "default_per_ticker_throttle")]
    pub per_ticker_throttle: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            price_interval_secs: default_price_interval_secs(),
            strategy_interval_secs: default_strategy_interval_secs(),
            metrics_interval_secs: default_metrics_interval_secs(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            cleanup_initial_delay_secs: default_cleanup_initial_delay_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            lua_intersect_threshold: default_lua_intersect_threshold(),
            ticker_update_max_age_days: default_ticker_update_max_age_days(),
            per_ticker_throttle: default_per_ticker_throttle(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_price_interval_secs() -> u64 {
    1
}

fn default_strategy_interval_secs() -> u64 {
    10
}

fn default_metrics_interval_secs() -> u64 {
    300
}

fn default_cleanup_interval_hours() -> u64 {
    24
}

fn default_cleanup_initial_delay_secs() -> u64 {
    3600
}

fn default_task_timeout_secs() -> u64 {
    120
}

fn default_lua_intersect_threshold() -> usize {
    1000
}

fn default_ticker_update_max_age_days() -> u32 {
    7
}

fn default_per_ticker_throttle() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_path = config_dir.as_ref();

        let mut builder = Config::builder()
            .set_default("environment", "dev")?
            // Empty URL deserializes fine and is caught by validate() unless
            // DATABASE_URL (or a config file) fills it in.
            .set_default("database.url", "")?
            .set_default("database.max_connections", 5)?
            .set_default("cache.url", "redis://127.0.0.1:6379")?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;

        // Accept either a config directory (`config/`) or a single TOML file.
        if config_path.is_file() {
            builder = builder.add_source(File::from(config_path).required(true));
        } else {
            builder = builder
                .add_source(File::from(config_path.join("default.toml")).required(false))
                .add_source(
                    File::from(config_path.join(
                        std::env::var("TICKWATCH_ENV").unwrap_or_else(|_| "development".to_string()),
                    ))
                    .required(false),
                );
        }

        builder = builder.add_source(
            // Override with environment variables (TICKWATCH_DATABASE__URL, etc.)
            Environment::with_prefix("TICKWATCH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn is_dev(&self) -> bool {
        self.environment.eq_ignore_ascii_case("dev")
            || self.environment.eq_ignore_ascii_case("development")
    }

    /// Validate config invariants. Returns list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.database.url.is_empty() {
            errors.push("database.url must be set".to_string());
        }
        if self.cache.url.is_empty() {
            errors.push("cache.url must be set".to_string());
        }
        if self.engine.price_interval_secs == 0 {
            errors.push("engine.price_interval_secs must be > 0".to_string());
        }
        if self.engine.strategy_interval_secs == 0 {
            errors.push("engine.strategy_interval_secs must be > 0".to_string());
        }
        if self.engine.task_timeout_secs == 0 {
            errors.push("engine.task_timeout_secs must be > 0".to_string());
        }
        if self.engine.ticker_update_max_age_days == 0 {
            errors.push("engine.ticker_update_max_age_days must be > 0".to_string());
        }
        errors
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string(&["ENVIRONMENT", "TICKWATCH_ENVIRONMENT"]) {
            self.environment = v;
        }

        if let Some(v) = env_string(&[
            "TICKWATCH_DATABASE__URL",
            "TICKWATCH_DATABASE_URL",
            "DATABASE_URL",
        ]) {
            self.database.url = v;
        }

        if let Some(v) = env_string(&["TICKWATCH_CACHE__URL", "TICKWATCH_REDIS_URL", "REDIS_URL"]) {
            self.cache.url = v;
        }

        if let Some(v) = env_bool(&["PER_TICKER_THROTTLE", "TICKWATCH_ENGINE__PER_TICKER_THROTTLE"])
        {
            self.engine.per_ticker_throttle = v;
        }
    }
}

fn env_string(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(v) = std::env::var(key) {
            return Some(v);
        }
    }
    None
}

fn env_bool(keys: &[&str]) -> Option<bool> {
    env_string(keys).and_then(|v| parse_bool_like(&v))
}

fn parse_bool_like(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
