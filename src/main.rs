//! tickwatch: real-time alert engine for the market-data platform.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tickwatch::adapters::{
    ChatNotifier, PostgresStore, PushHub, RedisQueueTransport, RedisTickerIndex, RedisUserLimits,
    SharedCloseCache,
};
use tickwatch::engine::{AlertService, AlertServiceDeps};
use tickwatch::error::{AlertError, Result};
use tickwatch::AppConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tickwatch", about = "Real-time alert engine")]
struct Cli {
    /// Config directory or a single TOML file
    #[arg(short, long, default_value = "config", env = "TICKWATCH_CONFIG")]
    config: PathBuf,
}

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tickwatch=debug,sqlx=warn"));

    // Check if we should write to file (prefer TICKWATCH_LOG_DIR, fallback to
    // LOG_DIR or /var/log/tickwatch).
    let log_dir = std::env::var("TICKWATCH_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "/var/log/tickwatch".to_string());

    // `tracing_appender::rolling::daily` panics if it can't create the
    // initial log file, so preflight writability first.
    let file_layer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".tickwatch_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&log_dir, "tickwatch.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard alive for the process lifetime
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: Could not create log directory {}, file logging disabled",
            log_dir
        );
        None
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load_from(&cli.config)?;
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(AlertError::Config(problems.join("; ")));
    }
    info!("starting tickwatch (environment: {})", config.environment);

    let store = Arc::new(PostgresStore::new(&config.database.url, config.database.max_connections).await?);

    let redis_client = redis::Client::open(config.cache.url.as_str())?;
    let redis_conn = redis_client.get_connection_manager().await?;
    info!("Connected to cache");

    let index = Arc::new(RedisTickerIndex::new(redis_conn.clone()));
    let queue_transport = Arc::new(RedisQueueTransport::new(redis_client, redis_conn.clone()));
    let limits = Arc::new(RedisUserLimits::new(redis_conn));
    let notifier = ChatNotifier::from_env(config.is_dev())?
        .map(|n| n as Arc<dyn tickwatch::adapters::Notifier>);

    // The tick pipeline populates this shared view with second-bar closes.
    let prices = SharedCloseCache::new();

    let service = AlertService::new(
        config.environment.clone(),
        config.engine.clone(),
        AlertServiceDeps {
            store,
            index,
            queue_transport,
            notifier,
            push: Arc::new(PushHub::new()),
            limits,
            prices,
        },
    );

    service.start().await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AlertError::Internal(format!("failed to listen for ctrl-c: {e}")))?;
    info!("shutdown signal received");
    service.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}
