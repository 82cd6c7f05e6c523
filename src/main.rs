use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekeeper::clock::{Clock, SystemClock};
use ratekeeper::config::{LogConfig, LogFormat, RatekeeperConfig};
use ratekeeper::grpc::GrpcServer;
use ratekeeper::ratelimit::RateLimiter;
use ratekeeper::store::{MemoryStore, RedisStore, StateStore};

/// How often the in-memory store drops expired buckets.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Distributed token bucket rate limiting service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "RATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Keep state in process memory instead of Redis (single instance only)
    #[arg(long)]
    memory: bool,

    /// Print every stored rule with its statistics as JSON and exit
    #[arg(long, conflicts_with = "memory")]
    print_stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RatekeeperConfig::load(args.config.as_deref())?;

    init_tracing(&config.log)?;

    info!("Starting Ratekeeper Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        default_rate = config.limiter.default_rate,
        default_burst = config.limiter.default_burst,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn StateStore> = if args.memory {
        info!("Using in-memory store");
        let memory = Arc::new(MemoryStore::new(clock.clone()));
        spawn_purge(memory.clone());
        memory
    } else {
        Arc::new(RedisStore::connect(&config.redis).await?)
    };

    let rate_limiter = Arc::new(RateLimiter::new(
        store.clone(),
        clock,
        config.limiter.default_limits(),
    ));
    info!("Rate limiter initialized");

    if args.print_stats {
        let report = rate_limiter.all_stats().await;
        store.close().await?;
        println!("{}", serde_json::to_string_pretty(&report?.to_json())?);
        return Ok(());
    }

    let grpc_server = GrpcServer::new(
        config.server.grpc_addr,
        rate_limiter,
        config.limiter.failure_mode,
    );

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    let served = grpc_server.serve_with_shutdown(shutdown_signal()).await;

    store.close().await?;
    served?;

    info!("Ratekeeper Rate Limiting Service stopped");
    Ok(())
}

/// Periodically reclaim expired entries of the in-memory store.
fn spawn_purge(store: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            store.purge_expired();
        }
    });
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
