//! Market Fanout Binary
//!
//! Starts the snapshot cache, session registry and fan-out engine, plus the
//! background sweeps and the health endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-fanout
//! ```
//!
//! # Environment Variables
//!
//! - `MARKET_FANOUT_FEED`: simulated | external (default: simulated); external
//!   ticks are posted to `/ingest` on the health port
//! - `MARKET_FANOUT_FEED_INSTRUMENTS`: `id:exchange:base` list for the simulator
//! - `MARKET_FANOUT_FEED_TICK_MS`: simulated tick period (default: 1000)
//! - `MARKET_FANOUT_STALE_SECS`: snapshot staleness window (default: 300)
//! - `MARKET_FANOUT_CACHE_SWEEP_SECS`: cache sweep period (default: 600)
//! - `MARKET_FANOUT_SESSION_TIMEOUT_SECS`: session idle timeout (default: 1800)
//! - `MARKET_FANOUT_SESSION_SWEEP_SECS`: session sweep period (default: 300)
//! - `MARKET_FANOUT_PUSH_INTERVAL_MS`: fan-out cadence (default: 500)
//! - `MARKET_FANOUT_PUSH_WARMUP_MS`: delay before the first cycle (default: 1000)
//! - `MARKET_FANOUT_TOPIC_CAPACITY`: buffered payloads per topic (default: 256)
//! - `MARKET_FANOUT_HEALTH_PORT`: health/stats/metrics port (default: 8083)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use market_fanout::application::ports::{RemovalReason, ServiceMetrics, Transport};
use market_fanout::application::services::{FanoutConfig, FanoutEngine, MarketDataService};
use market_fanout::domain::cache::SnapshotStore;
use market_fanout::domain::clock::{SharedClock, SystemClock};
use market_fanout::domain::session::SessionRegistry;
use market_fanout::infrastructure::broadcast::{TopicHub, TopicHubConfig};
use market_fanout::infrastructure::config::{FeedMode, ServiceConfig};
use market_fanout::infrastructure::feed::{self, DEFAULT_FEED_CAPACITY, FeedState, SimulatedFeed};
use market_fanout::infrastructure::health::{HealthServer, HealthServerState};
use market_fanout::infrastructure::metrics::{
    PrometheusMetrics, init_metrics, publish_cache_stats, publish_session_stats,
    record_snapshots_evicted,
};
use market_fanout::infrastructure::scheduler::{self, TaskHandle};
use market_fanout::infrastructure::telemetry;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout per background task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Fanout");

    let _metrics_handle = init_metrics();

    let config = ServiceConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let clock: SharedClock = Arc::new(SystemClock);

    // Core state
    let store = Arc::new(SnapshotStore::with_staleness_window(
        Arc::clone(&clock),
        config.cache.staleness_window,
    ));
    let registry = Arc::new(SessionRegistry::with_timeout(
        Arc::clone(&clock),
        config.sessions.timeout,
    ));
    let hub = Arc::new(TopicHub::new(TopicHubConfig::from(config.broadcast)));
    let metrics: Arc<dyn ServiceMetrics> = Arc::new(PrometheusMetrics);
    let engine = Arc::new(
        FanoutEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&hub) as Arc<dyn Transport>,
            Arc::clone(&clock),
            FanoutConfig::from(config.fanout),
        )
        .with_metrics(Arc::clone(&metrics)),
    );
    let service = MarketDataService::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&engine),
    )
    .with_metrics(Arc::clone(&metrics));

    // Feed ingestion
    let feed_state = Arc::new(FeedState::new());
    let (feed_tx, feed_rx) = feed::channel(DEFAULT_FEED_CAPACITY);
    let mut tasks: Vec<TaskHandle> = Vec::new();

    let ingest_token = shutdown_token.child_token();
    tasks.push(scheduler::spawn(
        "feed_ingest",
        ingest_token.clone(),
        feed::run_ingest(
            feed_rx,
            Arc::clone(&store),
            Arc::clone(&feed_state),
            ingest_token,
        ),
    )?);

    let ingest = match config.feed.mode {
        FeedMode::Simulated => {
            let simulator = SimulatedFeed::new(
                config.feed.instruments.clone(),
                config.feed.tick_interval,
                feed_tx,
            );
            let token = shutdown_token.child_token();
            tasks.push(scheduler::spawn(
                "simulated_feed",
                token.clone(),
                simulator.run(token),
            )?);
            None
        }
        FeedMode::External => {
            tracing::info!(
                port = config.server.health_port,
                "Accepting external ticks on /ingest"
            );
            Some(feed_tx)
        }
    };

    // Cache sweep
    let sweep_store = Arc::clone(&store);
    tasks.push(scheduler::spawn_periodic(
        "cache_sweep",
        config.cache.sweep_interval,
        config.cache.sweep_interval,
        shutdown_token.child_token(),
        move || {
            let store = Arc::clone(&sweep_store);
            async move {
                let evicted = store.sweep();
                record_snapshots_evicted(evicted as u64);
                publish_cache_stats(&store.stats());
                Ok::<(), Infallible>(())
            }
        },
    )?);

    // Session sweep
    let sweep_registry = Arc::clone(&registry);
    let sweep_hub = Arc::clone(&hub);
    let sweep_metrics = Arc::clone(&metrics);
    tasks.push(scheduler::spawn_periodic(
        "session_sweep",
        config.sessions.sweep_interval,
        config.sessions.sweep_interval,
        shutdown_token.child_token(),
        move || {
            let registry = Arc::clone(&sweep_registry);
            let hub = Arc::clone(&sweep_hub);
            let metrics = Arc::clone(&sweep_metrics);
            async move {
                let expired = registry.sweep();
                metrics.sessions_removed(RemovalReason::Expired, expired as u64);
                hub.prune_idle();
                publish_session_stats(&registry.stats());
                Ok::<(), Infallible>(())
            }
        },
    )?);

    // Fan-out cycle
    let fanout = engine.config();
    tracing::info!(
        push_interval_ms = fanout.push_interval.as_millis(),
        warmup_ms = fanout.warmup.as_millis(),
        "Fan-out engine started"
    );
    let cycle_engine = Arc::clone(&engine);
    tasks.push(scheduler::spawn_periodic(
        "fanout_cycle",
        fanout.warmup,
        fanout.push_interval,
        shutdown_token.child_token(),
        move || {
            let engine = Arc::clone(&cycle_engine);
            async move {
                engine.run_cycle().await;
                Ok::<(), Infallible>(())
            }
        },
    )?);

    // Health server
    let mut health_state = HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&feed_state),
        service,
        Arc::clone(&hub),
    );
    if let Some(sender) = ingest {
        health_state = health_state.with_ingest(sender);
    }
    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::new(health_state),
        shutdown_token.child_token(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Market fanout ready");

    await_shutdown(shutdown_token).await;

    for task in tasks {
        task.shutdown(SHUTDOWN_TIMEOUT).await;
    }
    hub.close();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, health_task).await.is_err() {
        tracing::warn!("Health server did not stop in time");
    }

    tracing::info!(fanout = ?engine.stats(), "Market fanout stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    tracing::info!(
        feed = config.feed.mode.as_str(),
        instruments = config.feed.instruments.len(),
        push_interval_ms = config.fanout.push_interval.as_millis(),
        staleness_secs = config.cache.staleness_window.as_secs(),
        session_timeout_secs = config.sessions.timeout.as_secs(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
