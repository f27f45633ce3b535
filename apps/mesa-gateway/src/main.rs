mod assignment;
mod auth;
mod breaker;
mod broadcast;
mod config;
mod error;
mod health;
mod lifecycle;
mod limiter;
mod locks;
mod pipeline;
mod registry;
mod router;
mod telemetry;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use futures_util::future::join_all;
use metrics_exporter_prometheus::PrometheusHandle;
use redis::aio::ConnectionManager;
use tokio::signal;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use mesa_proto::close_codes;

use crate::assignment::{RedisAssignmentStore, SectorAssignmentStore};
use crate::auth::{
    AuthStrategy, CompositeStrategy, RedisRevocationList, SessionStrategy, TokenStrategy,
};
use crate::breaker::CircuitBreaker;
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::lifecycle::{close_message, LifecycleManager};
use crate::limiter::RateLimiter;
use crate::pipeline::{DropRateTracker, EventQueue, IngestPipeline};
use crate::registry::ConnectionRegistry;
use crate::router::EventRouter;
use crate::telemetry::Telemetry;

const ASSIGNMENT_CACHE_TTL: Duration = Duration::from_secs(15);
const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "mesa-gateway", version, about = "Mesa real-time event gateway")]
struct Cli {
    /// Address to bind the listener to.
    #[arg(long, env = "MESA_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Redis connection URI, used as event broker and auxiliary store.
    #[arg(long, env = "MESA_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "MESA_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ConnectionRegistry,
    pub lifecycle: Arc<LifecycleManager>,
    pub limiter: Arc<RateLimiter>,
    pub staff_auth: Arc<dyn AuthStrategy>,
    pub diner_auth: Arc<dyn AuthStrategy>,
    pub assignments: Arc<dyn SectorAssignmentStore>,
    pub pipeline: Arc<IngestPipeline>,
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env());

    let listen_addr: SocketAddr = cli
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
    let shutdown_grace = Duration::from_secs(cli.shutdown_grace_secs);

    info!(
        %listen_addr,
        redis_url = cli.redis_url,
        global_cap = config.global_connection_cap,
        "starting mesa-gateway"
    );

    let redis_client =
        redis::Client::open(cli.redis_url.clone()).context("invalid redis url")?;
    let redis = ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to redis")?;

    let registry = ConnectionRegistry::new();
    let limiter = Arc::new(RateLimiter::new(
        config.message_rate_limit,
        RATE_WINDOW,
        config.rate_table_cap,
    ));
    let lifecycle = Arc::new(LifecycleManager::new(
        registry.clone(),
        limiter.clone(),
        config.per_user_connection_cap,
        config.global_connection_cap,
        config.heartbeat_timeout,
    ));

    let revocations = Arc::new(RedisRevocationList::new(redis.clone()));
    let staff_auth: Arc<dyn AuthStrategy> = Arc::new(TokenStrategy::new(
        &config.staff_token_secret,
        config.token_issuer.as_deref(),
        config.token_audience.as_deref(),
        revocations,
    ));
    let diner_auth: Arc<dyn AuthStrategy> = Arc::new(CompositeStrategy::new(vec![Arc::new(
        SessionStrategy::new(config.session_token_secret.as_bytes()),
    )]));
    let assignments: Arc<dyn SectorAssignmentStore> = Arc::new(RedisAssignmentStore::new(
        redis.clone(),
        ASSIGNMENT_CACHE_TTL,
    ));

    let pipeline = Arc::new(IngestPipeline {
        queue: Arc::new(EventQueue::new(config.queue_capacity)),
        drops: Arc::new(DropRateTracker::new(
            Duration::from_secs(60),
            config.drop_alert_threshold,
            config.drop_alert_cooldown,
        )),
        breaker: Arc::new(CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_cooldown,
            config.breaker_half_open_max,
        )),
    });

    let broadcaster = Arc::new(Broadcaster::new(
        config.broadcast_batch_size,
        config.send_timeout,
        config.broadcast_rate_limit,
    ));
    let event_router = Arc::new(EventRouter::new(
        registry.clone(),
        broadcaster,
        config.tenant_wide_types.clone(),
        config.kitchen_types.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let subscriber = pipeline::spawn_subscriber(
        cli.redis_url.clone(),
        pipeline.clone(),
        shutdown_rx.clone(),
    );
    let processor = pipeline::spawn_batch_processor(
        pipeline.clone(),
        event_router,
        config.queue_batch_size,
        config.routing_timeout,
        shutdown_rx.clone(),
    );
    let (stale_sweep, dead_sweep) = lifecycle.spawn_sweepers(config.sweep_interval, shutdown_rx);

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        lifecycle: lifecycle.clone(),
        limiter,
        staff_auth,
        diner_auth,
        assignments,
        pipeline,
        metrics: telemetry.metrics_handle(),
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/ws/waiter", get(ws::waiter_handler))
        .route("/ws/kitchen", get(ws::kitchen_handler))
        .route("/ws/admin", get(ws::admin_handler))
        .route("/ws/table", get(ws::diner_handler))
        .route("/healthz", get(health::healthz))
        .route("/health/detail", get(health::health_detail))
        .route("/metrics", get(health::metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(%listen_addr, "mesa-gateway listening");

    // On ctrl-c every client gets a going-away close before the listener
    // stops; their sockets then wind down and the serve future resolves.
    let shutdown = {
        let registry = registry.clone();
        async move {
            let _ = signal::ctrl_c().await;
            info!(
                connections = registry.len(),
                "shutdown signal received, notifying clients"
            );
            for conn in registry.snapshot_all() {
                let _ = conn
                    .sender()
                    .send(close_message(close_codes::GOING_AWAY, "server shutting down"))
                    .await;
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")?;

    // Signal the background tasks to stop. The batch processor routes the
    // remaining queue before exiting; the subscriber and sweepers exit at
    // their next wakeup. Stragglers past the grace window get aborted.
    let _ = shutdown_tx.send(true);
    info!(
        grace_secs = shutdown_grace.as_secs(),
        "draining background tasks"
    );
    let tasks = vec![subscriber, processor, stale_sweep, dead_sweep];
    let stragglers: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
    if tokio::time::timeout(shutdown_grace, join_all(tasks))
        .await
        .is_err()
    {
        warn!("grace period expired, aborting remaining tasks");
        for straggler in stragglers {
            straggler.abort();
        }
    }
    info!("graceful shutdown complete");
    Ok(())
}
