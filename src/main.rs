use std::sync::Arc;
use std::time::Duration;

use switchyard::{
    AppState, BackendPool, Balancer, Config, HealthChecker, Limit, RateLimiter, RedisStore,
    build_client, serve, shutdown_signal,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long in-flight requests may take to finish after shutdown begins.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::load().unwrap_or_else(|e| {
        error!(%e, "failed to load configuration");
        std::process::exit(1);
    });

    info!(
        backends = config.backends.len(),
        algorithm = %config.balancer.algorithm,
        rate = config.rate_limiting.rate_per_second,
        burst = config.rate_limiting.capacity,
        probe_interval = ?config.healthcheck.interval,
        probe_timeout = ?config.healthcheck.timeout,
        "configuration loaded"
    );

    let pool = BackendPool::from_urls(&config.backends).unwrap_or_else(|e| {
        error!(%e, "failed to build backend pool");
        std::process::exit(1);
    });

    let balancer = Balancer::new(&config.balancer.algorithm, pool.clone()).unwrap_or_else(|e| {
        error!(%e, "failed to build balancer");
        std::process::exit(1);
    });

    let default_limit = Limit::per_second(
        config.rate_limiting.rate_per_second,
        config.rate_limiting.capacity,
    )
    .unwrap_or_else(|e| {
        error!(%e, "invalid rate limit configuration");
        std::process::exit(1);
    });

    // The datastore must be reachable at boot; running without a
    // decidable rate limiter is not an option.
    let store = RedisStore::connect(&config.storage.redis).await.unwrap_or_else(|e| {
        error!(%e, "failed to connect to rate-limit datastore");
        std::process::exit(1);
    });
    let limiter = RateLimiter::new(Arc::new(store), default_limit);

    let shutdown = CancellationToken::new();
    let prober = tokio::spawn(
        HealthChecker::new(
            config.healthcheck.interval,
            config.healthcheck.timeout,
            pool.clone(),
        )
        .run(shutdown.clone()),
    );

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        error!(%e, %addr, "failed to bind");
        std::process::exit(1);
    });
    info!(%addr, "listening");

    let state = Arc::new(AppState {
        client: build_client(),
        balancer,
        limiter,
    });
    let tracker = TaskTracker::new();
    let server = tokio::spawn(serve(listener, state, shutdown.clone(), tracker.clone()));

    shutdown_signal().await;
    shutdown.cancel();

    tracker.close();
    if tokio::time::timeout(DRAIN_DEADLINE, tracker.wait()).await.is_err() {
        warn!(deadline = ?DRAIN_DEADLINE, "drain deadline exceeded, exiting with requests in flight");
    }

    info!("closing datastore connection");
    let _ = prober.await;
    let _ = server.await;

    info!("server stopped");
}
