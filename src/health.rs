//! Background liveness prober.
//!
//! Every `interval` the checker sweeps the pool in order and issues
//! `GET <backend-url>/healthcheck` to each backend, bounded by the
//! per-probe `timeout`. A 200 marks the backend alive; any other status,
//! transport error, or timeout marks it dead. Probe failures only
//! update liveness; the next sweep is the retry.
//!
//! Probes within a sweep are sequential, which bounds resource use for
//! the expected pool sizes, and the cancellation token is checked
//! between probes so shutdown does not wait for a sweep to finish.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::StatusCode;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendPool};

/// Path every backend must answer with 200 while healthy.
const HEALTHCHECK_PATH: &str = "/healthcheck";

type ProbeClient = Client<HttpConnector, Empty<Bytes>>;

/// Periodic prober over the shared backend pool.
///
/// One instance is spawned at startup and runs until cancelled; `run`
/// consumes the checker, so a stopped prober cannot be restarted.
#[derive(Debug)]
pub struct HealthChecker {
    interval: Duration,
    timeout: Duration,
    pool: BackendPool,
}

impl HealthChecker {
    pub fn new(interval: Duration, timeout: Duration, pool: BackendPool) -> Self {
        Self {
            interval,
            timeout,
            pool,
        }
    }

    /// Runs probe sweeps until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let client: ProbeClient = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // An interval's first tick completes immediately; consume it so
        // the first sweep happens one full interval after spawn.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("health checker stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            for backend in self.pool.all() {
                if shutdown.is_cancelled() {
                    info!("health checker stopped");
                    return;
                }
                self.probe(&client, backend).await;
            }
        }
    }

    async fn probe(&self, client: &ProbeClient, backend: &Backend) {
        let raw = format!(
            "{}{HEALTHCHECK_PATH}",
            backend.url().to_string().trim_end_matches('/')
        );
        let uri = match raw.parse::<hyper::Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(backend = %backend.url(), error = %e, "failed to build healthcheck URI");
                return;
            }
        };

        match tokio::time::timeout(self.timeout, client.get(uri)).await {
            Ok(Ok(resp)) if resp.status() == StatusCode::OK => {
                debug!(backend = %backend.url(), "healthcheck passed");
                backend.set_alive(true);
            }
            Ok(Ok(resp)) => {
                warn!(
                    backend = %backend.url(),
                    status = resp.status().as_u16(),
                    "healthcheck returned non-200 status"
                );
                backend.set_alive(false);
            }
            Ok(Err(e)) => {
                warn!(backend = %backend.url(), error = %e, "healthcheck request failed");
                backend.set_alive(false);
            }
            Err(_) => {
                warn!(backend = %backend.url(), timeout = ?self.timeout, "healthcheck timed out");
                backend.set_alive(false);
            }
        }
    }
}
