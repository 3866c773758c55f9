//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backend servers, an in-memory [`LimitStore`]
//! with real token-bucket refill (so gate scenarios run without a Redis
//! instance), an error-injecting store, and state builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use switchyard::{
    AppState, Balancer, BackendPool, BoxBody, Decision, Error, Limit, LimitStore, RateLimiter,
    build_client,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in test invocations.
pub const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// Collects a [`BoxBody`] into [`Bytes`].
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

pub fn pool_of(addrs: &[SocketAddr]) -> BackendPool {
    let urls: Vec<String> = addrs.iter().map(|a| format!("http://{a}")).collect();
    BackendPool::from_urls(&urls).expect("test pool must be valid")
}

/// Builds request-handling state over the given pool with an in-memory
/// limit store and a generous default limit.
pub fn test_state(pool: BackendPool) -> Arc<AppState> {
    test_state_with_limit(pool, Limit::per_second(100, 100).unwrap())
}

pub fn test_state_with_limit(pool: BackendPool, default_limit: Limit) -> Arc<AppState> {
    test_state_with_store(pool, Arc::new(MemoryStore::new()), default_limit)
}

pub fn test_state_with_store(
    pool: BackendPool,
    store: Arc<dyn LimitStore>,
    default_limit: Limit,
) -> Arc<AppState> {
    Arc::new(AppState {
        client: build_client(),
        balancer: Balancer::new("roundrobin", pool).expect("roundrobin must construct"),
        limiter: RateLimiter::new(store, default_limit),
    })
}

/// In-memory [`LimitStore`] implementing the same token-bucket
/// semantics as the production Lua script, including re-priming the
/// bucket when the applied limit changes.
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, BucketState>>,
}

struct BucketState {
    tokens: f64,
    refreshed: Instant,
    limit: Limit,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LimitStore for MemoryStore {
    async fn allow(&self, key: &str, limit: Limit) -> Result<Decision, Error> {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();

        let bucket = buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: f64::from(limit.burst),
            refreshed: now,
            limit,
        });
        if bucket.limit != limit {
            bucket.tokens = f64::from(limit.burst);
            bucket.limit = limit;
        }

        let refill_per_sec = f64::from(limit.rate) / limit.period.as_secs_f64();
        let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(f64::from(limit.burst));
        bucket.refreshed = now;

        let allowed = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            1
        } else {
            0
        };

        let reset_after = (f64::from(limit.burst) - bucket.tokens) / refill_per_sec;
        Ok(Decision {
            allowed,
            remaining: bucket.tokens as u64,
            reset_after: Duration::from_secs_f64(reset_after),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), Error> {
        self.buckets.lock().unwrap().remove(key);
        Ok(())
    }
}

/// A [`LimitStore`] whose `allow` always fails, recording how often the
/// gate attempted the self-healing `reset`.
pub struct FailingStore {
    pub resets: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            resets: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LimitStore for FailingStore {
    async fn allow(&self, _key: &str, _limit: Limit) -> Result<Decision, Error> {
        Err(Error::Storage("connection refused".into()))
    }

    async fn reset(&self, _key: &str) -> Result<(), Error> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Starts a local HTTP server that responds to every request with the
/// given status and body. Returns the server address and a shutdown
/// handle.
pub async fn start_backend(
    status: StatusCode,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    serve_with(move |_req| async move {
        Response::builder()
            .status(status)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(body)))
            .expect("test response must build")
    })
    .await
}

/// Starts a backend that answers `health_status` on `/healthcheck` and
/// 200 `"ok"` everywhere else.
pub async fn start_health_backend(health_status: StatusCode) -> (SocketAddr, oneshot::Sender<()>) {
    serve_with(move |req| async move {
        let (status, body) = if req.uri().path() == "/healthcheck" {
            (health_status, "")
        } else {
            (StatusCode::OK, "ok")
        };
        Response::builder()
            .status(status)
            .body(Full::new(Bytes::from(body)))
            .expect("test response must build")
    })
    .await
}

/// Starts a backend that echoes the request line and sorted headers so
/// tests can assert on what actually crossed the proxy hop.
pub async fn start_echo_backend() -> (SocketAddr, oneshot::Sender<()>) {
    serve_with(|req: Request<Incoming>| async move {
        let mut lines = vec![format!(
            "{} {}",
            req.method(),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        )];

        let mut header_lines: Vec<String> = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| format!("{}: {v}", name.as_str()))
            })
            .collect();
        header_lines.sort();
        lines.extend(header_lines);

        let body = req
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        if !body.is_empty() {
            lines.push(format!("body: {}", String::from_utf8_lossy(&body)));
        }

        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(lines.join("\n"))))
            .expect("test response must build")
    })
    .await
}

async fn serve_with<F, Fut>(handler: F) -> (SocketAddr, oneshot::Sender<()>)
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send,
{
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let handler = handler.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(handler(req).await)
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}
