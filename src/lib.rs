//! An HTTP reverse-proxy load balancer built on [hyper] and [tokio].
//!
//! Incoming requests pass a per-client rate-limiter gate backed by a
//! Redis token bucket, then a pluggable balancer (round-robin or
//! random) picks one alive backend and the request is forwarded with a
//! transparent proxy hop. A background prober keeps the pool's
//! liveness flags current, a `/edit` control plane adjusts per-client
//! limits at runtime, and shutdown drains in-flight work under a
//! bounded deadline. Observability via [tracing]: every request runs
//! inside a span carrying a monotonic id, method, URI, and client
//! address.
//!
//! [hyper]: https://hyper.rs/
//! [tokio]: https://tokio.rs/
//! [tracing]: https://docs.rs/tracing

pub mod backend;
pub mod balancer;
pub mod config;
pub mod error;
pub mod headers;
pub mod health;
pub mod proxy;
pub mod rate_limit;
pub mod server;

pub use backend::{Backend, BackendPool};
pub use balancer::Balancer;
pub use config::Config;
pub use error::Error;
pub use health::HealthChecker;
pub use proxy::{BoxBody, HttpClient, build_client, full};
pub use rate_limit::{Decision, Limit, LimitStore, RateLimiter, RedisStore, client_id};
pub use server::{AppState, handle_request, serve, shutdown_signal};

pub type Result<T> = std::result::Result<T, Error>;
