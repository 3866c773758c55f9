//! Request routing, the control plane, the accept loop, and shutdown
//! signalling.
//!
//! Every connection is served on its own task, registered on a
//! [`TaskTracker`] so the supervisor can drain in-flight work under a
//! deadline at shutdown. The per-request pipeline is: route (`/edit`
//! goes to the control plane), rate-limiter gate, balancer pick,
//! proxy hop. Errors are translated to the JSON envelope at the
//! service boundary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, warn};

use crate::balancer::Balancer;
use crate::proxy::{self, BoxBody, HttpClient, full};
use crate::rate_limit::{RateLimiter, client_id};
use crate::{Error, Result};

/// Monotonic request-id counter feeding the per-request tracing span.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by every request task.
pub struct AppState {
    pub client: HttpClient,
    pub balancer: Balancer,
    pub limiter: RateLimiter,
}

/// Body schema of the control-plane endpoint.
#[derive(Debug, Deserialize)]
struct EditRequest {
    #[serde(rename = "userIP")]
    user_ip: String,
    #[serde(rename = "newRate")]
    new_rate: i64,
    #[serde(rename = "newBurst")]
    new_burst: i64,
}

/// Processes one inbound request: control plane, or gate then proxy.
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
    );

    async move {
        // The control plane is not subject to the gate: raising a
        // client's limit must work even while that client's bucket is
        // exhausted.
        if req.uri().path() == "/edit" {
            return handle_edit(req, &state.limiter).await;
        }

        let identifier = client_id(&client_addr);
        let decision = state.limiter.check(&identifier).await?;
        if !decision.is_allowed() {
            return Err(Error::RateLimited);
        }

        let backend = state.balancer.next().ok_or_else(|| {
            error!("no backend available");
            Error::NoAliveBackend
        })?;

        proxy::forward(req, &state.client, &backend, client_addr).await
    }
    .instrument(span)
    .await
}

/// The `/edit` control plane: validates the JSON body and updates the
/// per-identifier override table.
async fn handle_edit<B>(req: Request<B>, limiter: &RateLimiter) -> Result<Response<BoxBody>>
where
    B: Body<Data = Bytes>,
{
    if req.method() != Method::POST {
        return Err(Error::MethodNotAllowed);
    }

    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|_| Error::InvalidBody)?
        .to_bytes();

    let edit: EditRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "failed to decode edit request");
        Error::InvalidBody
    })?;

    if edit.user_ip.is_empty() {
        return Err(Error::MissingUserIp);
    }
    if edit.new_rate <= 0 || edit.new_burst <= 0 {
        return Err(Error::NonPositiveLimit);
    }

    limiter.set_user_limit(&edit.user_ip, edit.new_rate, edit.new_burst)?;
    info!(
        user_ip = %edit.user_ip,
        rate = edit.new_rate,
        burst = edit.new_burst,
        "rate limit updated"
    );

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full(format!(
            "Rate limit updated for {}: {}/s (burst {})",
            edit.user_ip, edit.new_rate, edit.new_burst
        )))
        .map_err(Error::from)
}

/// Accepts connections until `shutdown` is cancelled, spawning one task
/// per connection on `tracker`.
///
/// Cancellation also nudges in-flight connections into HTTP/1 graceful
/// shutdown, so keep-alive clients do not hold the drain open.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                let shutdown = shutdown.clone();

                tracker.spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        async move {
                            let resp = handle_request(req, state, client_addr)
                                .await
                                .unwrap_or_else(Error::into_response);
                            Ok::<_, std::convert::Infallible>(resp)
                        }
                    });

                    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
                    tokio::pin!(conn);

                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(e) = result {
                                warn!(%e, "connection error");
                            }
                        }
                        () = shutdown.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            if let Err(e) = conn.as_mut().await {
                                warn!(%e, "connection error during shutdown");
                            }
                        }
                    }
                });
            }
            () = shutdown.cancelled() => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
