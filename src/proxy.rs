//! Transparent request forwarding to one chosen backend.
//!
//! [`forward`] performs a single proxy hop: the request URI is rewritten
//! onto the backend (preserving path and query, and honouring a path
//! prefix on the backend URL), hop-by-hop headers are stripped,
//! forwarding headers injected, `Host` rewritten, and both bodies are
//! streamed without buffering. There is no per-request failover: a
//! transport error surfaces as a bad-gateway error and liveness is left
//! to the prober.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::combinators;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::{Error, Result, headers};

/// Unified response body type: streamed backend bodies and in-memory
/// error/control-plane bodies boxed behind one erased error.
pub type BoxBody = combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// The client used for backend connections, shared by all request tasks.
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// Builds the shared backend-facing HTTP client.
pub fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Wraps an in-memory payload as a [`BoxBody`].
pub fn full(body: impl Into<Bytes>) -> BoxBody {
    Full::new(body.into())
        .map_err(|never| -> Box<dyn std::error::Error + Send + Sync> { match never {} })
        .boxed()
}

/// Boxes any compatible body (an inbound `Incoming`, a test body, a
/// backend response body) into [`BoxBody`].
pub fn boxed<B>(body: B) -> BoxBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    body.map_err(Into::into).boxed()
}

/// Forwards `req` to `backend` and streams the response back.
pub async fn forward<B>(
    req: Request<B>,
    client: &HttpClient,
    backend: &Backend,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let target = rewrite_uri(req.uri(), backend.url())?;
    let (mut parts, body) = req.into_parts();

    headers::strip_hop_by_hop(&mut parts.headers);
    headers::inject_forwarding_headers(&mut parts.headers, client_addr.ip());
    headers::rewrite_host(
        &mut parts.headers,
        backend
            .url()
            .authority()
            .ok_or_else(|| Error::InvalidBackend("backend URL has no authority".into()))?,
    );
    parts.uri = target;

    let start = Instant::now();
    let proxy_req = Request::from_parts(parts, boxed(body));

    let mut resp = match client.request(proxy_req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(
                backend = %backend.url(),
                error = %e,
                latency_ms = start.elapsed().as_millis() as u64,
                "backend request failed"
            );
            return Err(Error::from(e));
        }
    };

    info!(
        backend = %backend.url(),
        status = resp.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "request proxied"
    );

    headers::strip_hop_by_hop(resp.headers_mut());
    Ok(resp.map(boxed))
}

/// Rewrites the client-facing URI onto the backend, keeping the original
/// path and query and prepending any path prefix carried by the backend
/// URL.
fn rewrite_uri(original: &Uri, backend: &Uri) -> Result<Uri> {
    let scheme = backend
        .scheme()
        .ok_or_else(|| Error::InvalidBackend("backend URL has no scheme".into()))?;
    let authority = backend
        .authority()
        .ok_or_else(|| Error::InvalidBackend("backend URL has no authority".into()))?;

    let original_pq = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let prefix = backend.path().trim_end_matches('/');
    let path_and_query = if prefix.is_empty() {
        original_pq.to_owned()
    } else {
        format!("{prefix}{original_pq}")
    };

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| Error::Internal(format!("failed to build backend URI: {e}")))
}
