//! Backend origins and the shared pool with atomic liveness flags.
//!
//! A [`Backend`] pairs an immutable absolute URL with a single atomic
//! liveness bit. The health prober is the only writer of that bit; every
//! balancing decision reads it. The pool's order is fixed at startup and
//! significant to round-robin fairness; it is never resized at runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Error, Result};

/// One backend origin: a parsed absolute URL plus its liveness flag.
///
/// Cheap to clone; all clones share the same flag.
#[derive(Debug, Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    url: hyper::Uri,
    alive: AtomicBool,
}

impl Backend {
    fn new(url: hyper::Uri) -> Self {
        Self {
            inner: Arc::new(Inner {
                url,
                alive: AtomicBool::new(true),
            }),
        }
    }

    /// The backend's base URL. Immutable for the process lifetime.
    pub fn url(&self) -> &hyper::Uri {
        &self.inner.url
    }

    /// Atomically sets the liveness flag.
    pub fn set_alive(&self, alive: bool) {
        self.inner.alive.store(alive, Ordering::Release);
    }

    /// Atomically reads the liveness flag.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }
}

/// The ordered, fixed-size set of backends shared between the balancer
/// (reader) and the health prober (writer of liveness flags).
#[derive(Debug, Clone)]
pub struct BackendPool {
    backends: Arc<Vec<Backend>>,
}

impl BackendPool {
    /// Builds a pool from configured backend URLs, preserving order.
    /// All backends start alive.
    ///
    /// Each URL must parse as an absolute URI with a scheme and authority.
    pub fn from_urls(urls: &[String]) -> Result<Self> {
        let backends = urls
            .iter()
            .map(|raw| {
                let url = raw
                    .parse::<hyper::Uri>()
                    .map_err(|e| Error::InvalidBackend(format!("{raw}: {e}")))?;
                if url.scheme().is_none() || url.authority().is_none() {
                    return Err(Error::InvalidBackend(format!(
                        "{raw}: URL must be absolute with scheme and host"
                    )));
                }
                Ok(Backend::new(url))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            backends: Arc::new(backends),
        })
    }

    /// All backends in configuration order, regardless of liveness.
    pub fn all(&self) -> &[Backend] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
