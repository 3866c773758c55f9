//! Per-client rate limiting backed by an external datastore.
//!
//! The gate keeps no token-bucket state of its own: every admission
//! decision is one atomic `allow` call against the datastore, keyed by
//! the client identifier (the peer IP with the port stripped). The only
//! local state is the per-identifier override table, a small read-mostly
//! map guarded by a multiple-reader/single-writer lock that is never
//! held across the datastore round-trip.
//!
//! [`LimitStore`] abstracts the datastore so the gate depends only on
//! "atomic allow-one plus reset". [`RedisStore`] is the production
//! implementation: a Lua token-bucket script evaluated server-side, so
//! refill and take are a single linearizable operation per key.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tracing::{debug, error, warn};

use crate::{Error, Result};

/// I/O deadline applied to every datastore operation.
const STORE_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Atomic token bucket, evaluated entirely inside the datastore.
///
/// State is one hash per identifier holding the token count, the last
/// refill timestamp, and the limit that produced them. A limit change
/// re-primes the bucket at the new burst so stale accounting under an
/// old policy cannot starve the new one. The key expires once the
/// bucket would be full again, so idle clients cost nothing.
const TOKEN_BUCKET_SCRIPT: &str = r#"
redis.replicate_commands()

local key = KEYS[1]
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local refill_per_sec = rate / period

local state = redis.call('HMGET', key, 'tokens', 'ts', 'rate', 'burst')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])

if tokens == nil or tonumber(state[3]) ~= rate or tonumber(state[4]) ~= burst then
  tokens = burst
  ts = now
end

local elapsed = now - ts
if elapsed < 0 then
  elapsed = 0
end
tokens = math.min(burst, tokens + elapsed * refill_per_sec)

local allowed = 0
if tokens >= cost then
  allowed = cost
  tokens = tokens - cost
end

local reset_after = (burst - tokens) / refill_per_sec

redis.call('HSET', key, 'tokens', tokens, 'ts', now, 'rate', rate, 'burst', burst)
redis.call('PEXPIRE', key, math.ceil(reset_after * 1000) + 1000)

return { allowed, math.floor(tokens), math.ceil(reset_after * 1000) }
"#;

/// A token-bucket limit: `rate` tokens per `period`, capacity `burst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub rate: u32,
    pub burst: u32,
    pub period: Duration,
}

impl Limit {
    /// A per-second limit. Rejects non-positive rate or burst; this is
    /// the only way to construct a `Limit`, so the positivity invariant
    /// holds everywhere one is used.
    pub fn per_second(rate: i64, burst: i64) -> Result<Self> {
        if rate <= 0 || burst <= 0 {
            return Err(Error::NonPositiveLimit);
        }
        Ok(Self {
            rate: rate as u32,
            burst: burst as u32,
            period: Duration::from_secs(1),
        })
    }
}

/// The outcome of one `allow` call.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    /// Number of tokens granted: 1 when admitted, 0 when denied.
    pub allowed: u64,
    /// Tokens left in the bucket after this call.
    pub remaining: u64,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.allowed >= 1
    }
}

/// The datastore operations the gate requires: a linearizable
/// take-one-token per key, and a key reset.
#[async_trait]
pub trait LimitStore: Send + Sync {
    /// Atomically attempts to take one token from `key`'s bucket under
    /// the given limit.
    async fn allow(&self, key: &str, limit: Limit) -> Result<Decision>;

    /// Discards `key`'s bucket state. Idempotent.
    async fn reset(&self, key: &str) -> Result<()>;
}

/// Redis-backed [`LimitStore`] over a pooled multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    script: Arc<Script>,
}

impl RedisStore {
    /// Opens the connection and verifies it with a `PING`. Intended for
    /// startup: an unreachable datastore here is fatal to the process.
    pub async fn connect(cfg: &crate::config::RedisConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.url())?;
        let manager_cfg = ConnectionManagerConfig::new()
            .set_connection_timeout(STORE_IO_TIMEOUT)
            .set_response_timeout(STORE_IO_TIMEOUT);

        let mut conn = ConnectionManager::new_with_config(client, manager_cfg).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            conn,
            script: Arc::new(Script::new(TOKEN_BUCKET_SCRIPT)),
        })
    }
}

fn bucket_key(identifier: &str) -> String {
    format!("ratelimit:{identifier}")
}

#[async_trait]
impl LimitStore for RedisStore {
    async fn allow(&self, key: &str, limit: Limit) -> Result<Decision> {
        let mut conn = self.conn.clone();
        let (allowed, remaining, reset_ms): (u64, u64, u64) = self
            .script
            .key(bucket_key(key))
            .arg(limit.rate)
            .arg(limit.burst)
            .arg(limit.period.as_secs_f64())
            .arg(1u32)
            .invoke_async(&mut conn)
            .await?;

        Ok(Decision {
            allowed,
            remaining,
            reset_after: Duration::from_millis(reset_ms),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(bucket_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// The rate-limiter gate: default limit, per-identifier overrides, and
/// the datastore that holds the buckets.
///
/// Shared across all request tasks via `Arc`.
pub struct RateLimiter {
    store: Arc<dyn LimitStore>,
    default_limit: Limit,
    overrides: RwLock<HashMap<String, Limit>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn LimitStore>, default_limit: Limit) -> Self {
        Self {
            store,
            default_limit,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves the limit for an identifier: its override if present,
    /// the process default otherwise. Takes the read lock only long
    /// enough to copy the limit out.
    pub fn limit_for(&self, identifier: &str) -> Limit {
        self.overrides
            .read()
            .expect("override table lock poisoned")
            .get(identifier)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// One admission decision for `identifier`.
    ///
    /// On a datastore failure the identifier's bucket is reset
    /// best-effort (a poisoned key must not deny a client forever) and
    /// the error propagates: the request is denied, never forwarded on
    /// an undecided limit.
    pub async fn check(&self, identifier: &str) -> Result<Decision> {
        let limit = self.limit_for(identifier);

        match self.store.allow(identifier, limit).await {
            Ok(decision) => {
                if decision.is_allowed() {
                    debug!(
                        identifier,
                        remaining = decision.remaining,
                        reset_ms = decision.reset_after.as_millis() as u64,
                        "rate limit status"
                    );
                } else {
                    warn!(identifier, burst = limit.burst, "rate limit exceeded");
                }
                Ok(decision)
            }
            Err(e) => {
                error!(identifier, error = %e, "rate limit check failed");
                if let Err(reset_err) = self.store.reset(identifier).await {
                    error!(identifier, error = %reset_err, "failed to reset bucket after store error");
                }
                Err(e)
            }
        }
    }

    /// Sets a per-identifier override. Validates positivity before
    /// touching the table; an invalid pair leaves state unchanged.
    /// Repeated calls with the same arguments are indistinguishable
    /// from a single call.
    pub fn set_user_limit(&self, identifier: &str, rate: i64, burst: i64) -> Result<()> {
        let limit = Limit::per_second(rate, burst)?;
        self.overrides
            .write()
            .expect("override table lock poisoned")
            .insert(identifier.to_string(), limit);
        Ok(())
    }
}

/// Client identifier for rate limiting: the peer IP with the port
/// stripped.
pub fn client_id(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}
