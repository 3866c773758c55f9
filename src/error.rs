//! Error types, HTTP status mapping, and the JSON error envelope.
//!
//! Every non-success response produced by the service itself (as opposed
//! to responses relayed from a backend) goes through [`Error::into_response`],
//! which renders the uniform envelope `{"error": "<message>"}` with
//! `Content-Type: application/json; charset=utf-8` and
//! `X-Content-Type-Options: nosniff`.

use std::fmt;

use hyper::{Response, StatusCode};

use crate::proxy::{BoxBody, full};

/// Every failure the service can produce.
#[derive(Debug)]
pub enum Error {
    /// The configuration file could not be loaded, parsed, or validated.
    Config(String),
    /// A configured backend URL is malformed.
    InvalidBackend(String),
    /// No backend was alive at selection time.
    NoAliveBackend,
    /// Forwarding to the chosen backend failed at the transport level.
    Upstream(String),
    /// The client exhausted its token bucket.
    RateLimited,
    /// The rate-limit datastore failed to decide.
    Storage(String),
    /// The control plane was called with a method other than POST.
    MethodNotAllowed,
    /// The control-plane body did not parse as the expected schema.
    InvalidBody,
    /// The control-plane body carried an empty `userIP`.
    MissingUserIp,
    /// The control-plane body carried a non-positive rate or burst.
    NonPositiveLimit,
    /// An internal fault that does not fit other categories.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidBackend(msg) => write!(f, "invalid backend: {msg}"),
            Self::NoAliveBackend => write!(f, "no alive backend available"),
            Self::Upstream(msg) => write!(f, "backend request failed: {msg}"),
            Self::RateLimited => write!(f, "rate limit exceeded"),
            Self::Storage(msg) => write!(f, "datastore error: {msg}"),
            Self::MethodNotAllowed => write!(f, "method not allowed"),
            Self::InvalidBody => write!(f, "invalid request format"),
            Self::MissingUserIp => write!(f, "userIP is required"),
            Self::NonPositiveLimit => write!(f, "rate and burst must be positive"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidBackend(_) | Self::Storage(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NoAliveBackend | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidBody | Self::MissingUserIp | Self::NonPositiveLimit => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    /// The client-facing message carried in the JSON envelope. Deliberately
    /// coarser than [`Display`](fmt::Display), which is meant for logs.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidBackend(_) | Self::Storage(_) | Self::Internal(_) => {
                "Internal Server Error"
            }
            Self::NoAliveBackend | Self::Upstream(_) => "Service is unavailable",
            Self::RateLimited => "Rate limit exceeded",
            Self::MethodNotAllowed => "Only POST method is allowed",
            Self::InvalidBody => "Invalid request format",
            Self::MissingUserIp => "userIP is required",
            Self::NonPositiveLimit => "newRate and newBurst must be positive integers",
        }
    }

    /// Converts this error into an HTTP response carrying the JSON envelope.
    pub fn into_response(self) -> Response<BoxBody> {
        let body = serde_json::json!({ "error": self.message() });

        Response::builder()
            .status(self.status_code())
            .header("content-type", "application/json; charset=utf-8")
            .header("x-content-type-options", "nosniff")
            .body(full(body.to_string()))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(full(""))
                    .expect("building fallback response must not fail")
            })
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<hyper::http::Error> for Error {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
