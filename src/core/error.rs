//! Gateway error taxonomy.
//!
//! Every failure surfaced by the request pipeline carries a machine-readable
//! kind and maps to a fixed HTTP status. Configuration and supervision
//! failures never reach the pipeline; they abort startup or surface through
//! the fatal channel.
use std::time::Duration;

use thiserror::Error;

use crate::core::upstream::{BackendId, UpstreamError, UpstreamId};

/// Errors surfaced by the gateway control plane and request pipeline.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum GatewayError {
    /// No upstream matched the request's host or path.
    #[error("no upstream matched the request")]
    UpstreamNotFound,

    /// The upstream id is not known to the component that was asked.
    #[error("unknown upstream: {0}")]
    UpstreamUnknown(UpstreamId),

    /// The backend id is not known to the publisher.
    #[error("unknown backend: {0}")]
    BackendUnknown(BackendId),

    /// The upstream is known but its backend pool is empty.
    #[error("no backends available for upstream {0}")]
    NoBackendsAvailable(UpstreamId),

    /// A modifier plugin failed while rewriting the request or response.
    #[error("modifier failed: {0}")]
    ModifierFailed(String),

    /// The backend could not be contacted at all (dial, TLS or initial send).
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The proxy deadline fired before response headers were observed.
    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// The server is draining; new requests are rejected.
    #[error("server is shutting down")]
    Draining,

    /// A discovery plugin supplied an invalid upstream or backend definition.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// Plugin supervision gave up on a role (two failed restarts in a minute).
    #[error("plugin supervision failure: {0}")]
    Supervision(String),

    /// Invariant violation. Logged and coerced to 500, never sent to plugins.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::UpstreamNotFound => "upstream_not_found",
            GatewayError::UpstreamUnknown(_) => "upstream_unknown",
            GatewayError::BackendUnknown(_) => "backend_unknown",
            GatewayError::NoBackendsAvailable(_) => "no_backends_available",
            GatewayError::ModifierFailed(_) => "modifier_failed",
            GatewayError::UpstreamUnreachable(_) => "upstream_unreachable",
            GatewayError::UpstreamTimeout(_) => "upstream_timeout",
            GatewayError::Draining => "draining",
            GatewayError::InvalidDefinition(_) => "invalid_definition",
            GatewayError::Supervision(_) => "supervision",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// HTTP status written to the client when this error ends a request.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::UpstreamNotFound => 400,
            GatewayError::UpstreamUnknown(_)
            | GatewayError::BackendUnknown(_)
            | GatewayError::NoBackendsAvailable(_) => 502,
            GatewayError::UpstreamTimeout(_) => 502,
            GatewayError::UpstreamUnreachable(_) => 504,
            GatewayError::Draining => 503,
            GatewayError::ModifierFailed(_)
            | GatewayError::InvalidDefinition(_)
            | GatewayError::Supervision(_)
            | GatewayError::Internal(_) => 500,
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        GatewayError::InvalidDefinition(err.to_string())
    }
}
