use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for upstream dialing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyClientError {
    /// The backend could not be contacted: dial, TLS or initial send failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The request deadline fired before response headers were observed.
    #[error("deadline exceeded after {0:?}")]
    Deadline(Duration),

    /// The request could not be constructed or is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for upstream dialing.
pub type ProxyClientResult<T> = Result<T, ProxyClientError>;

/// ProxyClient defines the port (interface) for dialing backends.
///
/// The adapter owns the connection pool; errors after response headers are
/// observed stream through the response body and are not reported here.
#[async_trait]
pub trait ProxyClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend, bounded by `deadline`.
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        deadline: Duration,
    ) -> ProxyClientResult<Response<AxumBody>>;
}
