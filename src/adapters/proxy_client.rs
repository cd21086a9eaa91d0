use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{header::HeaderValue, Request, Response, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::proxy_client::{ProxyClient, ProxyClientError, ProxyClientResult};

/// Idle pooled connections are closed after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Upper bound on idle connections kept per backend host.
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Pooled upstream dialer using Hyper with Rustls.
///
/// Responsibilities:
/// * Keeps one reusable transport with per-host idle pooling
/// * Applies the connect timeout at the socket level and the per-request
///   deadline around the whole exchange up to response headers
/// * Forces HTTP/1.1 on the wire (the data plane speaks nothing else)
///
/// This adapter is intentionally minimal; retries are the business of
/// clients and upstream plugins, never of the gateway.
pub struct PooledProxyClient {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl PooledProxyClient {
    /// Create a new pooled dialer. `dial_timeout` bounds TCP connect.
    pub fn new(dial_timeout: Duration) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(dial_timeout));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("failed to add native certificate to rustls RootCertStore");
                }
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build::<_, AxumBody>(https_connector);

        tracing::info!("created upstream HTTP client (HTTP/1.1, pooled)");
        Ok(Self { client })
    }
}

#[async_trait]
impl ProxyClient for PooledProxyClient {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
        deadline: Duration,
    ) -> ProxyClientResult<Response<AxumBody>> {
        // The Host header must name the backend, not the original authority.
        let host_value = match req.uri().host() {
            Some(host) => {
                let rendered = match req.uri().port() {
                    Some(port) => format!("{host}:{}", port.as_u16()),
                    None => host.to_string(),
                };
                HeaderValue::from_str(&rendered)
                    .map_err(|e| ProxyClientError::InvalidRequest(e.to_string()))?
            }
            None => {
                return Err(ProxyClientError::InvalidRequest(
                    "outgoing URI has no host".to_string(),
                ));
            }
        };
        req.headers_mut().insert(hyper::header::HOST, host_value);

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let outgoing = Request::from_parts(parts, body);

        match timeout(deadline, self.client.request(outgoing)).await {
            Ok(Ok(response)) => {
                let (parts, hyper_body) = response.into_parts();
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Ok(Err(err)) => Err(ProxyClientError::Connection(err.to_string())),
            Err(_) => Err(ProxyClientError::Deadline(deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_creation() {
        assert!(PooledProxyClient::new(Duration::from_secs(2)).is_ok());
    }

    #[tokio::test]
    async fn uri_without_host_is_rejected() {
        let client = PooledProxyClient::new(Duration::from_secs(2)).unwrap();
        let req = Request::builder()
            .uri("/relative")
            .body(AxumBody::empty())
            .unwrap();
        let err = client
            .send_request(req, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_connection_error() {
        let client = PooledProxyClient::new(Duration::from_millis(500)).unwrap();
        // TEST-NET-1 is never routable.
        let req = Request::builder()
            .uri("http://192.0.2.1:9/")
            .body(AxumBody::empty())
            .unwrap();
        let err = client
            .send_request(req, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyClientError::Connection(_) | ProxyClientError::Deadline(_)
        ));
    }
}
