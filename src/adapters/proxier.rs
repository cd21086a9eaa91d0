//! Proxies one request to a selected backend.
//!
//! Builds the upstream URL from the backend address and the rewritten
//! request path, forwards headers minus the hop-by-hop set (RFC 7230 §6.1),
//! injects `X-Forwarded-*`, and streams both bodies. Errors are returned
//! only when the backend could not be contacted at all; anything after
//! response headers surfaces as the response status.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::body::Body as AxumBody;
use hyper::{
    header::{HeaderName, HeaderValue},
    HeaderMap, Method, Request, Response,
};

use crate::{
    core::{
        error::GatewayError,
        metrics::RequestMetric,
        request::GatewayRequest,
        upstream::{Backend, Upstream},
    },
    ports::proxy_client::{ProxyClient, ProxyClientError},
};

/// Headers that must not be forwarded between proxies.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Owns the upstream transport and performs the per-request exchange.
pub struct Proxier {
    client: Arc<dyn ProxyClient>,
    default_proxy_timeout: Duration,
}

impl Proxier {
    pub fn new(client: Arc<dyn ProxyClient>, default_proxy_timeout: Duration) -> Self {
        Self {
            client,
            default_proxy_timeout,
        }
    }

    /// Forward the request to `backend`, streaming `body` upstream and the
    /// backend's body back. `metric` receives the response status; the
    /// caller finalizes proxy latency when the response body completes.
    #[allow(clippy::too_many_arguments)]
    pub async fn proxy(
        &self,
        gw_req: &GatewayRequest,
        body: AxumBody,
        query: Option<&str>,
        client_addr: Option<SocketAddr>,
        upstream: &Upstream,
        backend: &Backend,
        metric: &mut RequestMetric,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let uri = match query {
            Some(query) => format!("{}{}?{}", backend.address.as_str(), gw_req.path, query),
            None => format!("{}{}", backend.address.as_str(), gw_req.path),
        };

        let method = Method::from_bytes(gw_req.method.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("invalid method: {e}")))?;

        let mut builder = Request::builder().method(method).uri(&uri);
        let Some(headers) = builder.headers_mut() else {
            return Err(GatewayError::Internal(format!(
                "invalid upstream URI: {uri}"
            )));
        };
        copy_request_headers(headers, gw_req, client_addr);

        let request = builder.body(body).map_err(|e| {
            GatewayError::Internal(format!("failed to build upstream request: {e}"))
        })?;

        let deadline = upstream
            .timeouts
            .proxy()
            .unwrap_or(self.default_proxy_timeout);
        let response = self
            .client
            .send_request(request, deadline)
            .await
            .map_err(|err| match err {
                ProxyClientError::Connection(msg) => GatewayError::UpstreamUnreachable(msg),
                ProxyClientError::Deadline(d) => GatewayError::UpstreamTimeout(d),
                ProxyClientError::InvalidRequest(msg) => GatewayError::Internal(msg),
            })?;

        metric.set_status(response.status().as_u16());

        let (mut parts, body) = response.into_parts();
        let hop: Vec<HeaderName> = parts
            .headers
            .keys()
            .filter(|name| is_hop_by_hop(name.as_str()))
            .cloned()
            .collect();
        for name in hop {
            parts.headers.remove(&name);
        }

        Ok(Response::from_parts(parts, body))
    }
}

/// Copy descriptor headers minus the hop-by-hop set and append the
/// `X-Forwarded-*` triple.
fn copy_request_headers(
    headers: &mut HeaderMap,
    gw_req: &GatewayRequest,
    client_addr: Option<SocketAddr>,
) {
    for (name, value) in &gw_req.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::debug!(header = %name, "dropping unrepresentable header");
            continue;
        };
        headers.insert(name, value);
    }

    if let Some(addr) = client_addr {
        let forwarded_for = match gw_req.headers.iter().find_map(|(name, value)| {
            name.eq_ignore_ascii_case("x-forwarded-for")
                .then_some(value)
        }) {
            Some(existing) => format!("{existing}, {}", addr.ip()),
            None => addr.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static(if gw_req.protocol.is_secure() {
            "https"
        } else {
            "http"
        }),
    );
    if let Ok(value) = HeaderValue::from_str(&gw_req.host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::Protocol;

    #[test]
    fn hop_by_hop_set_matches_rfc7230() {
        for name in ["Connection", "KEEP-ALIVE", "Transfer-Encoding", "upgrade"] {
            assert!(is_hop_by_hop(name));
        }
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-request-id"));
    }

    #[test]
    fn request_headers_are_filtered_and_forwarded() {
        let mut gw_req = GatewayRequest::new("GET", "api.test", "/x", Protocol::HttpPublic);
        gw_req
            .headers
            .insert("connection".into(), "keep-alive".into());
        gw_req.headers.insert("accept".into(), "text/plain".into());
        gw_req.headers.insert("host".into(), "api.test".into());

        let mut headers = HeaderMap::new();
        let addr: SocketAddr = "10.0.0.7:55555".parse().unwrap();
        copy_request_headers(&mut headers, &gw_req, Some(addr));

        assert!(headers.get("connection").is_none());
        assert!(headers.get("host").is_none());
        assert_eq!(headers.get("accept").unwrap(), "text/plain");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.7");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "api.test");
    }

    #[test]
    fn forwarded_for_chains_existing_entries() {
        let mut gw_req = GatewayRequest::new("GET", "api.test", "/x", Protocol::HttpsPublic);
        gw_req
            .headers
            .insert("x-forwarded-for".into(), "203.0.113.9".into());

        let mut headers = HeaderMap::new();
        let addr: SocketAddr = "10.0.0.7:55555".parse().unwrap();
        copy_request_headers(&mut headers, &gw_req, Some(addr));

        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "203.0.113.9, 10.0.0.7"
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }
}
