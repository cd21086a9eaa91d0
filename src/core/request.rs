//! Request and response descriptors exchanged with plugins.
//!
//! The pipeline never ships request or response bodies to plugins. Plugins
//! see a metadata descriptor they may rewrite; early responses and error
//! responses carry small textual bodies.
use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::core::error::GatewayError;

/// The listener a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    HttpPublic,
    HttpInternal,
    HttpsPublic,
    HttpsInternal,
}

impl Protocol {
    pub fn is_secure(&self) -> bool {
        matches!(self, Protocol::HttpsPublic | Protocol::HttpsInternal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::HttpPublic => "http-public",
            Protocol::HttpInternal => "http-internal",
            Protocol::HttpsPublic => "https-public",
            Protocol::HttpsInternal => "https-internal",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-public" => Ok(Protocol::HttpPublic),
            "http-internal" => Ok(Protocol::HttpInternal),
            "https-public" => Ok(Protocol::HttpsPublic),
            "https-internal" => Ok(Protocol::HttpsInternal),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Metadata view of an in-flight request, shared with modifier plugins and
/// recorded into metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub method: String,
    /// Request host, lowercased and without port.
    pub host: String,
    /// Path forwarded to the backend. Rewritten in place on a prefix match
    /// and by modifier plugins.
    pub path: String,
    /// The matched routing prefix, when the match was by prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    pub protocol: Protocol,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl GatewayRequest {
    pub fn new(method: &str, host: &str, path: &str, protocol: Protocol) -> Self {
        let host = host
            .split(':')
            .next()
            .unwrap_or(host)
            .to_ascii_lowercase();
        Self {
            method: method.to_string(),
            host,
            path: path.to_string(),
            prefix: None,
            protocol,
            headers: BTreeMap::new(),
        }
    }
}

/// A response materialized by the gateway itself: early responses from
/// modifier plugins and error responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl GatewayResponse {
    /// The canonical error response for a pipeline failure, before error
    /// modifiers run.
    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            status: err.status(),
            headers: BTreeMap::new(),
            body: err.to_string(),
        }
    }
}
