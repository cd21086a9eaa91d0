//! Upstream and backend identity types.
//!
//! An [`Upstream`] is a logical routing target identified by a set of
//! hostnames and/or path prefixes. A [`Backend`] is a concrete network
//! endpoint belonging to an upstream. Both are immutable once published:
//! discovery plugins change an upstream by removing and re-adding it.
use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while validating upstream / backend definitions.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// An upstream must carry at least one hostname or one path prefix.
    #[error("upstream '{0}' has no hostnames and no prefixes")]
    NoMatchCriteria(String),

    /// Prefixes must start with `/` and must not end with `/`.
    #[error("invalid prefix '{0}': prefixes start with '/' and carry no trailing '/'")]
    InvalidPrefix(String),

    /// Error when a backend URL is not an absolute http(s) URL.
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

id_type! {
    /// Stable, globally unique identifier of an [`Upstream`].
    UpstreamId
}

id_type! {
    /// Stable, globally unique identifier of a [`Backend`].
    BackendId
}

/// Per-upstream timeout overrides. Absent fields fall back to the gateway
/// defaults from configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamTimeouts {
    /// Overall proxy deadline, in milliseconds.
    pub proxy_ms: Option<u64>,
    /// TCP connect deadline, in milliseconds.
    pub dial_ms: Option<u64>,
    /// DNS resolution deadline, in milliseconds.
    pub dns_ms: Option<u64>,
}

impl UpstreamTimeouts {
    pub fn proxy(&self) -> Option<Duration> {
        self.proxy_ms.map(Duration::from_millis)
    }

    pub fn dial(&self) -> Option<Duration> {
        self.dial_ms.map(Duration::from_millis)
    }

    pub fn dns(&self) -> Option<Duration> {
        self.dns_ms.map(Duration::from_millis)
    }
}

/// A logical routing target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub id: UpstreamId,
    pub name: String,
    /// Hostnames matched exactly, case-insensitively.
    pub hostnames: Vec<String>,
    /// Path prefixes matched on full path components, longest first.
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub timeouts: UpstreamTimeouts,
}

impl Upstream {
    /// Whether this upstream lists `hostname` (case-insensitive).
    pub fn has_hostname(&self, hostname: &str) -> bool {
        self.hostnames
            .iter()
            .any(|h| h.eq_ignore_ascii_case(hostname))
    }

    /// Whether this upstream lists exactly `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.prefixes.iter().any(|p| p == prefix)
    }
}

/// An upstream definition as supplied by a discovery plugin. The id is
/// optional: the publisher mints one when the plugin provides none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSpec {
    #[serde(default)]
    pub id: Option<UpstreamId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub timeouts: UpstreamTimeouts,
}

impl UpstreamSpec {
    /// Validate the definition and turn it into an [`Upstream`], minting an
    /// id when the plugin did not supply one.
    pub fn into_upstream(self) -> Result<Upstream, UpstreamError> {
        if self.hostnames.is_empty() && self.prefixes.is_empty() {
            return Err(UpstreamError::NoMatchCriteria(self.name));
        }

        for prefix in &self.prefixes {
            if !prefix.starts_with('/') || (prefix.len() > 1 && prefix.ends_with('/')) {
                return Err(UpstreamError::InvalidPrefix(prefix.clone()));
            }
        }

        Ok(Upstream {
            id: self.id.unwrap_or_default(),
            name: self.name,
            hostnames: self
                .hostnames
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            prefixes: self.prefixes,
            timeouts: self.timeouts,
        })
    }
}

/// A type-safe representation of a backend URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendUrl {
    url: String,
}

impl BackendUrl {
    /// Creates a new `BackendUrl` if the provided string is an absolute
    /// http(s) URL.
    pub fn new(url: &str) -> Result<Self, UpstreamError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(UpstreamError::InvalidUrl(format!(
                "backend URL must start with http:// or https://, got: {url}"
            )));
        }

        Ok(BackendUrl {
            url: url.trim_end_matches('/').to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Check if the URL is using HTTPS.
    pub fn is_secure(&self) -> bool {
        self.url.starts_with("https://")
    }
}

impl FromStr for BackendUrl {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

fn default_weight() -> u32 {
    1
}

/// A concrete network endpoint belonging to an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: BackendId,
    pub upstream_id: UpstreamId,
    pub address: BackendUrl,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// A backend definition as supplied by a discovery plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    #[serde(default)]
    pub id: Option<BackendId>,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl BackendSpec {
    pub fn into_backend(self, upstream_id: UpstreamId) -> Result<Backend, UpstreamError> {
        Ok(Backend {
            id: self.id.unwrap_or_default(),
            upstream_id,
            address: BackendUrl::new(&self.address)?,
            weight: self.weight,
        })
    }
}

/// Whether `prefix` is a path-component prefix of `path`: `/api` matches
/// `/api` and `/api/x` but not `/api2/x`.
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Strip a matched prefix from a path, normalizing the empty result to `/`.
pub fn strip_prefix_path(prefix: &str, path: &str) -> String {
    if prefix == "/" {
        return path.to_string();
    }
    match path.strip_prefix(prefix) {
        Some("") | None => "/".to_string(),
        Some(rest) => rest.to_string(),
    }
}
