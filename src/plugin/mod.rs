//! Out-of-process plugin hosting.
//!
//! Plugins are sibling processes launched by path. They speak
//! newline-delimited JSON over their stdin/stdout; the gateway calls out and
//! discovery plugins call back in on the same pipe pair. Each logical role
//! exposes a narrow capability set checked at handshake time.
pub mod manager;
pub mod roles;
pub mod rpc;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use manager::{InstanceState, PluginManager};
pub use roles::{BalancerClient, MetricFanout, ModifierClient};
pub use rpc::{CallbackHandler, NoCallbacks, PluginProcess};

/// The logical role of a plugin, doubling as its capability tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginRole {
    Discovery,
    LoadBalancer,
    Router,
    Modifier,
    Metric,
}

impl PluginRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginRole::Discovery => "discovery",
            PluginRole::LoadBalancer => "load-balancer",
            PluginRole::Router => "router",
            PluginRole::Modifier => "modifier",
            PluginRole::Metric => "metric",
        }
    }
}

impl std::fmt::Display for PluginRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from plugin calls. Transport errors are retried once on a
/// different instance; application errors are propagated unretried.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PluginError {
    /// The pipe broke, the frame could not be written or read, or the
    /// subprocess died.
    #[error("plugin transport error: {0}")]
    Transport(String),

    /// The call did not complete within the plugin-call timeout.
    #[error("plugin call timed out after {0:?}")]
    Timeout(Duration),

    /// The plugin failed the handshake or announced the wrong role.
    #[error("plugin handshake failed: {0}")]
    Handshake(String),

    /// The plugin itself returned an error.
    #[error("plugin error ({kind}): {message}")]
    Application { kind: String, message: String },

    /// No live instance was available to serve the call.
    #[error("no live plugin instances")]
    Unavailable,
}

impl PluginError {
    /// Whether this failure is a transport problem (retriable on a sibling
    /// instance) rather than an application error.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PluginError::Transport(_) | PluginError::Timeout(_) | PluginError::Unavailable
        )
    }
}
