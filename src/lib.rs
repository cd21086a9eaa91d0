//! Dendrite - a pluggable HTTP(S) reverse proxy and API gateway.
//!
//! Traffic arrives on one or more listening sockets, is matched to a logical
//! upstream, balanced to a concrete backend, optionally rewritten, proxied
//! and measured. The set of known upstreams and their backends is not
//! static: out-of-process discovery plugins publish membership changes into
//! the gateway at runtime over an in-process event bus.
//!
//! # Architecture
//!
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping the control plane inside `core`:
//!
//! * [`core::bus`] - typed publish/subscribe broker gluing everything
//! * [`core::publisher`] - callback surface for discovery plugins
//! * [`core::matcher`] - hostname/prefix routing table
//! * [`core::balancer`] - per-upstream backend pools and selection
//! * [`core::modifier`] - pluggable request / error-response rewriting
//! * [`core::metrics`] - buffered metric fan-out
//! * [`plugin`] - subprocess supervision and the pipe RPC protocol
//! * [`adapters`] - HTTP listeners, the request pipeline and the proxier
//!
//! # Quick Example
//! ```no_run
//! use dendrite::{config::GatewayConfig, Gateway};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config: GatewayConfig = dendrite::config::load_config("dendrite.toml")?;
//! let gateway = Gateway::new(config)?;
//! gateway.start().await?;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Fallible APIs return `eyre::Result<T>` at the application edges and
//! domain error types ([`core::error::GatewayError`], plugin and transport
//! errors) at the seams.
//!
//! # Concurrency
//! Every component is instantiable and wired explicitly at startup, so two
//! gateways can coexist in one process. Shared tables sit behind rw-locks;
//! background workers communicate over typed channels.
#![deny(unsafe_code)]

pub mod adapters;
pub mod config;
pub mod core;
pub mod gateway;
pub mod plugin;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// Re-export the types most embedders need.
pub use crate::{
    adapters::{GatewayServer, PooledProxyClient, RequestPipeline},
    core::{
        EventBus, GatewayError, LoadBalancer, MetricSink, ModifierChain, UpstreamMatcher,
        UpstreamPublisher,
    },
    gateway::Gateway,
    plugin::PluginManager,
    utils::{ConnectionTracker, GracefulShutdown},
};
