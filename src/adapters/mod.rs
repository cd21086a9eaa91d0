pub mod pipeline;
pub mod proxier;
pub mod proxy_client;
pub mod server;
pub mod tls;

/// Re-export commonly used types from adapters
pub use pipeline::RequestPipeline;
pub use proxier::Proxier;
pub use proxy_client::PooledProxyClient;
pub use server::{GatewayServer, ListenerSpec};
