pub mod proxy_client;

pub use proxy_client::{ProxyClient, ProxyClientError, ProxyClientResult};
