pub mod balancer;
pub mod bus;
pub mod error;
pub mod event;
pub mod matcher;
pub mod metrics;
pub mod modifier;
pub mod publisher;
pub mod request;
pub mod upstream;

pub use balancer::LoadBalancer;
pub use bus::EventBus;
pub use error::GatewayError;
pub use matcher::UpstreamMatcher;
pub use metrics::MetricSink;
pub use modifier::ModifierChain;
pub use publisher::UpstreamPublisher;
