//! Configuration data structures for the gateway.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! They are intentionally serde-friendly and include defaults so that
//! minimal configs remain concise.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Listener ports. A port of zero disables that listener.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ListenerConfig {
    pub http_public_port: u16,
    pub http_internal_port: u16,
    pub https_public_port: u16,
    pub https_internal_port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            http_public_port: 8080,
            http_internal_port: 0,
            https_public_port: 0,
            https_internal_port: 0,
        }
    }
}

impl ListenerConfig {
    /// All enabled (non-zero) ports.
    pub fn enabled_ports(&self) -> Vec<u16> {
        [
            self.http_public_port,
            self.http_internal_port,
            self.https_public_port,
            self.https_internal_port,
        ]
        .into_iter()
        .filter(|p| *p != 0)
        .collect()
    }

    pub fn wants_tls(&self) -> bool {
        self.https_public_port != 0 || self.https_internal_port != 0
    }
}

/// TLS certificate material for the HTTPS listeners.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

fn default_instances() -> usize {
    1
}

/// One plugin binary to supervise.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PluginSpec {
    /// Binary path or a name resolved through `PATH`.
    pub command: String,
    /// Number of sibling instances to run.
    #[serde(default = "default_instances")]
    pub instances: usize,
    /// Opaque options handed to `Configure`.
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

/// Plugin binaries per role. Discovery and load-balancer are required.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PluginsConfig {
    #[serde(default)]
    pub discovery: Vec<PluginSpec>,
    #[serde(default)]
    pub load_balancer: Option<PluginSpec>,
    #[serde(default)]
    pub modifiers: Vec<PluginSpec>,
    #[serde(default)]
    pub metrics: Vec<PluginSpec>,
}

/// Gateway-wide timeout defaults, in milliseconds. Upstreams may override
/// the proxy, dial and DNS values per upstream.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct TimeoutConfig {
    pub proxy_ms: u64,
    pub dial_ms: u64,
    pub dns_ms: u64,
    pub plugin_call_ms: u64,
    pub drain_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            proxy_ms: 30_000,
            dial_ms: 2_000,
            dns_ms: 1_000,
            plugin_call_ms: 5_000,
            drain_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn proxy(&self) -> Duration {
        Duration::from_millis(self.proxy_ms)
    }

    pub fn dial(&self) -> Duration {
        Duration::from_millis(self.dial_ms)
    }

    pub fn dns(&self) -> Duration {
        Duration::from_millis(self.dns_ms)
    }

    pub fn plugin_call(&self) -> Duration {
        Duration::from_millis(self.plugin_call_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }
}

/// Metric sink tuning.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct MetricConfig {
    pub buffer_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            flush_interval_ms: 1_000,
        }
    }
}

impl MetricConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// The validated configuration the gateway consumes.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub listeners: ListenerConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub metrics: MetricConfig,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder.
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

/// Builder for [`GatewayConfig`] to allow for cleaner configuration creation
/// in embedding code and tests.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn http_public_port(mut self, port: u16) -> Self {
        self.config.listeners.http_public_port = port;
        self
    }

    pub fn http_internal_port(mut self, port: u16) -> Self {
        self.config.listeners.http_internal_port = port;
        self
    }

    pub fn https_public_port(mut self, port: u16) -> Self {
        self.config.listeners.https_public_port = port;
        self
    }

    pub fn https_internal_port(mut self, port: u16) -> Self {
        self.config.listeners.https_internal_port = port;
        self
    }

    pub fn tls(mut self, cert_path: &str, key_path: &str) -> Self {
        self.config.tls = Some(TlsConfig {
            cert_path: cert_path.to_string(),
            key_path: key_path.to_string(),
        });
        self
    }

    pub fn discovery_plugin(mut self, spec: PluginSpec) -> Self {
        self.config.plugins.discovery.push(spec);
        self
    }

    pub fn load_balancer_plugin(mut self, spec: PluginSpec) -> Self {
        self.config.plugins.load_balancer = Some(spec);
        self
    }

    pub fn modifier_plugin(mut self, spec: PluginSpec) -> Self {
        self.config.plugins.modifiers.push(spec);
        self
    }

    pub fn metric_plugin(mut self, spec: PluginSpec) -> Self {
        self.config.plugins.metrics.push(spec);
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn metric_tuning(mut self, metrics: MetricConfig) -> Self {
        self.config.metrics = metrics;
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_only_http_public() {
        let config = GatewayConfig::default();
        assert_eq!(config.listeners.enabled_ports(), vec![8080]);
        assert!(!config.listeners.wants_tls());
    }

    #[test]
    fn builder_accumulates_plugins() {
        let config = GatewayConfig::builder()
            .http_public_port(8000)
            .discovery_plugin(PluginSpec {
                command: "discover-static".into(),
                instances: 1,
                options: HashMap::new(),
            })
            .load_balancer_plugin(PluginSpec {
                command: "round-robin".into(),
                instances: 2,
                options: HashMap::new(),
            })
            .build();

        assert_eq!(config.listeners.http_public_port, 8000);
        assert_eq!(config.plugins.discovery.len(), 1);
        assert_eq!(config.plugins.load_balancer.unwrap().instances, 2);
    }

    #[test]
    fn minimal_toml_deserializes() {
        let toml = r#"
            [listeners]
            http_public_port = 8080

            [[plugins.discovery]]
            command = "discover-static"

            [plugins.load_balancer]
            command = "round-robin"
        "#;
        let config: GatewayConfig = toml_from_str(toml);
        assert_eq!(config.plugins.discovery.len(), 1);
        assert_eq!(config.timeouts.proxy(), Duration::from_secs(30));
        assert_eq!(config.metrics.buffer_size, 1024);
    }

    fn toml_from_str(input: &str) -> GatewayConfig {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(input, config::FileFormat::Toml))
            .build()
            .unwrap();
        settings.try_deserialize().unwrap()
    }
}
