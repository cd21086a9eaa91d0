//! Configuration validation.
//!
//! Validation runs once at startup; failures abort the process. Exit code 1
//! means the configuration itself is invalid, exit code 2 means a required
//! plugin binary could not be found.
use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::config::models::{GatewayConfig, PluginSpec};

/// Validation failures, partitioned by exit code.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("plugin binary not found: {0}")]
    PluginNotFound(String),
}

impl ValidationError {
    /// The process exit code this failure maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            ValidationError::Invalid(_) => 1,
            ValidationError::PluginNotFound(_) => 2,
        }
    }
}

/// Result type alias for validation.
pub type ValidationResult = Result<(), ValidationError>;

/// Validates a [`GatewayConfig`] before the gateway is built.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    pub fn validate(config: &GatewayConfig) -> ValidationResult {
        let ports = config.listeners.enabled_ports();
        if ports.is_empty() {
            return Err(ValidationError::Invalid(
                "at least one listener port must be non-zero".into(),
            ));
        }
        let unique: HashSet<u16> = ports.iter().copied().collect();
        if unique.len() != ports.len() {
            return Err(ValidationError::Invalid(
                "listener ports must be distinct".into(),
            ));
        }
        if config.listeners.wants_tls() && config.tls.is_none() {
            return Err(ValidationError::Invalid(
                "HTTPS listeners are enabled but no TLS configuration is present".into(),
            ));
        }

        if config.plugins.discovery.is_empty() {
            return Err(ValidationError::Invalid(
                "at least one discovery plugin is required".into(),
            ));
        }
        let Some(load_balancer) = &config.plugins.load_balancer else {
            return Err(ValidationError::Invalid(
                "a load-balancer plugin is required".into(),
            ));
        };

        let all_plugins = config
            .plugins
            .discovery
            .iter()
            .chain(std::iter::once(load_balancer))
            .chain(config.plugins.modifiers.iter())
            .chain(config.plugins.metrics.iter());
        for spec in all_plugins {
            Self::validate_plugin(spec)?;
        }

        let timeouts = [
            ("proxy_ms", config.timeouts.proxy_ms),
            ("dial_ms", config.timeouts.dial_ms),
            ("dns_ms", config.timeouts.dns_ms),
            ("plugin_call_ms", config.timeouts.plugin_call_ms),
            ("drain_ms", config.timeouts.drain_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ValidationError::Invalid(format!(
                    "timeout {name} must be non-zero"
                )));
            }
        }

        if config.metrics.buffer_size == 0 {
            return Err(ValidationError::Invalid(
                "metric buffer_size must be non-zero".into(),
            ));
        }
        if config.metrics.flush_interval_ms == 0 {
            return Err(ValidationError::Invalid(
                "metric flush_interval_ms must be non-zero".into(),
            ));
        }

        Ok(())
    }

    fn validate_plugin(spec: &PluginSpec) -> ValidationResult {
        if spec.command.trim().is_empty() {
            return Err(ValidationError::Invalid(
                "plugin command must not be empty".into(),
            ));
        }
        if spec.instances == 0 {
            return Err(ValidationError::Invalid(format!(
                "plugin {} must run at least one instance",
                spec.command
            )));
        }
        if resolve_binary(&spec.command).is_none() {
            return Err(ValidationError::PluginNotFound(spec.command.clone()));
        }
        Ok(())
    }
}

/// Resolve a plugin command the way the shell would: absolute and relative
/// paths are checked directly, bare names are searched through `PATH`.
pub fn resolve_binary(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::models::PluginSpec;

    fn plugin(command: &str) -> PluginSpec {
        PluginSpec {
            command: command.into(),
            instances: 1,
            options: HashMap::new(),
        }
    }

    /// `sh` is present on every platform the gateway targets.
    fn valid_config() -> GatewayConfig {
        GatewayConfig::builder()
            .http_public_port(8080)
            .discovery_plugin(plugin("sh"))
            .load_balancer_plugin(plugin("sh"))
            .build()
    }

    #[test]
    fn accepts_a_minimal_valid_config() {
        assert!(GatewayConfigValidator::validate(&valid_config()).is_ok());
    }

    #[test]
    fn rejects_no_listeners() {
        let mut config = valid_config();
        config.listeners.http_public_port = 0;
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn rejects_duplicate_ports() {
        let mut config = valid_config();
        config.listeners.http_internal_port = 8080;
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_https_without_tls() {
        let mut config = valid_config();
        config.listeners.https_public_port = 8443;
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn rejects_missing_discovery_plugins() {
        let mut config = valid_config();
        config.plugins.discovery.clear();
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn missing_binary_maps_to_exit_code_2() {
        let mut config = valid_config();
        config.plugins.discovery = vec![plugin("definitely-not-a-real-binary-name")];
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(err, ValidationError::PluginNotFound(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut config = valid_config();
        config.timeouts.proxy_ms = 0;
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn resolves_binaries_through_path() {
        assert!(resolve_binary("sh").is_some());
        assert!(resolve_binary("definitely-not-a-real-binary-name").is_none());
    }
}
