use std::{path::Path, process::ExitCode, sync::Arc};

use clap::Parser;
use color_eyre::{eyre::Context, Result};
use dendrite::{
    config::{load_config, GatewayConfigValidator},
    core::error::GatewayError,
    tracing_setup,
    utils::GracefulShutdown,
    Gateway,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "dendrite.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "dendrite.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        #[clap(short, long, default_value = "dendrite.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "dendrite.toml")]
        config: String,
    },
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => validate_config_command(&config_path),
        "init" => init_config_command(&config_path),
        _ => serve(&config_path),
    }
}

#[tokio::main]
async fn serve(config_path: &str) -> Result<ExitCode> {
    tracing_setup::init_tracing()?;

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err:#}");
            return Ok(ExitCode::from(1));
        }
    };
    if let Err(err) = GatewayConfigValidator::validate(&config) {
        eprintln!("configuration rejected: {err}");
        return Ok(ExitCode::from(err.exit_code() as u8));
    }

    let gateway = Gateway::new(config)?;
    if let Err(err) = gateway.start().await {
        eprintln!("gateway failed to start: {err:#}");
        gateway.stop().await;
        let code = match err.downcast_ref::<GatewayError>() {
            Some(GatewayError::Supervision(_)) => 3,
            _ => 1,
        };
        return Ok(ExitCode::from(code));
    }

    let shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = signal_handler.run_signal_handler().await {
            tracing::error!(error = %err, "signal handler error");
        }
    });

    tokio::select! {
        reason = shutdown.wait_for_shutdown_signal() => {
            tracing::info!(?reason, "shutting down");
            gateway.stop().await;
            Ok(ExitCode::SUCCESS)
        }
        err = gateway.wait_for_fatal() => {
            tracing::error!(error = %err, "fatal plugin supervision failure");
            gateway.stop().await;
            Ok(ExitCode::from(3))
        }
    }
}

fn validate_config_command(config_path: &str) -> Result<ExitCode> {
    println!("validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("error: configuration file '{config_path}' not found");
        return Ok(ExitCode::from(1));
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("configuration parsing: OK");
            config
        }
        Err(err) => {
            eprintln!("configuration parsing failed:\n  {err:#}");
            return Ok(ExitCode::from(1));
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("configuration validation: OK");
            println!();
            println!("summary:");
            println!("  listener ports: {:?}", config.listeners.enabled_ports());
            println!("  discovery plugins: {}", config.plugins.discovery.len());
            println!("  modifier plugins: {}", config.plugins.modifiers.len());
            println!("  metric plugins: {}", config.plugins.metrics.len());
            println!("  tls enabled: {}", config.tls.is_some());
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("configuration validation failed:\n  {err}");
            Ok(ExitCode::from(err.exit_code() as u8))
        }
    }
}

fn init_config_command(config_path: &str) -> Result<ExitCode> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("error: configuration file '{config_path}' already exists");
        return Ok(ExitCode::from(1));
    }

    let default_config = r#"# Dendrite gateway configuration

[listeners]
# A port of zero disables the listener.
http_public_port = 8080
http_internal_port = 0
https_public_port = 0
https_internal_port = 0

# Required for the https listeners.
# [tls]
# cert_path = "cert.pem"
# key_path = "key.pem"

# Discovery plugins publish upstreams and backends into the gateway.
[[plugins.discovery]]
command = "dendrite-discover-static"
instances = 1
# options = { config = "/etc/upstreams.json" }

[plugins.load_balancer]
command = "dendrite-balance-roundrobin"
instances = 1

# [[plugins.modifiers]]
# command = "dendrite-modify-headers"

# [[plugins.metrics]]
# command = "dendrite-metrics-statsd"

[timeouts]
proxy_ms = 30000
dial_ms = 2000
dns_ms = 1000
plugin_call_ms = 5000
drain_ms = 30000

[metrics]
buffer_size = 1024
flush_interval_ms = 1000
"#;

    std::fs::write(path, default_config).wrap_err("failed to write config file")?;
    println!("created default configuration at: {config_path}");
    println!("  run 'dendrite serve --config {config_path}' to start the gateway");
    Ok(ExitCode::SUCCESS)
}
