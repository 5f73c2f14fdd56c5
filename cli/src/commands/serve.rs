// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `serve` command: run the gateway HTTP server until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Args;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use mcp_gateway_core::application::Gateway;
use mcp_gateway_core::domain::gateway_config::{GatewayConfigManifest, LogFormat};
use mcp_gateway_core::presentation;

use crate::logging::{init_logging, parse_log_format};

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Bind address (overrides spec.network.bind_address)
    #[arg(long, env = "MCP_GATEWAY_HOST")]
    pub host: Option<String>,

    /// HTTP port (overrides spec.network.port)
    #[arg(long, env = "MCP_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Log output format: compact or json
    #[arg(long, env = "MCP_GATEWAY_LOG_FORMAT", value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,
}

/// Load the manifest and fold the command-line overrides into it.
pub fn resolve_config(
    args: &ServeArgs,
    config_path: Option<PathBuf>,
    log_level: Option<String>,
) -> Result<GatewayConfigManifest> {
    let mut config = GatewayConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    if let Some(host) = &args.host {
        config.spec.network.bind_address = host.clone();
    }
    if let Some(port) = args.port {
        config.spec.network.port = port;
    }
    if let Some(level) = log_level {
        config.spec.observability.log_level = level;
    }
    if let Some(format) = args.log_format {
        config.spec.observability.log_format = format;
    }

    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

pub async fn run(args: ServeArgs, config_path: Option<PathBuf>, log_level: Option<String>) -> Result<()> {
    let config = resolve_config(&args, config_path, log_level)?;
    init_logging(
        &config.spec.observability.log_level,
        config.spec.observability.log_format,
    )?;

    let prometheus = if config.spec.observability.prometheus {
        install_prometheus()
    } else {
        None
    };

    let addr = format!(
        "{}:{}",
        config.spec.network.bind_address, config.spec.network.port
    );
    let gateway = Arc::new(Gateway::from_config(config).context("Failed to build gateway")?);
    gateway.start();

    let app = presentation::app(gateway.clone(), prometheus);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Gateway listening on {}", addr);

    // Closing every session ends the SSE streams, which lets the server drain.
    let stopping = gateway.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        stopping.stop().await;
    })
    .await
    .context("HTTP server failed")?;

    info!("Gateway shut down");

    Ok(())
}

fn install_prometheus() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus exporter disabled: {}", e);
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway-config.yaml");
        GatewayConfigManifest::sample().to_yaml_file(&path).unwrap();

        let args = ServeArgs {
            host: Some("127.0.0.1".to_string()),
            port: Some(9443),
            log_format: Some(LogFormat::Json),
        };
        let config = resolve_config(&args, Some(path), Some("debug".to_string())).unwrap();

        assert_eq!(config.spec.network.bind_address, "127.0.0.1");
        assert_eq!(config.spec.network.port, 9443);
        assert_eq!(config.spec.observability.log_level, "debug");
        assert_eq!(config.spec.observability.log_format, LogFormat::Json);
        assert_eq!(config.spec.tools.len(), 1);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let args = ServeArgs::default();
        let result = resolve_config(&args, Some(PathBuf::from("/nonexistent/gateway.yaml")), None);
        assert!(result.is_err());
    }
}
