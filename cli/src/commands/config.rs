// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use mcp_gateway_core::domain::gateway_config::GatewayConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the resolved manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./gateway-config.yaml)
        #[arg(short, long, default_value = "./gateway-config.yaml")]
        output: PathBuf,

        /// Include commented examples for every section
        #[arg(long)]
        examples: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate {
            output,
            examples,
            force,
        } => generate(&output, examples, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = GatewayConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. MCP_GATEWAY_CONFIG_PATH: {}",
            std::env::var("MCP_GATEWAY_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./gateway-config.yaml");
        println!("  4. ~/.mcp-gateway/config.yaml");
        println!("  5. /etc/mcp-gateway/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Gateway:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Listen: {}:{}", spec.network.bind_address, spec.network.port);
    println!();

    println!("{}", "Coordination:".bold());
    println!(
        "  Approval timeout: {:?}",
        spec.coordination.approval_timeout
    );
    println!("  Lock timeout: {:?}", spec.coordination.default_lock_timeout);
    println!("  Sweep interval: {:?}", spec.coordination.sweep_interval);
    println!();

    println!("{}", "Resilience:".bold());
    println!(
        "  Retry: {} attempts, {:?} base delay, x{} backoff",
        spec.resilience.retry.max_attempts,
        spec.resilience.retry.base_delay,
        spec.resilience.retry.multiplier
    );
    let breaker = &spec.resilience.circuit_breaker;
    if breaker.enabled {
        println!(
            "  Circuit breaker: opens after {} failures, {:?} cool-down",
            breaker.failure_threshold,
            breaker.cool_down
        );
    } else {
        println!("  Circuit breaker: {}", "disabled".yellow());
    }
    println!();

    println!("{}", "Collaborators:".bold());
    let collaborators = [
        ("Update orchestrator", &spec.collaborators.update_orchestrator),
        ("Generation service", &spec.collaborators.generation_service),
        ("Rollback manager", &spec.collaborators.rollback_manager),
    ];
    for (label, url) in collaborators {
        match url {
            Some(url) => println!("  {}: {}", label, url),
            None => println!("  {}: {}", label, "(not configured)".dimmed()),
        }
    }
    println!();

    println!("{}", "Downstream tools:".bold());
    if spec.tools.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for tool in &spec.tools {
        println!("  {} → {}", tool.name.bold(), tool.endpoint);
        if !tool.description.is_empty() {
            println!("    {}", tool.description);
        }
    }
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = GatewayConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    println!("  {} downstream tool(s)", config.spec.tools.len());

    Ok(())
}

fn generate(output: &Path, with_examples: bool, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    if with_examples {
        std::fs::write(output, include_str!("../../templates/gateway-config.yaml"))
            .with_context(|| format!("Failed to write config to {:?}", output))?;
    } else {
        GatewayConfigManifest::sample()
            .to_yaml_file(output)
            .with_context(|| format!("Failed to write config to {:?}", output))?;
    }

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_configs_validate() {
        let dir = tempfile::tempdir().unwrap();
        for examples in [false, true] {
            let path = dir.path().join(format!("config-{}.yaml", examples));
            generate(&path, examples, false).unwrap();
            let config = GatewayConfigManifest::from_yaml_file(&path).unwrap();
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway-config.yaml");
        std::fs::write(&path, "keep me").unwrap();

        assert!(generate(&path, false, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
        generate(&path, false, true).unwrap();
    }
}
