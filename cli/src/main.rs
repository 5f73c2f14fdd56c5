// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # MCP DevOps Gateway
//!
//! The `mcp-gateway` binary hosts the gateway: many MCP clients connect over
//! SSE or single-shot HTTP, share the downstream tool catalogue and
//! coordinate multi-session operations through approvals and resource locks.
//!
//! ## Commands
//!
//! - `mcp-gateway serve` - Run the gateway HTTP server
//! - `mcp-gateway config show|validate|generate` - Configuration management

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use mcp_gateway::commands::{self, ConfigCommand, ServeArgs};

/// MCP DevOps Gateway - shared tools and cross-session coordination
#[derive(Parser)]
#[command(name = "mcp-gateway")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "MCP_GATEWAY_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the manifest
    #[arg(long, global = true, env = "MCP_GATEWAY_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server
    #[command(name = "serve")]
    Serve(ServeArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve(args)) => commands::serve::run(args, cli.config, cli.log_level).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}
