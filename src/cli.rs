//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Authenticating WebSocket relay - bearer tokens, group enrichment and RBAC
/// in front of raw WebSocket backends
#[derive(Parser, Debug)]
#[command(name = "ws-auth-relay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "WS_RELAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "WS_RELAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "WS_RELAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "WS_RELAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "WS_RELAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the relay server (default)
    Serve,

    /// Validate the configuration and print the route table
    Check,
}
