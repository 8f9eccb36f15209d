//! ws-auth-relay - authenticating WebSocket relay

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use ws_auth_relay::{
    cli::{Cli, Command},
    config::{Config, GroupTransform},
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check) => run_check(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Validate configuration and print the route table
fn run_check(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let endpoints = match config.endpoints() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = GroupTransform::from_env() {
        eprintln!("❌ {e}");
        return ExitCode::FAILURE;
    }

    println!(
        "✅ Configuration valid: {} route(s), listening on {}:{}\n",
        endpoints.len(),
        config.server.host,
        config.server.port
    );
    println!("  {}  (health)", config.health_path);
    for endpoint in &endpoints {
        let mut gates = Vec::new();
        if endpoint.jwk_url.is_some() {
            gates.push("token".to_string());
        }
        if let Some(roles) = &endpoint.rbac_roles {
            gates.push(format!("rbac={roles}"));
        }
        let gates = if gates.is_empty() {
            String::new()
        } else {
            format!(" [{}]", gates.join(", "))
        };
        println!("  {} -> {}{}", endpoint.api, endpoint.address, gates);
    }

    ExitCode::SUCCESS
}

/// Run the relay server
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let transform = match GroupTransform::from_env() {
        Ok(t) => t,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        routes = config.websockets.len(),
        "Starting WebSocket relay"
    );

    let gateway = match Gateway::new(config, &transform) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
