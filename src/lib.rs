//! WebSocket Auth Relay Library
//!
//! Reverse relay that turns HTTP upgrade requests into raw byte tunnels
//! toward WebSocket backends, gated by bearer-token validation and RBAC.
//!
//! # Features
//!
//! - **Relay**: the upgrade handshake is re-issued against a `ws://` or
//!   `wss://` backend and bytes are spliced verbatim in both directions
//! - **Token validation**: OpenID Connect discovery, cached key sets,
//!   signature/audience/issuer/expiry checks
//! - **Header enrichment**: tenant, roles, resolved group names and user
//!   identity forwarded as headers
//! - **Group cache**: directory group names cached per tenant with a TTL
//! - **RBAC**: per-route allowed roles

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod reject;
pub mod relay;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
