//! Gateway server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::proxy::{ProxyServices, WebsocketProxy};
use super::router::create_router;
use crate::config::{Config, GroupTransform};
use crate::directory::{GraphConnector, GroupResolver};
use crate::{Error, Result};

/// WebSocket relay gateway: the validated routes plus the process settings
/// needed to serve them.
pub struct Gateway {
    /// Configuration
    config: Config,
    /// One proxy per configured endpoint
    proxies: Vec<Arc<WebsocketProxy>>,
}

impl Gateway {
    /// Create a gateway, resolving group names through the directory service
    /// when `transform` enables it.
    ///
    /// # Errors
    ///
    /// Fails when any endpoint descriptor is invalid (all problems are
    /// reported together) or the directory client cannot be built.
    pub fn new(config: Config, transform: &GroupTransform) -> Result<Self> {
        let groups = match transform {
            GroupTransform::Disabled => None,
            GroupTransform::Enabled(settings) => {
                info!(
                    refresh_minutes = settings.refresh_interval.as_secs_f64() / 60.0,
                    "Group transformation enabled"
                );
                Some(Arc::new(GroupResolver::new(
                    Arc::new(GraphConnector::new(settings)?),
                    settings.refresh_interval,
                )))
            }
        };
        Self::with_group_resolver(config, groups)
    }

    /// Create a gateway with an explicit group resolver (`None` disables
    /// group transformation).
    ///
    /// # Errors
    ///
    /// Fails when any endpoint descriptor is invalid.
    pub fn with_group_resolver(config: Config, groups: Option<Arc<GroupResolver>>) -> Result<Self> {
        let endpoints = config.endpoints()?;
        let services = ProxyServices::new(groups);

        let mut proxies = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let proxy = WebsocketProxy::new(endpoint, &services)?;
            info!(
                api = %proxy.api(),
                backend = %proxy.backend(),
                token_validation = proxy.validates_tokens(),
                rbac = proxy.rbac().is_some(),
                "Registered websocket route"
            );
            proxies.push(Arc::new(proxy));
        }

        Ok(Self { config, proxies })
    }

    /// Registered proxies, in configuration order
    #[must_use]
    pub fn routes(&self) -> &[Arc<WebsocketProxy>] {
        &self.proxies
    }

    /// Build the HTTP router.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(&self.proxies, &self.config.health_path)
    }

    /// Run the gateway until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("WS AUTH RELAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!("  GET {}  (health)", self.config.health_path);
        for proxy in &self.proxies {
            info!("  {} -> {}", proxy.api(), proxy.backend());
        }
        if self.proxies.is_empty() {
            warn!("No websocket routes configured");
        }
        info!("============================================================");

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` completes.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
