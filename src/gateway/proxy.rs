//! Per-route WebSocket proxy
//!
//! Binds one configured endpoint to its gates and relay engine. Requests pass
//! through token validation, header enrichment and the RBAC gate (each only
//! when configured) before the relay engine sees them; any gate failure
//! short-circuits with a plain-text response.

use std::sync::Arc;

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::directory::GroupResolver;
use crate::identity::{
    AccessDecision, ClaimsEnricher, KeySetCache, RbacGate, TokenValidator, strip_identity_headers,
};
use crate::reject::RejectReason;
use crate::relay::{BackendAddress, BeforeHandshake, BufferPool, RelayEngine, strip_origin};
use crate::Result;

/// Process-wide state shared by every route.
#[derive(Clone)]
pub struct ProxyServices {
    /// Discovery and key set cache
    pub keys: Arc<KeySetCache>,
    /// Claims enricher (with the group resolver when transformation is on)
    pub enricher: ClaimsEnricher,
    /// Copy buffers
    pub pool: Arc<BufferPool>,
}

impl ProxyServices {
    /// Shared services; `groups` is `None` when group transformation is off.
    #[must_use]
    pub fn new(groups: Option<Arc<GroupResolver>>) -> Self {
        Self {
            keys: Arc::new(KeySetCache::new()),
            enricher: ClaimsEnricher::new(groups),
            pool: Arc::new(BufferPool::new()),
        }
    }
}

/// Proxy for one configured endpoint.
pub struct WebsocketProxy {
    api: String,
    validator: Option<TokenValidator>,
    enricher: ClaimsEnricher,
    rbac: Option<RbacGate>,
    engine: RelayEngine,
}

impl std::fmt::Debug for WebsocketProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketProxy")
            .field("api", &self.api)
            .field("backend", &self.engine.address().to_string())
            .field("token_validation", &self.validator.is_some())
            .field("rbac", &self.rbac)
            .finish_non_exhaustive()
    }
}

impl WebsocketProxy {
    /// Build the proxy for `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails when the backend address is malformed or the TLS client cannot
    /// be configured.
    pub fn new(endpoint: &EndpointConfig, services: &ProxyServices) -> Result<Self> {
        let address = BackendAddress::parse(&endpoint.address)?;
        let engine = RelayEngine::new(address, endpoint.tls_verify, Arc::clone(&services.pool))?;

        let validator = endpoint.jwk_url.as_ref().map(|url| {
            TokenValidator::new(
                url.clone(),
                endpoint.audience.clone(),
                endpoint.token_prefix.clone(),
                Arc::clone(&services.keys),
            )
        });

        let rbac = endpoint.rbac_roles.as_deref().and_then(RbacGate::new);
        if rbac.is_some() && validator.is_none() {
            warn!(
                api = %endpoint.api,
                "RBAC is configured without token validation; roles come from client headers"
            );
        }

        Ok(Self {
            api: endpoint.api.clone(),
            validator,
            enricher: services.enricher.clone(),
            rbac,
            engine,
        })
    }

    /// Install a hook that may edit the backend handshake request.
    #[must_use]
    pub fn with_before_handshake(mut self, hook: BeforeHandshake) -> Self {
        self.engine = self.engine.with_before_handshake(hook);
        self
    }

    /// Inbound path
    #[must_use]
    pub fn api(&self) -> &str {
        &self.api
    }

    /// Backend address
    #[must_use]
    pub fn backend(&self) -> &BackendAddress {
        self.engine.address()
    }

    /// `true` when the route validates bearer tokens
    #[must_use]
    pub fn validates_tokens(&self) -> bool {
        self.validator.is_some()
    }

    /// RBAC gate, when installed
    #[must_use]
    pub fn rbac(&self) -> Option<&RbacGate> {
        self.rbac.as_ref()
    }

    /// Handle one inbound request.
    pub async fn handle(&self, mut request: Request) -> Response {
        strip_origin(request.headers_mut());

        if let Err(reason) = self.authorize(&mut request).await {
            info!(api = %self.api, reason = %reason, "Request rejected");
            return reason.into_response();
        }

        debug!(api = %self.api, backend = %self.engine.address(), "Relaying request");
        self.engine.relay(request).await
    }

    /// Run the configured gates, enriching headers on the way.
    async fn authorize(&self, request: &mut Request) -> std::result::Result<(), RejectReason> {
        if let Some(validator) = &self.validator {
            let claims = validator.validate(request.headers()).await.map_err(|e| {
                debug!(api = %self.api, error = %e, "Token validation failed");
                e.reject_reason()
            })?;

            let headers = request.headers_mut();
            strip_identity_headers(headers);
            self.enricher.enrich(&claims, headers).await;
        }

        if let Some(rbac) = &self.rbac {
            if rbac.check(request.headers()) == AccessDecision::Deny {
                return Err(RejectReason::Forbidden);
            }
        }

        Ok(())
    }
}
