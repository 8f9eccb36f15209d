//! HTTP router

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    routing::{any, get},
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::proxy::WebsocketProxy;

/// Create the router: one handler per proxy `api` path (any method) plus the
/// health path.
pub fn create_router(proxies: &[Arc<WebsocketProxy>], health_path: &str) -> Router {
    let mut router = Router::new().route(health_path, get(health_handler));

    for proxy in proxies {
        let proxy = Arc::clone(proxy);
        let path = proxy.api().to_string();
        router = router.route(
            &path,
            any(move |request: Request| async move { proxy.handle(request).await }),
        );
    }

    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Liveness check
async fn health_handler() -> &'static str {
    "OK"
}
