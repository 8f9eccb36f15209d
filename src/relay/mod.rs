//! WebSocket relay engine
//!
//! Turns an approved upgrade request into a raw tunnel toward the backend:
//! the handshake is re-issued against the backend, its answer is replayed to
//! the client, and once both sides have switched protocols the bytes are
//! spliced verbatim in both directions.

mod address;
mod backend;
mod handshake;
mod pool;
mod splice;

pub use address::{BackendAddress, Scheme};
pub use backend::{BackendConnector, BackendStream};
pub use handshake::{BackendRequest, ResponseHead, read_response_head};
pub use pool::{BUF_SIZE, BufferPool, PooledBuffer};
pub use splice::{Direction, SessionEnd, splice};

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::Result;
use crate::reject::RejectReason;

/// Hook run on the rewritten request right before it is sent to the backend.
///
/// An `Err` aborts the session; its text is returned to the client.
pub type BeforeHandshake =
    Arc<dyn Fn(&mut BackendRequest) -> std::result::Result<(), String> + Send + Sync>;

/// `true` when `Connection` mentions `upgrade` and `Upgrade` is `websocket`
/// (both case-insensitive).
#[must_use]
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    let upgrade = headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.trim().eq_ignore_ascii_case("websocket"));

    connection && upgrade
}

/// Remove the `Origin` header; the backend sees the relay, not the browser.
pub fn strip_origin(headers: &mut HeaderMap) {
    headers.remove(header::ORIGIN);
}

/// Relays upgrade requests for one route.
#[derive(Clone)]
pub struct RelayEngine {
    connector: BackendConnector,
    pool: Arc<BufferPool>,
    before_handshake: Option<BeforeHandshake>,
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("connector", &self.connector)
            .field("before_handshake", &self.before_handshake.is_some())
            .finish_non_exhaustive()
    }
}

impl RelayEngine {
    /// Create an engine for `address`.
    ///
    /// # Errors
    ///
    /// Fails when the TLS client configuration cannot be built.
    pub fn new(address: BackendAddress, tls_verify: bool, pool: Arc<BufferPool>) -> Result<Self> {
        Ok(Self {
            connector: BackendConnector::new(address, tls_verify)?,
            pool,
            before_handshake: None,
        })
    }

    /// Install a pre-handshake hook.
    #[must_use]
    pub fn with_before_handshake(mut self, hook: BeforeHandshake) -> Self {
        self.before_handshake = Some(hook);
        self
    }

    /// Backend this engine dials
    #[must_use]
    pub fn address(&self) -> &BackendAddress {
        self.connector.address()
    }

    /// Relay one request. Gate failures and backend errors become plain-text
    /// responses; a successful handshake returns the backend's `101` and the
    /// tunnel runs in a background task.
    pub async fn relay(&self, request: Request) -> Response {
        match self.try_relay(request).await {
            Ok(response) => response,
            Err(reason) => {
                debug!(backend = %self.address(), reason = %reason, "Relay rejected");
                reason.into_response()
            }
        }
    }

    async fn try_relay(&self, request: Request) -> std::result::Result<Response, RejectReason> {
        let (mut parts, _body) = request.into_parts();
        strip_origin(&mut parts.headers);

        if !is_upgrade_request(&parts.headers) {
            return Err(RejectReason::NotUpgrade);
        }

        let on_upgrade = parts
            .extensions
            .remove::<OnUpgrade>()
            .ok_or(RejectReason::TakeoverUnsupported)?;

        let address = self.address();
        let mut backend_request = BackendRequest::rewrite(
            &parts.method,
            parts.uri.query(),
            &parts.headers,
            address.path(),
            address.authority(),
        );

        if let Some(hook) = &self.before_handshake {
            hook(&mut backend_request).map_err(|e| {
                warn!(backend = %address, error = %e, "Pre-handshake hook failed");
                RejectReason::Hook(e)
            })?;
        }

        let mut backend = self.connector.connect().await.map_err(|e| {
            warn!(backend = %address, error = %e, "Failed to connect to backend");
            RejectReason::Backend(e.to_string())
        })?;

        let head = handshake(&mut backend, &backend_request).await.map_err(|e| {
            warn!(backend = %address, error = %e, "Backend handshake failed");
            RejectReason::Backend(e.to_string())
        })?;

        if !head.is_switching() {
            info!(
                backend = %address,
                status = head.status.as_u16(),
                "Backend refused the upgrade"
            );
            return Ok(refused_response(head));
        }

        let mut response = Response::new(Body::empty());
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;

        let pool = Arc::clone(&self.pool);
        let backend_name = address.to_string();
        let leftover = head.leftover;
        tokio::spawn(async move {
            let client = match on_upgrade.await {
                Ok(upgraded) => TokioIo::new(upgraded),
                Err(e) => {
                    warn!(backend = %backend_name, error = %e, "Client upgrade failed");
                    return;
                }
            };
            run_session(client, backend, leftover, &pool, &backend_name).await;
        });

        Ok(response)
    }
}

/// Re-issue the upgrade handshake and read the backend's answer.
async fn handshake(backend: &mut BackendStream, request: &BackendRequest) -> Result<ResponseHead> {
    backend.write_all(&request.encode()).await?;
    backend.flush().await?;
    read_response_head(backend).await
}

async fn run_session<C>(
    mut client: C,
    backend: BackendStream,
    leftover: Vec<u8>,
    pool: &Arc<BufferPool>,
    backend_name: &str,
) where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    if !leftover.is_empty() {
        if let Err(e) = client.write_all(&leftover).await {
            warn!(backend = %backend_name, error = %e, "Failed to forward early backend bytes");
            return;
        }
    }

    info!(backend = %backend_name, "Relay session started");
    match splice(client, backend, pool).await {
        Some(SessionEnd {
            direction,
            bytes,
            error: Some(e),
        }) => {
            warn!(backend = %backend_name, %direction, bytes, error = %e, "Relay session ended with error");
        }
        Some(SessionEnd {
            direction, bytes, ..
        }) => {
            info!(backend = %backend_name, %direction, bytes, "Relay session closed");
        }
        None => warn!(backend = %backend_name, "Relay session ended without a report"),
    }
}

/// A non-101 backend answer, replayed as an ordinary response.
fn refused_response(head: ResponseHead) -> Response {
    let mut headers = head.headers;
    // The body is whatever arrived with the head; framing is recomputed.
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);

    let mut response = Response::new(Body::from(head.leftover));
    *response.status_mut() = head.status;
    *response.headers_mut() = headers;
    response
}
