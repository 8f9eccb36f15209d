//! Plain-text rejections returned before a tunnel is established.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Why a request did not reach (or could not reach) the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// No `Authorization` header on a validated route
    MissingAuthorization,
    /// `Authorization` does not start with the configured prefix and a space
    BadTokenPrefix,
    /// Discovery or verification failed
    TokenValidation,
    /// The RBAC gate found no matching role or group
    Forbidden,
    /// The request is not a WebSocket upgrade (`400`, never `200`)
    NotUpgrade,
    /// The HTTP connection cannot be taken over (HTTP/2, in-process calls)
    TakeoverUnsupported,
    /// The pre-handshake hook failed
    Hook(String),
    /// Dialing or handshaking with the backend failed
    Backend(String),
}

impl RejectReason {
    /// HTTP status sent to the client
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingAuthorization | Self::BadTokenPrefix | Self::TokenValidation => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotUpgrade => StatusCode::BAD_REQUEST,
            Self::TakeoverUnsupported | Self::Hook(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Response body
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::MissingAuthorization => "Missing authorization header",
            Self::BadTokenPrefix => "Bad token prefix",
            Self::TokenValidation => "Bad token validator url",
            Self::Forbidden => "User has no permissions for that operation",
            Self::NotUpgrade => "Must be a websocket request",
            Self::TakeoverUnsupported => "Connection takeover not supported",
            Self::Hook(msg) | Self::Backend(msg) => msg,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status().as_u16(), self.message())
    }
}

impl IntoResponse for RejectReason {
    fn into_response(self) -> Response {
        (self.status(), self.message().to_string()).into_response()
    }
}
