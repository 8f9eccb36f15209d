//! Re-issuing the upgrade handshake against the backend.
//!
//! The inbound request is rewritten into a [`BackendRequest`], written to the
//! backend verbatim, and the backend's response head is read back so it can
//! be replayed to the client before the connection switches to raw bytes.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

/// Upper bound on the backend's response head
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Upper bound on response header count
const MAX_HEADERS: usize = 64;

/// `Host` is rewritten; the rest only describe the inbound message body.
fn is_skipped_request_header(name: &HeaderName) -> bool {
    *name == header::HOST
        || *name == header::CONTENT_LENGTH
        || *name == header::TRANSFER_ENCODING
        || *name == header::TRAILER
}

/// The upgrade request as it will be sent to the backend.
///
/// Pre-handshake hooks receive a mutable reference and may add or replace
/// headers (impersonation, backend credentials) before it is written.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Request method, normally `GET`
    pub method: Method,
    /// Request target: backend path plus the inbound query string
    pub target: String,
    /// Value of the `Host` header (`host:port` of the backend)
    pub host: String,
    /// Forwarded headers
    pub headers: HeaderMap,
}

impl BackendRequest {
    /// Rewrite an inbound request for the backend.
    #[must_use]
    pub fn rewrite(
        method: &Method,
        query: Option<&str>,
        headers: &HeaderMap,
        backend_path: &str,
        backend_host: String,
    ) -> Self {
        let target = match query {
            Some(q) if !q.is_empty() => format!("{backend_path}?{q}"),
            _ => backend_path.to_string(),
        };

        let mut forwarded = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if !is_skipped_request_header(name) {
                forwarded.append(name.clone(), value.clone());
            }
        }

        Self {
            method: method.clone(),
            target,
            host: backend_host,
            headers: forwarded,
        }
    }

    /// HTTP/1.1 request line and headers, terminated by an empty line.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        out.extend_from_slice(self.host.as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            if is_skipped_request_header(name) {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

/// The backend's answer to the re-issued handshake.
#[derive(Debug)]
pub struct ResponseHead {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Bytes received after the head (early frames or body)
    pub leftover: Vec<u8>,
}

impl ResponseHead {
    /// `true` for `101 Switching Protocols`
    #[must_use]
    pub fn is_switching(&self) -> bool {
        self.status == StatusCode::SWITCHING_PROTOCOLS
    }
}

/// Read and parse the backend's response head.
///
/// # Errors
///
/// Fails when the backend closes before a full head arrives, the head exceeds
/// 16 KiB, or it is not valid HTTP/1.x.
pub async fn read_response_head<R>(stream: &mut R) -> Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed the connection during the handshake",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(head) = parse_response_head(&buf)? {
            return Ok(head);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::Internal(
                "backend handshake response head too large".to_string(),
            ));
        }
    }
}

/// Parse a complete response head out of `buf`; `None` when more bytes are
/// needed.
fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut raw_headers);

    let consumed = match response.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(Error::Internal(format!(
                "invalid backend handshake response: {e}"
            )));
        }
    };

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| Error::Internal("backend handshake response has no status".to_string()))?;

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for h in response.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| Error::Internal(format!("invalid backend header name: {e}")))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| Error::Internal(format!("invalid backend header value: {e}")))?;
        headers.append(name, value);
    }

    Ok(Some(ResponseHead {
        status,
        headers,
        leftover: buf[consumed..].to_vec(),
    }))
}
