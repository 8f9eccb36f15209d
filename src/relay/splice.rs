//! Bidirectional byte splicing between the client and the backend.
//!
//! Each direction runs in its own task with a pooled buffer. Both report on a
//! two-slot channel; the first report ends the session and both tasks are
//! aborted, which drops (and closes) every half of both connections.

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::pool::{BufferPool, PooledBuffer};

/// Direction of a copy loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend
    Upstream,
    /// Backend to client
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upstream => "client->backend",
            Self::Downstream => "backend->client",
        })
    }
}

/// Outcome of the copy loop that finished first.
#[derive(Debug)]
pub struct SessionEnd {
    /// Which loop reported
    pub direction: Direction,
    /// Bytes that loop forwarded
    pub bytes: u64,
    /// `None` on a clean EOF
    pub error: Option<io::Error>,
}

/// Splice `client` and `backend` until either direction stops.
///
/// Returns the first loop's outcome. Both connections are closed by the time
/// this returns, whichever side stopped first. `None` only when neither loop
/// managed to report (both tasks panicked).
pub async fn splice<C, B>(client: C, backend: B, pool: &Arc<BufferPool>) -> Option<SessionEnd>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let (tx, mut rx) = mpsc::channel(2);

    let upstream = tokio::spawn(copy_loop(
        client_read,
        backend_write,
        pool.get(),
        Direction::Upstream,
        tx.clone(),
    ));
    let downstream = tokio::spawn(copy_loop(
        backend_read,
        client_write,
        pool.get(),
        Direction::Downstream,
        tx,
    ));

    // First signal wins; the other loop's result is not awaited.
    let first = rx.recv().await;

    upstream.abort();
    downstream.abort();
    // Join so the aborted futures (and the stream halves they own) are
    // dropped before returning.
    let _ = upstream.await;
    let _ = downstream.await;

    first
}

async fn copy_loop<R, W>(
    mut reader: R,
    mut writer: W,
    mut buf: PooledBuffer,
    direction: Direction,
    done: mpsc::Sender<SessionEnd>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let error = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Some(e);
        }
        if let Err(e) = writer.flush().await {
            break Some(e);
        }
        bytes += n as u64;
    };

    // Capacity 2 means this never waits.
    let _ = done
        .send(SessionEnd {
            direction,
            bytes,
            error,
        })
        .await;
}
