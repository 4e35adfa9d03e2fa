use std::{
    fmt, io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, watch},
};
use tracing::debug;

/// Display name every connection starts with until it issues `/nick`.
pub const DEFAULT_NICKNAME: &str = "Anonymous";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an accepted connection.
///
/// Ids are handed out from a process-wide counter, so two connections never
/// compare equal even if they share a peer address or display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of one client connection.
///
/// The owning session writes local replies here while the hub writes
/// broadcast fan-out; the mutex keeps every line whole. Closing also signals
/// the session so it stops reading.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new<W>(writer: W, peer: Option<SocketAddr>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: ConnectionId::next(),
            peer,
            writer: Mutex::new(Box::new(writer)),
            closed: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Writes `line` as-is and flushes. Callers include the trailing newline.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection already closed",
            ));
        }
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    /// Wakes the owning session and shuts down the write side. Returns
    /// `false` if it was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(id = %self.id, error = ?err, "failed to shut down connection writer");
        }
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
