//! Connection pooling for target control channels.

pub mod manager;
pub mod retry;

pub use manager::{ConnectedChannel, ConnectionLease, ConnectionManager, ManagedConnection};
pub use retry::{AttemptFailure, RetryExhausted, RetryPolicy};

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::target_control::RecordingStream;

/// A recording stream that keeps its connection leased until dropped, so
/// the connection cannot be evicted while the stream is being read.
pub struct LeasedStream {
    inner: RecordingStream,
    _lease: ConnectionLease,
}

impl LeasedStream {
    pub fn new(inner: RecordingStream, lease: ConnectionLease) -> Self {
        Self {
            inner,
            _lease: lease,
        }
    }
}

impl AsyncRead for LeasedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for LeasedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedStream")
            .field("target", self._lease.target())
            .finish()
    }
}
