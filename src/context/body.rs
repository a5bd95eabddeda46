//! Request body transport and the once-only buffering gate.
//!
//! The transport pushes body chunks through a [`BodySender`]; the router owns the matching
//! [`BodyStream`] and drains it at most once per request, into memory, before the first
//! matching handler runs. Closing the sender is the end-of-body signal.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::RouteError;

/// Receiving half of a request body.
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

/// Sending half of a request body, held by the transport.
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

/// Creates a connected body sender/stream pair buffering up to `capacity` chunks.
pub fn channel(capacity: usize) -> (BodySender, BodyStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BodySender { tx }, BodyStream { rx })
}

impl BodyStream {
    /// A stream that ends immediately.
    pub fn empty() -> Self {
        let (_, stream) = channel(1);
        stream
    }

    /// A stream that yields `bytes` as a single chunk, then ends.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let bytes = bytes.into();
        if !bytes.is_empty() {
            // A fresh channel with capacity 1 always has room for the first chunk.
            let _ = tx.try_send(Ok(bytes));
        }
        Self { rx }
    }

    /// Waits for the next chunk; `None` once the sender side is closed.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.rx.recv().await
    }
}

impl BodySender {
    /// Pushes a chunk. Returns `false` when the receiving side has gone away.
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    /// Terminates the stream with a transport error.
    pub async fn fail(self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Returns `true` when nobody will read further chunks.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiving side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Limits applied while draining a body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyLimits {
    /// Largest body accepted, in bytes. `None` buffers without bound.
    pub max_size: Option<usize>,
    /// Longest wait for any single chunk.
    pub chunk_timeout: Option<Duration>,
}

/// Drains `stream` into one contiguous buffer.
///
/// # Errors
///
/// - [`RouteError::PayloadTooLarge`] as soon as the running total passes `max_size`.
/// - [`RouteError::RequestTimeout`] when a chunk does not arrive within `chunk_timeout`.
/// - [`RouteError::Body`] when the transport terminates the stream with an error.
pub(crate) async fn accumulate(
    stream: &mut BodyStream,
    limits: BodyLimits,
) -> Result<Bytes, RouteError> {
    let mut buf = BytesMut::new();

    loop {
        let next = match limits.chunk_timeout {
            Some(deadline) => tokio::time::timeout(deadline, stream.next_chunk())
                .await
                .map_err(|_| RouteError::RequestTimeout)?,
            None => stream.next_chunk().await,
        };

        let chunk = match next {
            None => break,
            Some(Err(e)) => return Err(RouteError::Body(e)),
            Some(Ok(chunk)) => chunk,
        };

        if let Some(limit) = limits.max_size {
            if buf.len() + chunk.len() > limit {
                return Err(RouteError::PayloadTooLarge { limit });
            }
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accumulate_joins_chunks_in_order() {
        let (tx, mut stream) = channel(4);
        tokio::spawn(async move {
            tx.send(Bytes::from_static(b"hel")).await;
            tx.send(Bytes::from_static(b"lo")).await;
        });
        let body = accumulate(&mut stream, BodyLimits::default()).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn empty_stream_yields_empty_body() {
        let body = accumulate(&mut BodyStream::empty(), BodyLimits::default())
            .await
            .unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn oversized_body_fails_fast() {
        let limits = BodyLimits {
            max_size: Some(4),
            ..BodyLimits::default()
        };
        let err = accumulate(&mut BodyStream::from_bytes("too long"), limits)
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::PayloadTooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn stalled_body_times_out() {
        let (tx, mut stream) = channel(1);
        let limits = BodyLimits {
            chunk_timeout: Some(Duration::from_millis(20)),
            ..BodyLimits::default()
        };
        let err = accumulate(&mut stream, limits).await.unwrap_err();
        assert!(matches!(err, RouteError::RequestTimeout));
        drop(tx);
    }

    #[tokio::test]
    async fn transport_error_is_reported() {
        let (tx, mut stream) = channel(1);
        tx.fail(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .await;
        let err = accumulate(&mut stream, BodyLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Body(_)));
    }
}
