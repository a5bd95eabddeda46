//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, parses HTTP/1.1 request heads and hands each request to a
//! [`Router`]. The request body is streamed into the router's body channel while the
//! router runs, so handlers start before the body has fully arrived and only the
//! router's once-only buffering decides when it is read. Persistent connections
//! (keep-alive) are supported out of the box.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::context::{BodySender, RequestContext, ResponseContext, body};
use crate::error::{HttpError, RouteError};
use crate::http::{HeadError, RequestHead, Response};
use crate::router::Router;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Chunks buffered between the socket and the router before reads pause.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// How long to wait for unread body bytes once the router no longer wants them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The switchyard HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::{Router, ServerConfig};
/// use switchyard::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.get("/", |_req, res| async move {
///         res.end_with("Hello!")?;
///         Ok(())
///     })?;
///
///     let server = Server::bind("127.0.0.1:8080", ServerConfig::default()).await?;
///     server.run(router).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>, config: ServerConfig) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config: Arc::new(config),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts accepting connections and dispatching requests to `router`.
    ///
    /// The router is shared across all spawned Tokio tasks. This method runs until the
    /// process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, router: impl Into<Arc<Router>>) -> Result<(), ServerError> {
        let router = router.into();
        info!(address = %self.local_addr, routes = router.len(), "switchyard listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let router = Arc::clone(&router);
            let config = Arc::clone(&self.config);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, router, config).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

// How the body of one request ended on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyOutcome {
    // Every declared byte was read off the socket.
    Complete,
    // The rest of the body never arrived in time; the connection cannot be reused.
    Abandoned,
    // The peer went away mid-body.
    Disconnected,
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
) -> Result<(), io::Error> {
    let limits = config.head_limits();
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let (head, body_offset) = match RequestHead::parse(&buf, &limits) {
            Ok(pair) => pair,
            Err(HeadError::Incomplete) => {
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "rejecting request head");
                reject(&mut stream, head_error(e)).await?;
                break;
            }
        };

        if head.headers().contains("transfer-encoding") {
            warn!(peer = %peer_addr, "transfer-encoding not supported");
            let err = HttpError::new(501, "Transfer-Encoding is not supported");
            reject(&mut stream, err.into()).await?;
            break;
        }

        let content_length = head.content_length().unwrap_or(0);
        if let Some(limit) = config.max_body_size {
            if content_length > limit {
                warn!(peer = %peer_addr, content_length, limit, "declared body too large");
                reject(&mut stream, RouteError::PayloadTooLarge { limit }).await?;
                break;
            }
        }

        let _ = buf.split_to(body_offset);
        let keep_alive = head.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %head.method(),
            path = %head.path(),
            content_length,
            "dispatching request"
        );

        let (sender, body) = body::channel(BODY_CHANNEL_CAPACITY);
        let req = RequestContext::with_limits(head, body, config.body_limits());
        let (res, mut delivery) = ResponseContext::for_request(&req, config.compression);

        let feed = feed_body(&mut stream, &mut buf, content_length, sender, &res);
        let dispatch = {
            let router = &*router;
            let res = res.clone();
            async move {
                router.handle(req, res.clone()).await;
                if !res.is_finished() {
                    res.end();
                }
            }
        };
        let (outcome, ()) = tokio::join!(feed, dispatch);

        let outcome = outcome?;
        if outcome == BodyOutcome::Disconnected {
            debug!(peer = %peer_addr, "peer disconnected mid-body");
            break;
        }

        let Some(response) = delivery.try_recv() else {
            debug!(peer = %peer_addr, "no response produced");
            break;
        };
        let keep_alive = keep_alive && outcome == BodyOutcome::Complete;

        stream
            .write_all(&response.keep_alive(keep_alive).into_bytes())
            .await?;
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close — shutting down");
            break;
        }
    }

    Ok(())
}

/// Moves `remaining` body bytes from the connection into `sender`.
///
/// Bytes already sitting in `buf` go first. If the router stops reading (it finished
/// without needing the body, or its drain failed) the rest is read and discarded so the
/// connection stays usable.
async fn feed_body(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut remaining: usize,
    sender: BodySender,
    res: &ResponseContext,
) -> io::Result<BodyOutcome> {
    loop {
        let n = buf.len().min(remaining);
        if n > 0 {
            remaining -= n;
            let chunk = buf.split_to(n).freeze();
            if !sender.send(chunk).await {
                return discard(stream, buf, remaining, res).await;
            }
        }
        if remaining == 0 {
            return Ok(BodyOutcome::Complete);
        }

        let read = tokio::select! {
            read = stream.read_buf(&mut *buf) => Some(read),
            () = sender.closed() => None,
        };
        match read {
            None => return discard(stream, buf, remaining, res).await,
            Some(Ok(0)) => {
                res.mark_closed();
                sender
                    .fail(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-body"))
                    .await;
                return Ok(BodyOutcome::Disconnected);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                res.mark_closed();
                sender.fail(io::Error::new(e.kind(), e.to_string())).await;
                return Err(e);
            }
        }
    }
}

async fn discard(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut remaining: usize,
    res: &ResponseContext,
) -> io::Result<BodyOutcome> {
    loop {
        let n = buf.len().min(remaining);
        let _ = buf.split_to(n);
        remaining -= n;
        if remaining == 0 {
            return Ok(BodyOutcome::Complete);
        }

        match tokio::time::timeout(DRAIN_TIMEOUT, stream.read_buf(&mut *buf)).await {
            Err(_) => return Ok(BodyOutcome::Abandoned),
            Ok(Ok(0)) => {
                res.mark_closed();
                return Ok(BodyOutcome::Disconnected);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
        }
    }
}

fn head_error(err: HeadError) -> RouteError {
    match err {
        HeadError::UrlTooLong { limit } => RouteError::UrlTooLong { limit },
        HeadError::HeaderTooLarge { limit } => RouteError::HeaderTooLarge { limit },
        other => HttpError::new(400, format!("Bad Request: {other}")).into(),
    }
}

// Writes the error envelope for a request rejected before dispatch, then closes.
async fn reject(stream: &mut TcpStream, err: RouteError) -> io::Result<()> {
    let payload = serde_json::to_vec(&err.envelope()).unwrap_or_default();
    let response = Response::new(err.status())
        .header("Content-Type", "application/json")
        .body_bytes(payload)
        .keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}
