//! Outbound response surface handed to handlers.
//!
//! A [`ResponseContext`] collects status, headers and body writes and turns them into a
//! single wire [`Response`] when it is finalized. Finalization happens at most once:
//! later calls to [`ResponseContext::end`] are no-ops, so the transport receives one
//! response and each completion observer fires once.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use crate::error::RouteError;
use crate::http::{Headers, Response, StatusCode};

use super::RequestContext;

/// Summary passed to completion observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub status: StatusCode,
    /// Length of the body as sent, after content encoding.
    pub body_len: usize,
    /// Time from context creation to finalization.
    pub elapsed: Duration,
}

/// Observer notified when a response is finalized.
pub type CompletionObserver = Arc<dyn Fn(&Completion) + Send + Sync + 'static>;

/// Content codings the response can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Gzip,
    Deflate,
}

impl Coding {
    fn as_str(self) -> &'static str {
        match self {
            Coding::Gzip => "gzip",
            Coding::Deflate => "deflate",
        }
    }
}

// Body sink, chosen on the first write and fixed for the rest of the response.
enum Encoder {
    Identity(BytesMut),
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(DeflateEncoder<Vec<u8>>),
}

impl Encoder {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Encoder::Identity(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Encoder::Gzip(enc) => enc.write_all(data),
            Encoder::Deflate(enc) => enc.write_all(data),
        }
    }

    fn finish(self) -> io::Result<Bytes> {
        match self {
            Encoder::Identity(buf) => Ok(buf.freeze()),
            Encoder::Gzip(enc) => enc.finish().map(Bytes::from),
            Encoder::Deflate(enc) => enc.finish().map(Bytes::from),
        }
    }
}

struct State {
    status: StatusCode,
    headers: Headers,
    encoder: Option<Encoder>,
    finished: bool,
    delivery: Option<oneshot::Sender<Response>>,
    // Observers of every router the request traversed, keyed by router identity.
    scopes: Vec<(usize, Vec<CompletionObserver>)>,
}

struct Shared {
    accept_encoding: Option<String>,
    compression: bool,
    closed: AtomicBool,
    started: Instant,
}

/// Handle through which handlers build the response.
///
/// Clones share state; every handler that matches a request writes to the same response.
///
/// # Examples
///
/// ```
/// use switchyard::context::ResponseContext;
/// use switchyard::http::StatusCode;
///
/// let (res, mut delivery) = ResponseContext::new();
/// res.set_status(StatusCode::Created);
/// res.write("hello").unwrap();
/// assert!(res.end());
/// assert!(!res.end());
///
/// let response = delivery.try_recv().unwrap();
/// assert_eq!(response.status(), StatusCode::Created);
/// assert_eq!(&response.body_ref()[..], b"hello");
/// ```
#[derive(Clone)]
pub struct ResponseContext {
    state: Arc<Mutex<State>>,
    shared: Arc<Shared>,
}

/// Receiving end of a finalized response, held by the transport.
pub struct Delivery {
    rx: oneshot::Receiver<Response>,
}

impl Delivery {
    /// Waits for the response; `None` if every context handle was dropped unfinished.
    pub async fn recv(self) -> Option<Response> {
        self.rx.await.ok()
    }

    /// Takes the response if it has already been finalized.
    pub fn try_recv(&mut self) -> Option<Response> {
        self.rx.try_recv().ok()
    }
}

impl ResponseContext {
    /// A response with compression disabled.
    pub fn new() -> (Self, Delivery) {
        Self::build(None, false)
    }

    /// A response that negotiates its content encoding against `req`'s
    /// `Accept-Encoding` when `compression` is on.
    pub fn for_request(req: &RequestContext, compression: bool) -> (Self, Delivery) {
        Self::build(req.headers().joined("accept-encoding"), compression)
    }

    fn build(accept_encoding: Option<String>, compression: bool) -> (Self, Delivery) {
        let (tx, rx) = oneshot::channel();
        let ctx = Self {
            state: Arc::new(Mutex::new(State {
                status: StatusCode::Ok,
                headers: Headers::new(),
                encoder: None,
                finished: false,
                delivery: Some(tx),
                scopes: Vec::new(),
            })),
            shared: Arc::new(Shared {
                accept_encoding,
                compression,
                closed: AtomicBool::new(false),
                started: Instant::now(),
            }),
        };
        (ctx, Delivery { rx })
    }

    pub fn status(&self) -> StatusCode {
        self.state.lock().status
    }

    pub fn set_status(&self, status: StatusCode) {
        self.state.lock().status = status;
    }

    /// Sets `name`, replacing earlier values.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.lock().headers.set(name, value);
    }

    /// Adds another value for `name`.
    pub fn append_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.lock().headers.insert(name, value);
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.state.lock().headers.get(name).map(str::to_owned)
    }

    /// The coding chosen for this response, once the first write has happened.
    pub fn coding(&self) -> Option<Coding> {
        match self.state.lock().encoder {
            Some(Encoder::Gzip(_)) => Some(Coding::Gzip),
            Some(Encoder::Deflate(_)) => Some(Coding::Deflate),
            Some(Encoder::Identity(_)) | None => None,
        }
    }

    /// Appends body bytes, passing them through the negotiated encoder.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::BrokenPipe`] once the response has been finalized.
    pub fn write(&self, data: impl AsRef<[u8]>) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "response already finished",
            ));
        }
        let State {
            encoder, headers, ..
        } = &mut *state;
        encoder
            .get_or_insert_with(|| self.negotiate(headers))
            .write(data.as_ref())
    }

    /// Serializes `data` as the JSON body.
    ///
    /// Sets `Content-Type: application/json`, applies `status` when given, writes the
    /// serialized value and finalizes the response when `finalize` is `true`.
    pub fn json<T>(&self, data: &T, status: Option<StatusCode>, finalize: bool) -> Result<(), RouteError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(data)?;
        if let Some(status) = status {
            self.set_status(status);
        }
        self.set_header("Content-Type", "application/json");
        self.write(payload)?;
        if finalize {
            self.end();
        }
        Ok(())
    }

    /// Writes `data` and finalizes.
    pub fn end_with(&self, data: impl AsRef<[u8]>) -> io::Result<bool> {
        self.write(data)?;
        Ok(self.end())
    }

    /// Finalizes the response.
    ///
    /// Returns `true` for the call that actually finalized, `false` for every later call.
    /// Completion observers run after the response has been handed to the transport,
    /// innermost router first.
    pub fn end(&self) -> bool {
        let (response, delivery, scopes) = {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            state.finished = true;

            let body = match state.encoder.take() {
                Some(encoder) => encoder.finish(),
                None => Ok(Bytes::new()),
            };
            let body = body.unwrap_or_else(|e| {
                warn!(error = %e, "content encoder failed to flush");
                Bytes::new()
            });
            let response = Response::new(state.status)
                .with_headers(std::mem::take(&mut state.headers))
                .body_bytes(body);
            (
                response,
                state.delivery.take(),
                std::mem::take(&mut state.scopes),
            )
        };

        let completion = Completion {
            status: response.status(),
            body_len: response.body_ref().len(),
            elapsed: self.shared.started.elapsed(),
        };

        if let Some(delivery) = delivery {
            if delivery.send(response).is_err() {
                self.mark_closed();
            }
        }

        for (_, observers) in scopes.iter().rev() {
            for observer in observers {
                observer(&completion);
            }
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// `true` once the transport reported the connection gone.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Called by the transport when the peer disconnects.
    pub fn mark_closed(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    /// Drops the status, headers and buffered body of an unfinished response, including a
    /// negotiated encoder. Returns `false` once the response has been finalized.
    pub(crate) fn reset(&self) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        state.status = StatusCode::Ok;
        state.headers = Headers::new();
        state.encoder = None;
        true
    }

    // Registers a router's observers for this request; a router entered twice counts once.
    // Returns `true` only when this call added the scope.
    pub(crate) fn enter_scope(&self, scope: usize, observers: &[CompletionObserver]) -> bool {
        let mut state = self.state.lock();
        if state.finished || state.scopes.iter().any(|(id, _)| *id == scope) {
            return false;
        }
        state.scopes.push((scope, observers.to_vec()));
        true
    }

    // Withdraws a scope registered by a router that ended up matching nothing.
    pub(crate) fn leave_scope(&self, scope: usize) {
        self.state.lock().scopes.retain(|(id, _)| *id != scope);
    }

    fn negotiate(&self, headers: &mut Headers) -> Encoder {
        let coding = if self.shared.compression && !headers.contains("content-encoding") {
            self.shared
                .accept_encoding
                .as_deref()
                .and_then(negotiate_coding)
        } else {
            None
        };

        let encoder = match coding {
            Some(Coding::Gzip) => Encoder::Gzip(GzEncoder::new(Vec::new(), Compression::default())),
            Some(Coding::Deflate) => {
                Encoder::Deflate(DeflateEncoder::new(Vec::new(), Compression::default()))
            }
            None => Encoder::Identity(BytesMut::new()),
        };

        if let Some(coding) = coding {
            headers.set("Content-Encoding", coding.as_str());
            headers.insert("Vary", "Accept-Encoding");
        }
        encoder
    }
}

/// Picks a coding from an `Accept-Encoding` value: gzip over deflate, skipping codings
/// with `q=0` and honoring `*` for codings not listed explicitly.
pub fn negotiate_coding(accept: &str) -> Option<Coding> {
    let mut wildcard: Option<bool> = None;
    let mut gzip: Option<bool> = None;
    let mut deflate: Option<bool> = None;

    for item in accept.split(',') {
        let mut parts = item.split(';');
        let name = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let acceptable = parts
            .filter_map(|p| p.trim().strip_prefix("q="))
            .next()
            .and_then(|q| q.trim().parse::<f32>().ok())
            .map(|q| q > 0.0)
            .unwrap_or(true);

        match name.as_str() {
            "gzip" | "x-gzip" => gzip = Some(acceptable),
            "deflate" => deflate = Some(acceptable),
            "*" => wildcard = Some(acceptable),
            _ => {}
        }
    }

    let wildcard = wildcard.unwrap_or(false);
    if gzip.unwrap_or(wildcard) {
        Some(Coding::Gzip)
    } else if deflate.unwrap_or(wildcard) {
        Some(Coding::Deflate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::context::BodyStream;
    use crate::http::{Method, RequestHead};

    fn compressed(accept: &str) -> (ResponseContext, Delivery) {
        let mut headers = Headers::new();
        headers.insert("Accept-Encoding", accept);
        let req = RequestContext::new(
            RequestHead::new(Method::Get, "/", headers),
            BodyStream::empty(),
        );
        ResponseContext::for_request(&req, true)
    }

    #[test]
    fn negotiation_prefers_gzip() {
        assert_eq!(negotiate_coding("deflate, gzip"), Some(Coding::Gzip));
        assert_eq!(negotiate_coding("deflate"), Some(Coding::Deflate));
        assert_eq!(negotiate_coding("gzip;q=0, deflate"), Some(Coding::Deflate));
        assert_eq!(negotiate_coding("br"), None);
        assert_eq!(negotiate_coding("*"), Some(Coding::Gzip));
        assert_eq!(negotiate_coding("*;q=0, identity"), None);
    }

    #[test]
    fn end_is_idempotent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let observer: CompletionObserver = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (res, mut delivery) = ResponseContext::new();
        res.enter_scope(1, &[observer]);
        assert!(res.end());
        assert!(!res.end());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(delivery.try_recv().is_some());
        assert!(res.write("late").is_err());
    }

    #[test]
    fn scopes_fire_innermost_first_and_once_each() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let observer = |tag: &'static str| -> CompletionObserver {
            let order = Arc::clone(&order);
            Arc::new(move |_| order.lock().push(tag))
        };

        let (res, _delivery) = ResponseContext::new();
        res.enter_scope(1, &[observer("outer")]);
        res.enter_scope(2, &[observer("inner")]);
        res.enter_scope(1, &[observer("outer-again")]);
        res.end();
        assert_eq!(*order.lock(), vec!["inner", "outer"]);
    }

    #[test]
    fn reset_discards_partial_output() {
        let (res, mut delivery) = compressed("gzip");
        res.set_header("X-Trace", "1");
        res.write("partial").unwrap();
        assert_eq!(res.coding(), Some(Coding::Gzip));

        assert!(res.reset());
        assert_eq!(res.coding(), None);
        assert!(res.header("content-encoding").is_none());
        assert!(res.header("x-trace").is_none());
        res.end();
        assert!(!res.reset());

        let response = delivery.try_recv().unwrap();
        assert!(response.body_ref().is_empty());
    }

    #[test]
    fn left_scope_does_not_fire() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let observer: CompletionObserver = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (res, _delivery) = ResponseContext::new();
        assert!(res.enter_scope(7, &[observer]));
        assert!(!res.enter_scope(7, &[]));
        res.leave_scope(7);
        res.end();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn json_sets_content_type_and_status() {
        let (res, mut delivery) = ResponseContext::new();
        res.json(&serde_json::json!({"ok": true}), Some(StatusCode::Accepted), true)
            .unwrap();
        let response = delivery.try_recv().unwrap();
        assert_eq!(response.status(), StatusCode::Accepted);
        assert_eq!(response.headers().get("content-type"), Some("application/json"));
        assert_eq!(&response.body_ref()[..], br#"{"ok":true}"#);
    }

    #[test]
    fn json_without_finalize_leaves_response_open() {
        let (res, _delivery) = ResponseContext::new();
        res.json(&[1, 2, 3], None, false).unwrap();
        assert!(!res.is_finished());
    }

    #[test]
    fn gzip_is_applied_to_all_writes() {
        let (res, mut delivery) = compressed("gzip, deflate");
        res.write("hello ").unwrap();
        res.write("world").unwrap();
        assert_eq!(res.coding(), Some(Coding::Gzip));
        res.end();

        let response = delivery.try_recv().unwrap();
        assert_eq!(response.headers().get("content-encoding"), Some("gzip"));
        let mut decoded = String::new();
        GzDecoder::new(&response.body_ref()[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "hello world");
    }

    #[test]
    fn compression_disabled_writes_identity() {
        let (res, mut delivery) = ResponseContext::new();
        res.write("plain").unwrap();
        res.end();
        let response = delivery.try_recv().unwrap();
        assert!(response.headers().get("content-encoding").is_none());
        assert_eq!(&response.body_ref()[..], b"plain");
    }

    #[test]
    fn dropped_transport_marks_closed() {
        let (res, delivery) = ResponseContext::new();
        drop(delivery);
        assert!(!res.is_closed());
        res.end();
        assert!(res.is_closed());
    }
}
