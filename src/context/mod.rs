//! Per-request and per-response state shared by every handler a request reaches.
//!
//! A [`RequestContext`] wraps the transport's [`RequestHead`] and adds the router-owned
//! fields: merged path parameters, the rewritten `route_url` of nested dispatch, parsed
//! query and cookies, a type-keyed extension map, the memoized body and the request
//! timeline. Both contexts are cheap handles; clones share state, so every handler that
//! matches a request observes the same params, body and response.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::error::{ParseError, RouteError};
use crate::http::{Headers, Method, RequestHead};

pub mod body;
pub mod response;

pub use body::{BodyLimits, BodySender, BodyStream};
pub use response::{Completion, Delivery, ResponseContext};

/// Type-erased request extensions map — used to pass per-request state between handlers
/// that share a pattern without either knowing the other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Insert a value, replacing any previous value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Get a value from the extensions map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }
}

/// Path parameters merged from every pattern a request matched.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Params {
    map: HashMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing the previous value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Get a value from the parameters map
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

struct Inner {
    head: RequestHead,
    query: Vec<(String, String)>,
    cookies: HashMap<String, String>,
    route_url: Mutex<Option<String>>,
    params: Mutex<Params>,
    extensions: Mutex<Extensions>,
    stream: Mutex<Option<BodyStream>>,
    limits: BodyLimits,
    body: OnceCell<Bytes>,
    text: OnceLock<String>,
    json: OnceLock<Result<serde_json::Value, String>>,
    connected_at: Instant,
    body_ended_at: OnceLock<Instant>,
}

/// Router-side view of one inbound request.
///
/// # Examples
///
/// ```
/// use switchyard::context::{BodyStream, RequestContext};
/// use switchyard::http::{Headers, Method, RequestHead};
///
/// let mut headers = Headers::new();
/// headers.insert("Cookie", "session=abc; theme=dark");
/// let head = RequestHead::new(Method::Get, "/search?q=rust+lang", headers);
/// let req = RequestContext::new(head, BodyStream::empty());
///
/// assert_eq!(req.query_param("q"), Some("rust lang"));
/// assert_eq!(req.cookie("theme"), Some("dark"));
/// ```
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

impl RequestContext {
    /// Creates a context with no body limits.
    pub fn new(head: RequestHead, body: BodyStream) -> Self {
        Self::with_limits(head, body, BodyLimits::default())
    }

    /// Creates a context whose body is drained under `limits`.
    pub fn with_limits(head: RequestHead, body: BodyStream, limits: BodyLimits) -> Self {
        let query = head
            .query_string()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        let cookies = head
            .headers()
            .get("cookie")
            .map(parse_cookies)
            .unwrap_or_default();

        Self {
            inner: Arc::new(Inner {
                head,
                query,
                cookies,
                route_url: Mutex::new(None),
                params: Mutex::new(Params::new()),
                extensions: Mutex::new(Extensions::default()),
                stream: Mutex::new(Some(body)),
                limits,
                body: OnceCell::new(),
                text: OnceLock::new(),
                json: OnceLock::new(),
                connected_at: Instant::now(),
                body_ended_at: OnceLock::new(),
            }),
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.inner.head
    }

    pub fn method(&self) -> &Method {
        self.inner.head.method()
    }

    /// The raw request path, unaffected by nested dispatch.
    pub fn path(&self) -> &str {
        self.inner.head.path()
    }

    pub fn headers(&self) -> &Headers {
        self.inner.head.headers()
    }

    /// The remainder handed down by the innermost mount traversed so far, including the
    /// original query string. `None` until a mount entry has been evaluated.
    pub fn route_url(&self) -> Option<String> {
        self.inner.route_url.lock().clone()
    }

    pub(crate) fn set_route_url(&self, url: String) {
        *self.inner.route_url.lock() = Some(url);
    }

    /// Path the current router resolves against: the `route_url` path if a mount has
    /// rewritten it, the raw request path otherwise.
    pub(crate) fn working_path(&self) -> String {
        match self.inner.route_url.lock().as_deref() {
            Some(url) => url.split('?').next().unwrap_or_default().to_owned(),
            None => self.path().to_owned(),
        }
    }

    /// Snapshot of every parameter captured so far.
    pub fn params(&self) -> Params {
        self.inner.params.lock().clone()
    }

    /// Value of a single captured parameter.
    pub fn param(&self, name: &str) -> Option<String> {
        self.inner.params.lock().get(name).map(str::to_owned)
    }

    // Extracted values win for their own keys; keys set by enclosing matches stay.
    pub(crate) fn merge_params(&self, captured: Vec<(String, String)>) {
        let mut params = self.inner.params.lock();
        for (key, value) in captured {
            params.insert(key, value);
        }
    }

    /// Decoded query pairs in their original order.
    pub fn query(&self) -> &[(String, String)] {
        &self.inner.query
    }

    /// First value for `key` in the query string.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.inner
            .query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.inner.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.inner.cookies.get(name).map(String::as_str)
    }

    /// Stores a value for handlers that run later for this request.
    pub fn insert_extension<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.inner.extensions.lock().insert(value);
    }

    /// Returns a clone of the value of type `T` stored by an earlier handler.
    pub fn extension<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner.extensions.lock().get::<T>().cloned()
    }

    /// When the context was created.
    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    /// When the body stream ended, if it has been drained.
    pub fn body_ended_at(&self) -> Option<Instant> {
        self.inner.body_ended_at.get().copied()
    }

    /// The buffered request body.
    ///
    /// The first call drains the transport stream; every later call, from any handler,
    /// returns the same buffer.
    ///
    /// # Errors
    ///
    /// Propagates the limit and transport failures of the drain. A drain that failed
    /// leaves the stream consumed, so later calls report [`RouteError::BodyConsumed`].
    pub async fn body(&self) -> Result<Bytes, RouteError> {
        let body = self
            .inner
            .body
            .get_or_try_init(|| async {
                let stream = self.inner.stream.lock().take();
                let mut stream = stream.ok_or(RouteError::BodyConsumed)?;
                let bytes = body::accumulate(&mut stream, self.inner.limits).await?;
                let _ = self.inner.body_ended_at.set(Instant::now());
                Ok::<_, RouteError>(bytes)
            })
            .await?;
        Ok(body.clone())
    }

    /// The body decoded as UTF-8 (lossily), decoded once per request.
    pub async fn text(&self) -> Result<&str, RouteError> {
        let body = self.body().await?;
        Ok(self
            .inner
            .text
            .get_or_init(|| String::from_utf8_lossy(&body).into_owned()))
    }

    /// The body parsed as JSON and deserialized into `T`.
    ///
    /// The body is parsed once per request; each call only deserializes the parsed value.
    ///
    /// # Errors
    ///
    /// [`ParseError::Syntax`] for malformed JSON, [`ParseError::Shape`] when the value does
    /// not fit `T`, [`ParseError::Body`] when the body could not be read.
    pub async fn json<T>(&self) -> Result<T, ParseError>
    where
        T: DeserializeOwned,
    {
        let text = self
            .text()
            .await
            .map_err(|e| ParseError::Body(e.to_string()))?;
        let parsed = self
            .inner
            .json
            .get_or_init(|| serde_json::from_str(text).map_err(|e| e.to_string()));

        match parsed {
            Ok(value) => T::deserialize(value).map_err(ParseError::Shape),
            Err(message) => Err(ParseError::Syntax(message.clone())),
        }
    }
}

// `name=value` pairs separated by `;`, whitespace-trimmed.
fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}
