//! Request routing — map methods and path patterns to handlers, possibly many per request.
//!
//! This module provides [`Router`], which dispatches a request to **every** registered
//! entry whose method and path match, strictly in registration order, awaiting each
//! handler before evaluating the next entry. Overlapping registrations are therefore a
//! way to layer handlers (a logging route and a business route sharing a pattern).
//!
//! | Template             | Example match       | Captured params        |
//! |----------------------|---------------------|------------------------|
//! | `/users`             | `/users`            | *(none)*               |
//! | `/users/:id`         | `/users/42`         | `id → "42"`            |
//! | `/files/:{name}.txt` | `/files/notes.txt`  | `name → "notes"`       |
//!
//! Routers nest: [`Router::mount`] registers a child router under a prefix. Errors a
//! router cannot handle itself bubble to the router that mounted it; errors that bubble
//! past the root are rendered as a JSON envelope.

use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::context::response::CompletionObserver;
use crate::context::{Completion, RequestContext, ResponseContext};
use crate::error::{ConfigurationError, RouteError};
use crate::http::{Method, StatusCode};

mod mount;
pub mod pattern;

use mount::Mount;
use pattern::Matcher;
pub use pattern::{PathSpec, RouteOptions};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result every handler resolves to.
pub type HandlerResult = Result<(), RouteError>;

/// Type-erased, heap-allocated async handler.
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be shared across connection
/// tasks without copying the underlying closure. You never construct this type directly;
/// [`Router::get`] and the other registration methods erase your closure into it.
pub type Handler = Arc<
    dyn Fn(RequestContext, ResponseContext) -> BoxFuture<'static, HandlerResult>
        + Send
        + Sync
        + 'static,
>;

/// Type-erased local error subscriber.
pub type ErrorHandler = Arc<
    dyn Fn(RouteError, RequestContext, ResponseContext) -> BoxFuture<'static, ()>
        + Send
        + Sync
        + 'static,
>;

/// Method filter of a handler entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMethod {
    /// Only requests with this method.
    Only(Method),
    /// Every method.
    All,
}

impl From<Method> for RouteMethod {
    fn from(method: Method) -> Self {
        RouteMethod::Only(method)
    }
}

enum Target {
    Handler(RouteMethod, Handler),
    // Mount entries are considered for every method.
    Mount(Mount),
}

// A single registered entry: matcher plus what to run on a qualifying match.
struct RouteEntry {
    matcher: Matcher,
    target: Target,
}

impl RouteEntry {
    fn accepts(&self, method: &Method) -> bool {
        match &self.target {
            Target::Handler(RouteMethod::Only(m), _) => m == method,
            Target::Handler(RouteMethod::All, _) | Target::Mount(_) => true,
        }
    }
}

/// Multi-match HTTP request router.
///
/// Routes are registered before the router starts serving; the table is not meant to be
/// changed while requests are in flight. Registration fails fast with a
/// [`ConfigurationError`] for invalid parameter validators.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::router::{Router, RouteOptions};
/// use switchyard::http::Method;
///
/// # fn main() -> Result<(), switchyard::error::ConfigurationError> {
/// let mut router = Router::new();
///
/// router.get("/ping", |_req, res| async move {
///     res.end_with("pong")?;
///     Ok(())
/// })?;
///
/// router.route(
///     Method::Get,
///     "/users/:id",
///     |req, res| async move {
///         let id = req.param("id").unwrap_or_default();
///         res.json(&serde_json::json!({ "id": id }), None, true)
///     },
///     RouteOptions::new().param("id", "^[0-9]+$"),
/// )?;
/// # Ok(())
/// # }
/// ```
pub struct Router {
    routes: Vec<RouteEntry>,
    error_handler: Option<ErrorHandler>,
    observers: Vec<CompletionObserver>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use switchyard::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            error_handler: None,
            observers: Vec::new(),
        }
    }

    /// Register a handler for `method` (or every method) on `path`, with per-parameter
    /// validators.
    ///
    /// # Arguments
    ///
    /// - `method` — a [`Method`] or [`RouteMethod::All`].
    /// - `path` — a template (`"/users/:id"`, `"/files/:{name}.txt"`) or a raw
    ///   [`regex::Regex`] whose named groups become parameters.
    /// - `handler` — async function receiving the request and response contexts.
    /// - `options` — validators for captured parameters.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError`] if a validator is invalid, case-insensitive, or names a
    /// parameter the path does not declare, or if the template repeats a name.
    pub fn route<H, F>(
        &mut self,
        method: impl Into<RouteMethod>,
        path: impl Into<PathSpec>,
        handler: H,
        options: RouteOptions,
    ) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        let matcher = pattern::compile(&path.into(), &options)?;
        let handler: Handler = Arc::new(move |req, res| {
            Box::pin(handler(req, res)) as BoxFuture<'static, HandlerResult>
        });
        self.routes.push(RouteEntry {
            matcher,
            target: Target::Handler(method.into(), handler),
        });
        Ok(self)
    }

    /// Register a handler for `GET` requests matching `path`.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use switchyard::Router;
    ///
    /// let mut router = Router::new();
    /// router.get("/hello", |_req, res| async move {
    ///     res.end();
    ///     Ok(())
    /// }).unwrap();
    /// ```
    pub fn get<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Get, path, handler, RouteOptions::new())
    }

    /// Register a handler for `HEAD` requests matching `path`.
    pub fn head<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Head, path, handler, RouteOptions::new())
    }

    /// Register a handler for `POST` requests matching `path`.
    pub fn post<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Post, path, handler, RouteOptions::new())
    }

    /// Register a handler for `PUT` requests matching `path`.
    pub fn put<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Put, path, handler, RouteOptions::new())
    }

    /// Register a handler for `DELETE` requests matching `path`.
    pub fn delete<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Delete, path, handler, RouteOptions::new())
    }

    /// Register a handler for `CONNECT` requests matching `path`.
    pub fn connect<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Connect, path, handler, RouteOptions::new())
    }

    /// Register a handler for `OPTIONS` requests matching `path`.
    pub fn options<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Options, path, handler, RouteOptions::new())
    }

    /// Register a handler for `TRACE` requests matching `path`.
    pub fn trace<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Trace, path, handler, RouteOptions::new())
    }

    /// Register a handler for `PATCH` requests matching `path`.
    pub fn patch<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Patch, path, handler, RouteOptions::new())
    }

    /// Register a handler for every method on `path`.
    pub fn all<H, F>(&mut self, path: impl Into<PathSpec>, handler: H) -> Result<&mut Self, ConfigurationError>
    where
        H: Fn(RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(RouteMethod::All, path, handler, RouteOptions::new())
    }

    /// Mount `child` under `path`.
    ///
    /// The mount consumes as many leading segments as `path` has; the rest of the path
    /// (plus the query string) is what `child` resolves its own routes against. `child`'s
    /// unhandled errors bubble into this router, and its completion observers fire
    /// alongside this router's.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use switchyard::Router;
    ///
    /// let mut api = Router::new();
    /// api.get("/ping", |_req, res| async move {
    ///     res.end_with("pong")?;
    ///     Ok(())
    /// }).unwrap();
    ///
    /// let mut root = Router::new();
    /// root.mount("/api", api).unwrap();
    /// ```
    pub fn mount(
        &mut self,
        path: impl Into<PathSpec>,
        child: impl Into<Arc<Router>>,
    ) -> Result<&mut Self, ConfigurationError> {
        self.mount_with(path, child, RouteOptions::new())
    }

    /// [`mount`](Self::mount) with validators for parameters in the mount prefix.
    pub fn mount_with(
        &mut self,
        path: impl Into<PathSpec>,
        child: impl Into<Arc<Router>>,
        options: RouteOptions,
    ) -> Result<&mut Self, ConfigurationError> {
        let spec = path.into();
        let matcher = pattern::compile(&spec, &options)?;
        let segments = pattern::segment_count(&spec);
        self.routes.push(RouteEntry {
            matcher,
            target: Target::Mount(Mount::new(segments, child.into())),
        });
        Ok(self)
    }

    /// Install the local error subscriber, replacing any previous one.
    ///
    /// While installed, errors raised in this router's scope (including errors bubbled
    /// from mounted children) are handed to `handler` and go no further.
    pub fn on_error<H, F>(&mut self, handler: H) -> &mut Self
    where
        H: Fn(RouteError, RequestContext, ResponseContext) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        if self.error_handler.is_some() {
            debug!("replacing local error subscriber");
        }
        self.error_handler = Some(Arc::new(move |err, req, res| {
            Box::pin(handler(err, req, res)) as BoxFuture<'static, ()>
        }));
        self
    }

    /// Add an observer fired once per finished response that passed through this router.
    pub fn on_response_complete(
        &mut self,
        observer: impl Fn(&Completion) + Send + Sync + 'static,
    ) -> &mut Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Return the number of entries (routes and mounts) registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no entries have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Root entry point: dispatch, classify, and render whatever bubbles out.
    ///
    /// Errors nobody consumed are written as
    /// `{"statusCode": …, "error": …, "message": …}` unless the connection is gone.
    pub async fn handle(&self, req: RequestContext, res: ResponseContext) {
        if let Err(err) = self.serve(req, res.clone()).await {
            render(err, &res);
        }
    }

    /// Scoped entry point.
    ///
    /// Returns `Err` only when the error leaves this router's scope, i.e. no local error
    /// subscriber is installed. A request that no entry qualifies for is a `NotFound`
    /// error of this router.
    pub fn serve<'a>(
        &'a self,
        req: RequestContext,
        res: ResponseContext,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            res.enter_scope(self.scope_id(), &self.observers);

            match self.dispatch(&req, &res).await {
                Ok(0) => self.classify(RouteError::NotFound, req, res).await,
                Ok(_) => Ok(()),
                Err(err) => self.classify(err, req, res).await,
            }
        })
    }

    // Entry point behind a mount. `Ok(false)` means none of this router's entries
    // qualified, so the mount entry does not count as a match in the parent.
    fn serve_mounted<'a>(
        &'a self,
        req: RequestContext,
        res: ResponseContext,
    ) -> BoxFuture<'a, Result<bool, RouteError>> {
        Box::pin(async move {
            match self.dispatch(&req, &res).await {
                Ok(0) => Ok(false),
                Ok(_) => Ok(true),
                Err(err) => self.classify(err, req, res).await.map(|()| true),
            }
        })
    }

    // Walk the table in registration order, running every qualifying entry in turn.
    // Returns the number of entries that ran.
    async fn dispatch(&self, req: &RequestContext, res: &ResponseContext) -> Result<usize, RouteError> {
        let working = req.working_path();
        let candidate = working.strip_prefix('/').unwrap_or(&working);
        let mut invoked = 0usize;
        let mut entered = false;

        for entry in &self.routes {
            if !entry.accepts(req.method()) {
                continue;
            }

            let captured = match &entry.target {
                Target::Mount(mount) => {
                    let (prefix, route_url) = mount.split(candidate, req.head().query_string());
                    req.set_route_url(route_url);
                    entry.matcher.matches(&prefix)
                }
                Target::Handler(..) => entry.matcher.matches(candidate),
            };
            let Some(captured) = captured else {
                continue;
            };

            req.merge_params(captured);
            debug!(
                method = %req.method(),
                path = %req.path(),
                route = %entry.matcher.describe(),
                "route matched"
            );
            entered |= res.enter_scope(self.scope_id(), &self.observers);

            req.body().await?;

            match &entry.target {
                Target::Handler(_, handler) => handler(req.clone(), res.clone()).await?,
                Target::Mount(mount) => {
                    if !mount.router().serve_mounted(req.clone(), res.clone()).await? {
                        debug!(route = %entry.matcher.describe(), "mounted router matched nothing");
                        continue;
                    }
                }
            }
            invoked += 1;
        }

        if invoked == 0 && entered {
            res.leave_scope(self.scope_id());
        }
        Ok(invoked)
    }

    // Local subscriber consumes; otherwise the error leaves this scope.
    async fn classify(&self, err: RouteError, req: RequestContext, res: ResponseContext) -> HandlerResult {
        match &self.error_handler {
            Some(handler) => {
                debug!(status = %err.status(), error = %err, "error handled locally");
                handler(err, req, res).await;
                Ok(())
            }
            None => Err(err),
        }
    }

    fn scope_id(&self) -> usize {
        self as *const Router as usize
    }
}

// Default renderer for errors that bubbled past the root router.
fn render(err: RouteError, res: &ResponseContext) {
    if res.is_closed() {
        debug!(error = %err, "connection gone; skipping error response");
        return;
    }

    let status = err.status();
    if status.as_u16() >= StatusCode::InternalServerError.as_u16() {
        error!(status = %status, error = %err, "unhandled routing error");
    } else {
        warn!(status = %status, error = %err, "request failed");
    }

    if res.is_finished() {
        debug!("response already finished; error not rendered");
        return;
    }

    res.reset();
    if let Err(e) = res.json(&err.envelope(), Some(status), true) {
        error!(error = %e, "failed to render error envelope");
        res.end();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::context::{BodyStream, Delivery};
    use crate::error::HttpError;
    use crate::http::{Headers, RequestHead, Response};

    fn request(method: Method, target: &str) -> (RequestContext, ResponseContext, Delivery) {
        let head = RequestHead::new(method, target, Headers::new());
        let req = RequestContext::new(head, BodyStream::empty());
        let (res, delivery) = ResponseContext::new();
        (req, res, delivery)
    }

    async fn run(router: &Router, method: Method, target: &str) -> Response {
        let (req, res, delivery) = request(method, target);
        router.handle(req, res.clone()).await;
        res.end();
        delivery.recv().await.unwrap()
    }

    async fn ok(_req: RequestContext, res: ResponseContext) -> HandlerResult {
        res.end();
        Ok(())
    }

    #[test]
    fn router_starts_empty() {
        let router = Router::default();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[test]
    fn registration_counts_routes_and_mounts() {
        let mut router = Router::new();
        router.get("/a", ok).unwrap().post("/b", ok).unwrap();
        router.mount("/c", Router::new()).unwrap();
        assert_eq!(router.len(), 3);
    }

    #[test]
    fn invalid_validator_fails_at_registration() {
        let mut router = Router::new();
        let err = router
            .route(
                Method::Get,
                "/user/:id",
                ok,
                RouteOptions::new().param("id", "(?i)^[a-z]+$"),
            )
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::CaseInsensitiveValidator { .. }));
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn empty_router_returns_404_envelope() {
        let router = Router::new();
        let res = run(&router, Method::Get, "/").await;
        assert_eq!(res.status(), StatusCode::NotFound);
        assert_eq!(
            &res.body_ref()[..],
            br#"{"statusCode":404,"error":"Not Found","message":"Not Found"}"#
        );
    }

    #[tokio::test]
    async fn method_must_match() {
        let mut router = Router::new();
        router.get("/hello", ok).unwrap();
        assert_eq!(run(&router, Method::Get, "/hello").await.status(), StatusCode::Ok);
        assert_eq!(
            run(&router, Method::Post, "/hello").await.status(),
            StatusCode::NotFound
        );
    }

    #[tokio::test]
    async fn all_matches_any_method() {
        let mut router = Router::new();
        router.all("/any", ok).unwrap();
        for method in [Method::Get, Method::Delete, Method::Custom("PURGE".into())] {
            assert_eq!(run(&router, method, "/any").await.status(), StatusCode::Ok);
        }
    }

    #[tokio::test]
    async fn literal_route_runs_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut router = Router::new();
        router
            .get("/once", move |_req, res| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    res.end();
                    Ok(())
                }
            })
            .unwrap();

        run(&router, Method::Get, "/once").await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validator_failure_falls_through_to_404() {
        let mut router = Router::new();
        router
            .route(
                Method::Get,
                "/user/:id",
                ok,
                RouteOptions::new().param("id", "^[0-9]+$"),
            )
            .unwrap();
        assert_eq!(
            run(&router, Method::Get, "/user/x").await.status(),
            StatusCode::NotFound
        );
        assert_eq!(run(&router, Method::Get, "/user/7").await.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn handler_error_aborts_remaining_entries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut router = Router::new();
        router
            .get("/x", |_req, _res| async { Err::<(), _>(RouteError::from(HttpError::new(409, "taken"))) })
            .unwrap()
            .get("/x", move |_req, _res| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        let res = run(&router, Method::Get, "/x").await;
        assert_eq!(res.status(), StatusCode::Conflict);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn local_subscriber_consumes_error() {
        let mut router = Router::new();
        router
            .get("/boom", |_req, _res| async { Err::<(), _>(RouteError::handler("boom")) })
            .unwrap()
            .on_error(|err, _req, res| async move {
                assert_eq!(err.status(), StatusCode::InternalServerError);
                res.set_status(StatusCode::ServiceUnavailable);
                res.end();
            });

        let res = run(&router, Method::Get, "/boom").await;
        assert_eq!(res.status(), StatusCode::ServiceUnavailable);
    }

    #[tokio::test]
    async fn later_route_runs_after_unmatched_mount() {
        let mut api = Router::new();
        api.get("/ping", ok).unwrap();

        let mut root = Router::new();
        root.mount("/api", api).unwrap();
        root.get("/api/health", |_req, res| async move {
            res.end_with("ok")?;
            Ok(())
        })
        .unwrap();

        let res = run(&root, Method::Get, "/api/health").await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(&res.body_ref()[..], b"ok");
        assert_eq!(run(&root, Method::Get, "/api/ping").await.status(), StatusCode::Ok);
        assert_eq!(
            run(&root, Method::Get, "/api/other").await.status(),
            StatusCode::NotFound
        );
    }

    #[tokio::test]
    async fn child_handler_error_still_aborts_parent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let mut api = Router::new();
        api.get("/gone", |_req, _res| async {
            Err::<(), _>(RouteError::from(HttpError::new(410, "gone")))
        })
        .unwrap();

        let mut root = Router::new();
        root.mount("/api", api).unwrap();
        root.get("/api/gone", move |_req, _res| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        let res = run(&root, Method::Get, "/api/gone").await;
        assert_eq!(res.status(), StatusCode::Gone);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_child_observers_stay_silent() {
        let child_hits = Arc::new(AtomicUsize::new(0));
        let root_hits = Arc::new(AtomicUsize::new(0));

        let mut api = Router::new();
        api.get("/ping", ok).unwrap();
        {
            let hits = Arc::clone(&child_hits);
            api.on_response_complete(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut root = Router::new();
        root.mount("/api", api).unwrap();
        root.get("/api/health", ok).unwrap();
        {
            let hits = Arc::clone(&root_hits);
            root.on_response_complete(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        run(&root, Method::Get, "/api/health").await;
        assert_eq!(child_hits.load(Ordering::SeqCst), 0);
        assert_eq!(root_hits.load(Ordering::SeqCst), 1);

        run(&root, Method::Get, "/api/ping").await;
        assert_eq!(child_hits.load(Ordering::SeqCst), 1);
        assert_eq!(root_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn envelope_replaces_partial_output() {
        let mut router = Router::new();
        router
            .get("/secret", |_req, res| async move {
                res.set_header("X-Partial", "yes");
                res.write("partial")?;
                Err::<(), _>(RouteError::from(HttpError::new(403, "Forbidden")))
            })
            .unwrap();

        let res = run(&router, Method::Get, "/secret").await;
        assert_eq!(res.status(), StatusCode::Forbidden);
        assert!(res.headers().get("x-partial").is_none());
        assert_eq!(
            &res.body_ref()[..],
            br#"{"statusCode":403,"error":"Forbidden","message":"Forbidden"}"#
        );
    }

    #[tokio::test]
    async fn closed_connection_skips_rendering() {
        let router = Router::new();
        let (req, res, mut delivery) = request(Method::Get, "/missing");
        res.mark_closed();
        router.handle(req, res.clone()).await;
        assert!(!res.is_finished());
        assert!(delivery.try_recv().is_none());
    }
}
