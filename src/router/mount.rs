//! Nested-router bridge.
//!
//! A mount is a prefix node: it knows, from registration onward, how many leading path
//! segments it consumes. At dispatch it splits the working path into that prefix (tested
//! against the mount matcher) and the remainder, which becomes the request's `route_url`
//! before the child router resolves it.

use std::sync::Arc;

use super::Router;

pub(crate) struct Mount {
    segments: usize,
    router: Arc<Router>,
}

impl Mount {
    pub(crate) fn new(segments: usize, router: Arc<Router>) -> Self {
        Self { segments, router }
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    /// Splits `candidate` (leading slash removed) into the prefix to test and the
    /// `route_url` to hand down, which keeps the original query string.
    pub(crate) fn split(&self, candidate: &str, query: Option<&str>) -> (String, String) {
        let parts: Vec<&str> = candidate.split('/').collect();
        let cut = self.segments.min(parts.len());
        let prefix = parts[..cut].join("/");

        let mut route_url = String::with_capacity(candidate.len() + 1);
        route_url.push('/');
        route_url.push_str(&parts[cut..].join("/"));
        if let Some(query) = query {
            route_url.push('?');
            route_url.push_str(query);
        }

        (prefix, route_url)
    }
}
