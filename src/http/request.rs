//! HTTP/1.1 request-head parsing using the [`httparse`] crate.
//!
//! Only the request line and header block are parsed here. The body is handed to the
//! router separately as a chunk stream (see [`crate::context::BodyStream`]).

use thiserror::Error;

use super::{Headers, Method};

/// Size limits applied while parsing a request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Longest request target (path plus query) accepted, in bytes.
    pub max_url_length: usize,
    /// Largest header block (request line included) accepted, in bytes.
    pub max_header_size: usize,
    /// Maximum number of header fields.
    pub max_headers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_url_length: 2048,
            max_header_size: 16 * 1024,
            max_headers: 64,
        }
    }
}

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request target exceeds {limit} bytes")]
    UrlTooLong { limit: usize },

    #[error("request header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },
}

/// A parsed HTTP/1.1 request line plus headers.
///
/// # Examples
///
/// ```
/// use switchyard::http::{Limits, RequestHead};
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (head, _offset) = RequestHead::parse(raw, &Limits::default()).unwrap();
///
/// assert_eq!(head.method().as_str(), "GET");
/// assert_eq!(head.path(), "/hello");
/// assert_eq!(head.query_string(), Some("name=world"));
/// assert_eq!(head.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
}

impl RequestHead {
    /// Builds a head directly, without going through the wire parser.
    ///
    /// `target` may carry a query string (`/search?q=rust`).
    pub fn new(method: Method, target: &str, headers: Headers) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            path,
            version: 1,
            headers,
            query,
        }
    }

    /// Parse a raw request head from a byte slice.
    ///
    /// Returns the parsed head and the byte offset at which the body begins in `buf`
    /// (immediately after the `\r\n\r\n` header terminator).
    ///
    /// # Errors
    ///
    /// - [`HeadError::Incomplete`] — more data is needed to complete the headers.
    /// - [`HeadError::HeaderTooLarge`] — the header block is bigger than `limits` allow,
    ///   whether or not it is complete yet.
    /// - [`HeadError::UrlTooLong`] — the request target is longer than `limits` allow.
    /// - [`HeadError::Parse`] — the data is malformed.
    /// - [`HeadError::MissingField`] — a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8], limits: &Limits) -> Result<(Self, usize), HeadError> {
        let mut headers = vec![httparse::EMPTY_HEADER; limits.max_headers];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => {
                if buf.len() > limits.max_header_size {
                    return Err(HeadError::HeaderTooLarge {
                        limit: limits.max_header_size,
                    });
                }
                return Err(HeadError::Incomplete);
            }
        };

        if body_offset > limits.max_header_size {
            return Err(HeadError::HeaderTooLarge {
                limit: limits.max_header_size,
            });
        }

        let method: Method = match raw_req.method {
            Some(m) => match m.parse() {
                Ok(method) => method,
                Err(never) => match never {},
            },
            None => return Err(HeadError::MissingField { field: "method" }),
        };

        let target = raw_req
            .path
            .ok_or(HeadError::MissingField { field: "path" })?;

        if target.len() > limits.max_url_length {
            return Err(HeadError::UrlTooLong {
                limit: limits.max_url_length,
            });
        }

        let version = raw_req
            .version
            .ok_or(HeadError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let (path, query) = split_target(target);

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

// Split `/path?query` into its path and optional query parts.
fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (head, offset) = RequestHead::parse(raw, &Limits::default()).unwrap();
        assert_eq!(head.method().as_str(), "GET");
        assert_eq!(head.path(), "/");
        assert_eq!(head.version(), 1);
        assert_eq!(head.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn parse_query_string() {
        let raw = b"GET /search?q=rust&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (head, _) = RequestHead::parse(raw, &Limits::default()).unwrap();
        assert_eq!(head.path(), "/search");
        assert_eq!(head.query_string(), Some("q=rust&page=2"));
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(
            RequestHead::parse(raw, &Limits::default()),
            Err(HeadError::Incomplete)
        ));
    }

    #[test]
    fn url_too_long_is_rejected() {
        let limits = Limits {
            max_url_length: 8,
            ..Limits::default()
        };
        let raw = b"GET /0123456789 HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert!(matches!(
            RequestHead::parse(raw, &limits),
            Err(HeadError::UrlTooLong { limit: 8 })
        ));
    }

    #[test]
    fn oversized_partial_header_is_rejected() {
        let limits = Limits {
            max_header_size: 32,
            ..Limits::default()
        };
        let raw = b"GET / HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        assert!(matches!(
            RequestHead::parse(raw, &limits),
            Err(HeadError::HeaderTooLarge { limit: 32 })
        ));
    }

    #[test]
    fn keep_alive_http11_default() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (head, _) = RequestHead::parse(raw, &Limits::default()).unwrap();
        assert!(head.is_keep_alive());
    }

    #[test]
    fn connection_close() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let (head, _) = RequestHead::parse(raw, &Limits::default()).unwrap();
        assert!(!head.is_keep_alive());
    }

    #[test]
    fn content_length() {
        let raw = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let (head, body_offset) = RequestHead::parse(raw, &Limits::default()).unwrap();
        assert_eq!(head.content_length(), Some(5));
        assert_eq!(&raw[body_offset..], b"hello");
    }

    #[test]
    fn new_splits_target() {
        let head = RequestHead::new(Method::Get, "/a/b?x=1", Headers::new());
        assert_eq!(head.path(), "/a/b");
        assert_eq!(head.query_string(), Some("x=1"));
    }
}
