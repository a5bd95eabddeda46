//! Error taxonomy for routing and dispatch.
//!
//! - [`ConfigurationError`] is returned synchronously by route registration and never
//!   reaches request handling.
//! - [`RouteError`] is everything that can go wrong while a request is being dispatched.
//!   It travels through the owning router's error classifier and, when nobody consumes it,
//!   ends up rendered as an [`ErrorEnvelope`].
//! - [`HttpError`] is the typed status error handlers raise to choose the response status.
//! - [`ParseError`] is returned by [`crate::context::RequestContext::json`].

use std::error::Error as StdError;
use std::io;

use serde::Serialize;
use thiserror::Error;

use crate::http::StatusCode;

/// Message used when an untyped failure is rendered.
pub const GENERIC_SERVER_ERROR: &str = "Server error";

/// Failure raised while registering a route.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("validator for parameter `{name}` is not a valid expression: {source}")]
    InvalidValidator {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("validator for parameter `{name}` must not be case-insensitive")]
    CaseInsensitiveValidator { name: String },

    #[error("validator given for `{name}`, which the route does not declare")]
    UnknownParameter { name: String },

    #[error("parameter `{name}` appears more than once in `{template}`")]
    DuplicateParameter { name: String, template: String },

    #[error("route template `{template}` did not compile: {source}")]
    InvalidTemplate {
        template: String,
        #[source]
        source: regex::Error,
    },
}

/// Malformed request body requested through the JSON accessor.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("request body is not valid JSON: {0}")]
    Syntax(String),

    #[error("request body does not have the expected shape: {0}")]
    Shape(#[source] serde_json::Error),

    #[error("request body could not be read: {0}")]
    Body(String),
}

/// A failure with an explicit HTTP status, raised by handlers.
///
/// Codes without a known reason phrase are coerced to `500` at construction.
///
/// # Examples
///
/// ```
/// use switchyard::error::HttpError;
/// use switchyard::http::StatusCode;
///
/// let err = HttpError::new(403, "Forbidden");
/// assert_eq!(err.status(), StatusCode::Forbidden);
///
/// let odd = HttpError::new(999, "teapot overflow");
/// assert_eq!(odd.status(), StatusCode::InternalServerError);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {message}")]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    /// Creates a typed status error from a numeric code.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(code).unwrap_or(StatusCode::InternalServerError),
            message: message.into(),
        }
    }

    /// Returns the (possibly coerced) status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the caller-supplied message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<StatusCode> for HttpError {
    fn from(status: StatusCode) -> Self {
        Self {
            status,
            message: status.canonical_reason().to_owned(),
        }
    }
}

/// Errors raised while a request is being dispatched.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route matched the request")]
    NotFound,

    #[error(transparent)]
    Status(#[from] HttpError),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("request target exceeds {limit} bytes")]
    UrlTooLong { limit: usize },

    #[error("request header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("timed out waiting for the request body")]
    RequestTimeout,

    #[error("request body stream failed: {0}")]
    Body(#[source] io::Error),

    #[error("request body was already consumed by a failed read")]
    BodyConsumed,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("handler failed: {0}")]
    Handler(#[source] Box<dyn StdError + Send + Sync>),
}

impl RouteError {
    /// Wraps an arbitrary handler failure.
    pub fn handler(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Handler(err.into())
    }

    /// Status code this error renders with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NotFound,
            Self::Status(e) => e.status(),
            Self::PayloadTooLarge { .. } => StatusCode::PayloadTooLarge,
            Self::UrlTooLong { .. } => StatusCode::UriTooLong,
            Self::HeaderTooLarge { .. } => StatusCode::RequestHeaderFieldsTooLarge,
            Self::RequestTimeout => StatusCode::RequestTimeout,
            Self::Body(_) | Self::BodyConsumed => StatusCode::BadRequest,
            Self::Parse(_) | Self::Handler(_) => StatusCode::InternalServerError,
        }
    }

    /// Builds the wire envelope for this error.
    ///
    /// Typed status errors keep their message; the framework's own conditions use the
    /// reason phrase; everything else is reported as a generic server error.
    pub fn envelope(&self) -> ErrorEnvelope {
        let status = self.status();
        let message = match self {
            Self::Status(e) => e.message().to_owned(),
            Self::Parse(_) | Self::Handler(_) => GENERIC_SERVER_ERROR.to_owned(),
            _ => status.canonical_reason().to_owned(),
        };
        ErrorEnvelope::new(status, message)
    }
}

impl From<io::Error> for RouteError {
    fn from(err: io::Error) -> Self {
        Self::Handler(Box::new(err))
    }
}

impl From<serde_json::Error> for RouteError {
    fn from(err: serde_json::Error) -> Self {
        Self::Handler(Box::new(err))
    }
}

/// JSON body written for errors that reach the default renderer.
///
/// ```json
/// { "statusCode": 404, "error": "Not Found", "message": "Not Found" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub status_code: u16,
    pub error: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code: status.as_u16(),
            error: status.canonical_reason().to_owned(),
            message: message.into(),
        }
    }
}
