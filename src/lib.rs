//! # switchyard
//!
//! Multi-match request routing and dispatch for async HTTP/1.1 services.
//!
//! Every registered route whose method and path match a request runs, in registration
//! order. Routers nest under path prefixes, the request body is buffered at most once
//! and shared by every handler, and errors nobody handles become a JSON envelope.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchyard::{Router, ServerConfig};
//! use switchyard::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut api = Router::new();
//!     api.get("/users/:id", |req, res| async move {
//!         let id = req.param("id").unwrap_or_default();
//!         res.json(&serde_json::json!({ "id": id }), None, true)
//!     })?;
//!
//!     let mut root = Router::new();
//!     root.all("/api/users/:id", |req, _res| async move {
//!         tracing::info!(path = req.path(), "request seen");
//!         Ok(())
//!     })?;
//!     root.mount("/api", api)?;
//!
//!     let server = Server::bind("127.0.0.1:8080", ServerConfig::default()).await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(root).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, ServerConfig};
pub use context::{Completion, RequestContext, ResponseContext};
pub use error::{ConfigurationError, ErrorEnvelope, HttpError, ParseError, RouteError};
pub use http::{Headers, Method, Response, StatusCode};
pub use router::{PathSpec, RouteMethod, RouteOptions, Router};
pub use server::{Server, ServerError};
