//! # portico
//!
//! The bootstrap layer of an HTTP service: everything between the socket and
//! your handlers that every service needs and nobody wants to rewrite.
//!
//! ## What you get
//!
//! - An ordered interceptor pipeline. Global, group and route stages run
//!   strictly in registration order, and any stage may answer or reject
//!   instead of calling through.
//! - Bearer-credential gates (header or cookie) in front of an injected
//!   [`TokenValidator`]
//! - CORS with exact, `*` and `scheme://*.domain` origins, preflights
//!   answered with `204`
//! - A per-request deadline with a JSON `timeout` envelope. Cancellation is
//!   cooperative and handlers see it through [`Request::cancelled`].
//! - Access and error logs with size-based rotation
//! - Graceful shutdown: drain, bounded wait, report
//! - `/livez`, `/readyz` and `/sys/*` endpoints
//!
//! Every rejection looks the same on the wire:
//!
//! ```json
//! {"ok":false,"error":"access token missing","code":"no_token","details":null}
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use portico::{Config, Request, Response, Router, ServerBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portico::Error> {
//!     let mut config = Config::from_file("portico.toml")?.with_env_overrides();
//!     config.base_path = "/api/v1".into();
//!
//!     let server = ServerBuilder::new(config)
//!         .register(|api: Router| api.get("/users/{id}", get_user))
//!         .build()?;
//!
//!     let report = server.serve().await?;
//!     println!("drained {} requests", report.drained);
//!     Ok(())
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//! ```

mod abort;
mod context;
mod error;
mod handler;
mod method;
mod request;
mod response;
mod router;
mod server;
mod sys;

pub mod config;
pub mod middleware;
pub mod routes_table;
pub mod shutdown;
pub mod sink;

pub use abort::Abort;
pub use config::Config;
pub use context::{Cancellation, CapturedError, RequestContext, RequestId};
pub use error::{BoxError, Error};
pub use handler::Handler;
pub use method::Method;
pub use middleware::auth::{AccessClaims, AuthGate, Claims, CredentialKind, RefreshClaims, StubValidator, TokenValidator};
pub use middleware::{Interceptor, Next, Outcome, Pipeline};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response};
pub use router::{RouteInfo, Router};
pub use server::{RouteRegistrar, Server, ServerBuilder};
pub use shutdown::{Phase, ShutdownHandle, ShutdownReport};
pub use sys::liveness;
