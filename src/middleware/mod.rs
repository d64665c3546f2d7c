//! Middleware pipeline engine.
//!
//! A [`Pipeline`] is an ordered list of [`Interceptor`]s. Sealed with a
//! terminal handler it becomes a [`Chain`], which runs the stages strictly in
//! registration order for every request. Each stage receives the request and a
//! [`Next`] and does exactly one of:
//!
//! - call through: `next.run(req).await`
//! - answer itself: return `Ok(response)` without touching `next`
//! - reject: return `Err(Abort)`; the chain boundary renders the JSON envelope
//!
//! `Next::run` consumes the `Next`, so no stage can run twice, and stages only
//! ever see what earlier stages left in the [`RequestContext`](crate::RequestContext).
//! `Next` is owned and `'static`: the timeout stage moves it onto another task.
//!
//! ```rust
//! use portico::middleware::{from_fn, Pipeline};
//! use portico::{Abort, Response};
//!
//! let pipeline = Pipeline::new()
//!     .with(from_fn("deny-delete", |req, next| async move {
//!         if req.method() == http::Method::DELETE {
//!             return Err(Abort::new(http::StatusCode::FORBIDDEN, "forbidden", "read only"));
//!         }
//!         next.run(req).await
//!     }));
//! assert_eq!(pipeline.len(), 1);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::abort::Abort;
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

pub mod auth;
pub mod capture;
pub mod cors;
pub mod recovery;
pub mod request_id;
pub mod timeout;
pub mod trace;

/// What a stage hands back: a response, or a rejection to be rendered.
pub type Outcome = Result<Response, Abort>;

/// Future returned by [`Interceptor::intercept`]; may borrow the interceptor.
pub type InterceptFuture<'a> = Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;

/// One stage of the chain.
pub trait Interceptor: Send + Sync + 'static {
    /// Stage name, used in logs and captured errors.
    fn name(&self) -> &'static str;

    fn intercept<'a>(&'a self, req: Request, next: Next) -> InterceptFuture<'a>;
}

pub type BoxedInterceptor = Arc<dyn Interceptor>;

// ── Closure interceptors ──────────────────────────────────────────────────────

/// Interceptor built from an async closure. See [`from_fn`].
pub struct FnInterceptor<F> {
    name: &'static str,
    f: F,
}

/// Wraps `f(req, next)` as an interceptor.
pub fn from_fn<F, Fut>(name: &'static str, f: F) -> FnInterceptor<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    FnInterceptor { name, f }
}

impl<F, Fut> Interceptor for FnInterceptor<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn intercept<'a>(&'a self, req: Request, next: Next) -> InterceptFuture<'a> {
        Box::pin((self.f)(req, next))
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Ordered interceptors, not yet bound to a handler.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<BoxedInterceptor>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage. Returns `self` for chaining.
    pub fn with(mut self, interceptor: impl Interceptor) -> Self {
        self.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: impl Interceptor) {
        self.stages.push(Arc::new(interceptor));
    }

    /// Appends every stage of `other`, after the existing ones.
    pub(crate) fn extend(&mut self, other: &Pipeline) {
        self.stages.extend(other.stages.iter().cloned());
    }

    pub fn len(&self) -> usize { self.stages.len() }
    pub fn is_empty(&self) -> bool { self.stages.is_empty() }

    /// Stage names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Seals the pipeline with its terminal handler.
    pub fn into_chain(self, terminal: impl Handler) -> Chain {
        self.into_chain_boxed(terminal.into_boxed_handler())
    }

    pub(crate) fn into_chain_boxed(self, terminal: BoxedHandler) -> Chain {
        Chain { inner: Arc::new(ChainInner { stages: self.stages, terminal }) }
    }
}

// ── Chain / Next ──────────────────────────────────────────────────────────────

struct ChainInner {
    stages: Vec<BoxedInterceptor>,
    terminal: BoxedHandler,
}

/// A sealed pipeline: stages plus terminal handler. Cheap to clone.
#[derive(Clone)]
pub struct Chain {
    inner: Arc<ChainInner>,
}

impl Chain {
    /// Runs the chain, leaving rejections as `Err`.
    pub fn run(&self, req: Request) -> BoxFuture<Outcome> {
        Next { chain: Arc::clone(&self.inner), index: 0 }.run(req)
    }

    /// Runs the chain and renders any rejection as the JSON error envelope.
    pub async fn handle(&self, req: Request) -> Response {
        render(self.run(req).await)
    }
}

/// Renders an outcome, turning an `Abort` into its error envelope.
pub fn render(outcome: Outcome) -> Response {
    outcome.unwrap_or_else(IntoResponse::into_response)
}

/// The remainder of the chain after the current stage.
pub struct Next {
    chain: Arc<ChainInner>,
    index: usize,
}

impl Next {
    /// Runs the next stage, or the terminal handler if none is left.
    pub fn run(self, req: Request) -> BoxFuture<Outcome> {
        match self.chain.stages.get(self.index) {
            Some(stage) => {
                let stage = Arc::clone(stage);
                let next = Next { chain: Arc::clone(&self.chain), index: self.index + 1 };
                Box::pin(async move { stage.intercept(req, next).await })
            }
            None => {
                let fut = self.chain.terminal.call(req);
                Box::pin(async move { Ok(fut.await) })
            }
        }
    }

    /// Stages left before the terminal handler.
    pub fn remaining(&self) -> usize {
        self.chain.stages.len() - self.index
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use http::StatusCode;

    use super::*;

    async fn unreachable_handler(_req: Request) -> Response {
        panic!("handler must not run")
    }

    fn req() -> Request {
        Request::from_http(http::Request::builder().uri("/").body(Bytes::new()).unwrap())
    }

    fn recorder(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl Interceptor {
        from_fn(name, move |req, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name);
                next.run(req).await
            }
        })
    }

    #[tokio::test]
    async fn runs_stages_in_registration_order_then_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = Arc::clone(&log);
        let chain = Pipeline::new()
            .with(recorder(Arc::clone(&log), "a"))
            .with(recorder(Arc::clone(&log), "b"))
            .with(recorder(Arc::clone(&log), "c"))
            .into_chain(move |_req: Request| {
                let log = Arc::clone(&handler_log);
                async move {
                    log.lock().unwrap().push("handler");
                    "done"
                }
            });

        let res = chain.handle(req()).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c", "handler"]);
    }

    #[tokio::test]
    async fn abort_short_circuits_and_renders_envelope() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = Arc::clone(&log);
        let chain = Pipeline::new()
            .with(recorder(Arc::clone(&log), "a"))
            .with(from_fn("gate", |_req, _next| async {
                Err(Abort::unauthorized("no_token", "access token missing"))
            }))
            .with(recorder(Arc::clone(&log), "never"))
            .into_chain(move |_req: Request| {
                let log = Arc::clone(&handler_log);
                async move {
                    log.lock().unwrap().push("handler");
                    "unreachable"
                }
            });

        let res = chain.handle(req()).await;
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["code"], "no_token");
        assert_eq!(*log.lock().unwrap(), ["a"]);
    }

    #[tokio::test]
    async fn stage_can_answer_without_calling_through() {
        let chain = Pipeline::new()
            .with(from_fn("teapot", |_req, _next| async {
                Ok(Response::status(StatusCode::IM_A_TEAPOT))
            }))
            .into_chain(unreachable_handler);

        let res = chain.handle(req()).await;
        assert_eq!(res.status_code(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn later_stages_see_earlier_context_writes() {
        #[derive(Clone)]
        struct Marker(u8);

        let chain = Pipeline::new()
            .with(from_fn("mark", |req: Request, next: Next| async move {
                req.context().insert(Marker(7));
                next.run(req).await
            }))
            .into_chain(|req: Request| async move {
                format!("{}", req.context().get::<Marker>().map_or(0, |m| m.0))
            });

        let res = chain.handle(req()).await;
        assert_eq!(res.body().as_ref(), b"7");
    }
}
