//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! Every `async fn` has its own anonymous future type, so two handlers never
//! share a type even when their signatures match. The route table needs to
//! hold all of them side by side, so each one is erased behind
//! `dyn ErasedHandler` at registration time and stored as a [`BoxedHandler`]:
//!
//! ```text
//! async fn me(req: Request) -> Response { … }      ← user writes this
//!        ↓ router.get("/me", me)
//! me.into_boxed_handler()                          ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(me))                          ← stored as BoxedHandler
//!        ↓
//! handler.call(req) at the end of the chain        ← one vtable dispatch
//! ```
//!
//! The per-request cost is one virtual call and one boxed future, which is
//! noise next to network I/O.
//!
//! # Why `'static`
//!
//! Handlers are `'static` and return `'static` futures. The timeout stage
//! relies on that: it moves the rest of the chain, handler included, onto its
//! own task, which may outlive the stage that spawned it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// A heap-allocated, type-erased, `Send + 'static` future.
///
/// `Pin<Box<…>>` because the runtime polls it in place and must never move
/// it after the first poll; `Send + 'static` so tokio can hand it to any
/// worker thread, or to a freshly spawned task.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture<Response>;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// Automatically satisfied for any function with the signature:
///
/// ```text
/// async fn name(req: Request) -> impl IntoResponse
/// ```
///
/// The trait is sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Newtype bridging a concrete handler `F` to the trait-object world.
///
/// `call` awaits the user's future and converts whatever it yields through
/// [`IntoResponse`], so the chain only ever sees a [`Response`].
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<Response> {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}
