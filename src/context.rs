//! Per-request state shared between interceptors.
//!
//! A [`RequestContext`] is created when a request arrives and dropped when its
//! response has been handed to hyper (or the request was aborted). Clones
//! share everything except the cancellation scope, which the timeout stage
//! replaces with a child scope before forking the rest of the chain.
//!
//! # What lives here
//!
//! | Field | Written by | Read by |
//! |---|---|---|
//! | scratch map ([`http::Extensions`]) | request id, auth gates, user code | later stages, handlers |
//! | captured errors | any stage via [`RequestContext::record_error`] | error capture stage |
//! | response-started flag | timeout stage (write-once) | timeout stage |
//! | aborted flag | auth gates, timeout stage | handlers that want to stop early |
//! | cancellation scope | timeout stage (child scopes), shutdown | cooperative handlers |

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::select_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::BoxError;

// ── Cancellation ──────────────────────────────────────────────────────────────

/// A cancellable, optionally deadline-bearing scope.
///
/// Scopes form a chain: a child is cancelled when it is cancelled itself or
/// when any ancestor is. Cancelling a child never touches its parent.
///
/// Cancellation is a *signal*, not preemption. Code that never looks at
/// [`is_cancelled`](Cancellation::is_cancelled) or awaits
/// [`cancelled`](Cancellation::cancelled) keeps running.
#[derive(Clone)]
pub struct Cancellation {
    node: Arc<ScopeNode>,
}

struct ScopeNode {
    flag: watch::Sender<bool>,
    deadline: Option<Instant>,
    parent: Option<Arc<ScopeNode>>,
}

impl Cancellation {
    /// A root scope with no deadline.
    pub fn new() -> Self {
        Self {
            node: Arc::new(ScopeNode { flag: watch::Sender::new(false), deadline: None, parent: None }),
        }
    }

    /// Derives a child scope that inherits the parent's deadline.
    pub fn child(&self) -> Self {
        Self {
            node: Arc::new(ScopeNode {
                flag: watch::Sender::new(false),
                deadline: self.deadline(),
                parent: Some(Arc::clone(&self.node)),
            }),
        }
    }

    /// Derives a child scope whose deadline is `now + timeout`, or the
    /// parent's deadline if that comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let mut deadline = Instant::now() + timeout;
        if let Some(parent) = self.deadline() {
            deadline = deadline.min(parent);
        }
        Self {
            node: Arc::new(ScopeNode {
                flag: watch::Sender::new(false),
                deadline: Some(deadline),
                parent: Some(Arc::clone(&self.node)),
            }),
        }
    }

    /// Cancels this scope and every scope derived from it.
    pub fn cancel(&self) {
        self.node.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.lineage().any(|n| *n.flag.borrow())
    }

    /// The earliest deadline along the chain, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.node.deadline
    }

    /// Time left before the deadline. `None` when the scope has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves once this scope or any ancestor is cancelled.
    ///
    /// Reaching the deadline does not resolve this future by itself; the
    /// owner of the deadline (the timeout stage) cancels the scope when it
    /// fires.
    pub async fn cancelled(&self) {
        let waits = self
            .lineage()
            .map(|node| {
                let mut rx = node.flag.subscribe();
                Box::pin(async move {
                    // The sender outlives the receiver: both are owned by `self`.
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                })
            })
            .collect::<Vec<_>>();
        select_all(waits).await;
    }

    fn lineage(&self) -> impl Iterator<Item = &ScopeNode> {
        std::iter::successors(Some(&*self.node), |n| n.parent.as_deref())
    }
}

impl Default for Cancellation {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline())
            .finish()
    }
}

// ── Captured errors ───────────────────────────────────────────────────────────

/// An error recorded during a request, logged after the chain unwinds.
#[derive(Debug)]
pub struct CapturedError {
    pub stage: &'static str,
    pub error: BoxError,
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.error)
    }
}

// ── RequestContext ────────────────────────────────────────────────────────────

/// Request id assigned by the request-id stage, stored in the scratch map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

#[derive(Default)]
struct Shared {
    scratch: Mutex<http::Extensions>,
    errors: Mutex<Vec<CapturedError>>,
    response_started: AtomicBool,
    aborted: AtomicBool,
}

/// Per-request scratch state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RequestContext {
    shared: Arc<Shared>,
    cancel: Cancellation,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::with_cancellation(Cancellation::new())
    }

    pub(crate) fn with_cancellation(cancel: Cancellation) -> Self {
        Self { shared: Arc::default(), cancel }
    }

    /// Same shared state, different cancellation scope.
    pub(crate) fn scoped(&self, cancel: Cancellation) -> Self {
        Self { shared: Arc::clone(&self.shared), cancel }
    }

    // ── scratch map ──

    /// Stores a value in the scratch map, returning the previous one.
    pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.shared.scratch.lock().insert(value)
    }

    /// Returns a clone of the stored value of type `T`.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.shared.scratch.lock().get::<T>().cloned()
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.shared.scratch.lock().get::<T>().is_some()
    }

    pub fn request_id(&self) -> Option<String> {
        self.get::<RequestId>().map(|id| id.0)
    }

    // ── errors ──

    /// Records an error for the error capture stage. Does not alter the
    /// response.
    pub fn record_error(&self, stage: &'static str, error: impl Into<BoxError>) {
        self.shared.errors.lock().push(CapturedError { stage, error: error.into() });
    }

    /// Takes all errors recorded so far.
    pub fn take_errors(&self) -> Vec<CapturedError> {
        std::mem::take(&mut *self.shared.errors.lock())
    }

    pub fn error_count(&self) -> usize {
        self.shared.errors.lock().len()
    }

    // ── response / abort flags ──

    /// Marks the response as started. Returns `true` for the first call only.
    /// Timeout stages decide between themselves with their own claim; this
    /// flag only records that some response has been committed.
    pub(crate) fn start_response(&self) -> bool {
        self.shared
            .response_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a response has been committed for this request.
    pub fn response_started(&self) -> bool {
        self.shared.response_started.load(Ordering::Acquire)
    }

    /// Marks the request as aborted. Further output from downstream code is
    /// discarded.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
    }

    // ── cancellation ──

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the request's scope is cancelled (timeout or shutdown).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl Default for RequestContext {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id())
            .field("errors", &self.error_count())
            .field("response_started", &self.response_started())
            .field("aborted", &self.is_aborted())
            .field("cancel", &self.cancel)
            .finish()
    }
}
