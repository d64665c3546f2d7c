//! Per-request deadline.
//!
//! The rest of the chain runs on its own task under a child cancellation
//! scope. Whichever finishes first wins:
//!
//! - the chain: its outcome is returned unchanged (a panic on the task is
//!   re-raised here so the recovery stage sees it)
//! - the deadline: the child scope is cancelled, the request is marked
//!   aborted and the configured status is returned with the `timeout`
//!   envelope
//!
//! Each stage owns a claim flag shared only with the task it spawned, so
//! exactly one of the two sides produces *this stage's* outcome. Stages
//! further down (a route-level timeout, say) have their own claims and can
//! never stop an outer deadline from firing.
//!
//! The forked task is *not* killed on timeout: it keeps running until it
//! notices the cancellation or finishes on its own, and whatever it returns
//! is dropped.

use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http::StatusCode;
use tokio::task::JoinError;
use tracing::{Instrument, warn};

use crate::abort::Abort;
use crate::middleware::{InterceptFuture, Interceptor, Next, Outcome};
use crate::request::Request;

/// How long a request may take and what the client gets when it doesn't
/// make it.
///
/// ```rust
/// use std::time::Duration;
/// use http::StatusCode;
/// use portico::middleware::timeout::TimeoutPolicy;
///
/// let policy = TimeoutPolicy::new(Duration::from_secs(2)).with_status(StatusCode::SERVICE_UNAVAILABLE);
/// assert!(policy.is_enabled());
/// assert!(!TimeoutPolicy::default().is_enabled());
/// ```
///
/// A zero duration disables the stage entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub duration: Duration,
    /// Status sent when the deadline wins. `504 Gateway Timeout` by default.
    pub status: StatusCode,
}

impl TimeoutPolicy {
    /// A deadline of `duration`, answered with `504` when it expires.
    pub fn new(duration: Duration) -> Self {
        Self { duration, status: StatusCode::GATEWAY_TIMEOUT }
    }

    /// Replaces the status sent on expiry.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.duration.is_zero()
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

/// Bounds the latency of everything after it in the chain.
///
/// The server installs one globally from `request_timeout`; more can be put
/// on groups or single routes with [`Router::with`](crate::Router::with) or
/// [`Router::route_with`](crate::Router::route_with). Nested stages compose:
/// each one answers at its own deadline, and the tightest wins.
///
/// This bounds how long the *client* waits, not how long the handler runs.
/// Handlers that should stop early watch
/// [`Request::cancelled`](crate::Request::cancelled).
pub struct TimeoutInterceptor {
    policy: TimeoutPolicy,
}

impl TimeoutInterceptor {
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self { policy }
    }
}

impl Interceptor for TimeoutInterceptor {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn intercept<'a>(&'a self, mut req: Request, next: Next) -> InterceptFuture<'a> {
        Box::pin(async move {
            if !self.policy.is_enabled() {
                return next.run(req).await;
            }

            let scope = req.ctx.cancellation().child_with_timeout(self.policy.duration);
            let deadline = scope
                .deadline()
                .unwrap_or_else(|| tokio::time::Instant::now() + self.policy.duration);
            req.ctx = req.ctx.scoped(scope.clone());
            let ctx = req.ctx.clone();

            // Decides between the task and the deadline for this stage only.
            let claimed = Arc::new(AtomicBool::new(false));
            let task_claim = Arc::clone(&claimed);
            let task_ctx = ctx.clone();
            let mut task = tokio::spawn(
                async move {
                    let outcome = next.run(req).await;
                    if claim(&task_claim) {
                        task_ctx.start_response();
                    }
                    outcome
                }
                .in_current_span(),
            );

            tokio::select! {
                joined = &mut task => return finish(joined),
                _ = tokio::time::sleep_until(deadline) => {}
            }

            scope.cancel();
            if claim(&claimed) {
                ctx.start_response();
                ctx.abort();
                warn!(timeout = ?self.policy.duration, status = self.policy.status.as_u16(), "request timed out");
                return Err(Abort::timeout(self.policy.status));
            }

            // The task claimed first, so its outcome is already in hand.
            finish(task.await)
        })
    }
}

fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
}

fn finish(joined: Result<Outcome, JoinError>) -> Outcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
        Err(_) => Err(Abort::internal()),
    }
}
