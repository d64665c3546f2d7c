//! Post-hoc logging of errors recorded during a request.
//!
//! Stages and handlers call [`RequestContext::record_error`](crate::RequestContext::record_error)
//! instead of failing the request; this stage writes them out once the chain
//! has produced its outcome. It never changes the response.

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::middleware::trace::status_of;
use crate::middleware::{InterceptFuture, Interceptor, Next};
use crate::request::Request;
use crate::sink::LogSinks;

pub struct ErrorCaptureInterceptor {
    sinks: Arc<LogSinks>,
}

impl ErrorCaptureInterceptor {
    pub fn new(sinks: Arc<LogSinks>) -> Self {
        Self { sinks }
    }
}

impl Interceptor for ErrorCaptureInterceptor {
    fn name(&self) -> &'static str {
        "error_capture"
    }

    fn intercept<'a>(&'a self, req: Request, next: Next) -> InterceptFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let method = req.method().clone();
            let path = req.path().to_owned();
            let ctx = req.context().clone();

            let outcome = next.run(req).await;

            let errors = ctx.take_errors();
            if !errors.is_empty() {
                let status = status_of(&outcome);
                let latency = start.elapsed();
                let stamp = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
                for captured in errors {
                    warn!(%method, %path, status, stage = captured.stage, "request error: {}", captured.error);
                    self.sinks.error.write_line(&format!(
                        "[error] {stamp} {method} {path} -> {status} in {latency:?} | {captured}"
                    ));
                }
            }
            outcome
        })
    }
}
