//! Request tracing and the access log.
//!
//! Opens a `request` span around everything downstream (later stages record
//! the request id into it) and writes one access-log line per request once
//! the chain has unwound.

use std::sync::Arc;
use std::time::Instant;

use tracing::{Instrument, field, info, info_span};

use crate::middleware::{InterceptFuture, Interceptor, Next, Outcome};
use crate::request::Request;
use crate::sink::LogSinks;

/// Outermost stage: span + access log line.
pub struct TraceInterceptor {
    sinks: Arc<LogSinks>,
}

impl TraceInterceptor {
    pub fn new(sinks: Arc<LogSinks>) -> Self {
        Self { sinks }
    }
}

impl Interceptor for TraceInterceptor {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn intercept<'a>(&'a self, req: Request, next: Next) -> InterceptFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let method = req.method().clone();
            let path = req.path().to_owned();
            let peer = req.remote_addr().map(|a| a.ip().to_string()).unwrap_or_else(|| "-".to_owned());
            let ctx = req.context().clone();

            let span = info_span!("request", %method, %path, request_id = field::Empty);
            let outcome = next.run(req).instrument(span.clone()).await;

            let status = status_of(&outcome);
            let latency = start.elapsed();
            let request_id = ctx.request_id().unwrap_or_default();
            span.in_scope(|| info!(status, ?latency, "request finished"));

            self.sinks.access.write_line(&format!(
                "[access] {} | {status:>3} | {latency:>12?} | {peer:>15} | {method:<7} {path:?} | {request_id}",
                chrono::Local::now().format("%Y/%m/%d - %H:%M:%S"),
            ));
            outcome
        })
    }
}

/// Status code the client sees for `outcome`.
pub(crate) fn status_of(outcome: &Outcome) -> u16 {
    match outcome {
        Ok(res) => res.status_code().as_u16(),
        Err(abort) => abort.status().as_u16(),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::middleware::Pipeline;
    use crate::response::Response;
    use crate::sink::LogSink;

    #[tokio::test]
    async fn writes_one_access_line_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let access = dir.path().join("access.log");
        let sinks = Arc::new(LogSinks {
            access: LogSink::open("access", &access, 0, 0).unwrap(),
            error: LogSink::stderr("error"),
        });
        let chain = Pipeline::new()
            .with(TraceInterceptor::new(Arc::clone(&sinks)))
            .into_chain(|_req: Request| async { Response::status(StatusCode::ACCEPTED) });

        for _ in 0..3 {
            let req = http::Request::builder().method("POST").uri("/jobs").body(Bytes::new()).unwrap();
            chain.handle(Request::from_http(req)).await;
        }

        let log = std::fs::read_to_string(&access).unwrap();
        assert_eq!(log.lines().count(), 3);
        assert!(log.lines().all(|l| l.contains("| 202 |") && l.contains("POST") && l.contains("\"/jobs\"")));
    }
}
