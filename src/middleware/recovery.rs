//! Panic recovery.
//!
//! A panic anywhere downstream (including on the timeout stage's forked task,
//! which re-raises it here) is caught at this boundary, written to the error
//! sink with method and path, and answered with a generic 500.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::error;

use crate::abort::Abort;
use crate::middleware::{InterceptFuture, Interceptor, Next};
use crate::request::Request;
use crate::sink::LogSinks;

pub struct RecoveryInterceptor {
    sinks: Arc<LogSinks>,
}

impl RecoveryInterceptor {
    pub fn new(sinks: Arc<LogSinks>) -> Self {
        Self { sinks }
    }
}

impl Interceptor for RecoveryInterceptor {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn intercept<'a>(&'a self, req: Request, next: Next) -> InterceptFuture<'a> {
        Box::pin(async move {
            let method = req.method().clone();
            let path = req.path().to_owned();
            let ctx = req.context().clone();

            match AssertUnwindSafe(next.run(req)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(%method, %path, panic = %message, "handler panicked");
                    self.sinks.error.write_line(&format!(
                        "[panic] {} {method} {path} | request_id={} | panic: {message}",
                        chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
                        ctx.request_id().unwrap_or_default(),
                    ));
                    ctx.abort();
                    Err(Abort::internal())
                }
            }
        })
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
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

    async fn explode(_req: Request) -> Response {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn converts_panic_into_500_and_logs_it() {
        let dir = tempfile::tempdir().unwrap();
        let error_log = dir.path().join("error.log");
        let sinks = Arc::new(LogSinks {
            access: LogSink::stdout("access"),
            error: LogSink::open("error", &error_log, 0, 0).unwrap(),
        });
        let chain = Pipeline::new().with(RecoveryInterceptor::new(sinks)).into_chain(explode);

        let req = http::Request::builder().uri("/boom").body(Bytes::new()).unwrap();
        let res = chain.handle(Request::from_http(req)).await;

        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["code"], "internal_error");
        assert_eq!(body["error"], "internal server error");

        let log = std::fs::read_to_string(&error_log).unwrap();
        assert!(log.contains("GET /boom"), "{log}");
        assert!(log.contains("panic: kaboom"), "{log}");
    }
}
