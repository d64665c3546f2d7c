//! Request id assignment.
//!
//! Reuses the id the client (or the proxy in front) sent in the configured
//! header, otherwise generates one. The id lands in the scratch map as
//! [`RequestId`], in the current `request` span, and on the response.

use http::header::{HeaderName, HeaderValue};
use tracing::Span;

use crate::context::RequestId;
use crate::middleware::{InterceptFuture, Interceptor, Next};
use crate::request::Request;

pub struct RequestIdInterceptor {
    header: HeaderName,
}

impl RequestIdInterceptor {
    /// Falls back to `x-request-id` when `header` is not a valid header name.
    pub fn new(header: &str) -> Self {
        let header = HeaderName::try_from(header).unwrap_or_else(|_| HeaderName::from_static("x-request-id"));
        Self { header }
    }
}

impl Default for RequestIdInterceptor {
    fn default() -> Self {
        Self::new("x-request-id")
    }
}

impl Interceptor for RequestIdInterceptor {
    fn name(&self) -> &'static str {
        "request_id"
    }

    fn intercept<'a>(&'a self, req: Request, next: Next) -> InterceptFuture<'a> {
        Box::pin(async move {
            let id = req
                .headers()
                .get(&self.header)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

            req.context().insert(RequestId(id.clone()));
            Span::current().record("request_id", id.as_str());

            let mut outcome = next.run(req).await;
            if let (Ok(res), Ok(value)) = (outcome.as_mut(), HeaderValue::from_str(&id)) {
                res.headers_mut().insert(self.header.clone(), value);
            }
            outcome
        })
    }
}
