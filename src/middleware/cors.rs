//! Cross-origin policy.
//!
//! [`CorsPolicy`] is compiled once from [`CorsSettings`] and is a pure
//! function of the request's `Origin` afterwards. A denied origin is not an
//! error: the CORS headers are simply left out and the browser enforces the
//! rest.
//!
//! Allow-list entries come in three shapes:
//!
//! | Entry | Matches |
//! |---|---|
//! | `*` | any origin; echoed back as a literal `*` |
//! | `https://app.example.com` | that origin, case-insensitively |
//! | `https://*.example.com` | any `https` origin whose host ends in `.example.com` (not `example.com` itself) |
//!
//! `OPTIONS` requests are preflights: they get the method/header/max-age
//! headers and a `204`, and never reach the router.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};

use crate::config::CorsSettings;
use crate::middleware::{InterceptFuture, Interceptor, Next, render};
use crate::request::Request;
use crate::response::Response;

const DEFAULT_METHODS: [&str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];
const DEFAULT_HEADERS: [&str; 3] = ["Content-Type", "Authorization", "X-Requested-With"];

#[derive(Clone, Debug, PartialEq, Eq)]
enum OriginRule {
    Any,
    Exact(String),
    Subdomain { scheme: String, domain: String },
}

impl OriginRule {
    fn parse(entry: &str) -> Self {
        if entry == "*" {
            return Self::Any;
        }
        if let Some((scheme, domain)) = entry.split_once("://*.") {
            if !scheme.is_empty() && !domain.is_empty() {
                return Self::Subdomain { scheme: scheme.to_ascii_lowercase(), domain: domain.to_ascii_lowercase() };
            }
        }
        Self::Exact(entry.to_owned())
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(allowed) => allowed.eq_ignore_ascii_case(origin),
            Self::Subdomain { scheme, domain } => {
                let origin = origin.to_ascii_lowercase();
                origin
                    .strip_prefix(scheme.as_str())
                    .and_then(|rest| rest.strip_prefix("://"))
                    .is_some_and(|host| host.ends_with(&format!(".{domain}")))
            }
        }
    }
}

/// Compiled allow-list plus the header values it emits.
#[derive(Clone, Debug)]
pub struct CorsPolicy {
    rules: Vec<OriginRule>,
    wildcard: bool,
    allow_credentials: bool,
    methods: String,
    headers: String,
    exposed: Option<String>,
    max_age: Option<u64>,
}

impl CorsPolicy {
    pub fn new(settings: &CorsSettings) -> Self {
        let rules: Vec<OriginRule> = settings
            .allowed_origins
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(OriginRule::parse)
            .collect();

        let methods = if settings.allowed_methods.is_empty() {
            DEFAULT_METHODS.iter().map(|m| (*m).to_owned()).collect()
        } else {
            settings.allowed_methods.iter().map(|m| m.trim().to_ascii_uppercase()).collect()
        };
        let headers = if settings.allowed_headers.is_empty() {
            DEFAULT_HEADERS.iter().map(|h| (*h).to_owned()).collect()
        } else {
            settings.allowed_headers.iter().map(|h| canonical_header(h)).collect()
        };
        let exposed = unique(settings.exposed_headers.iter().map(|h| canonical_header(h)).collect());

        Self {
            wildcard: rules.contains(&OriginRule::Any),
            rules,
            allow_credentials: settings.allow_credentials,
            methods: unique(methods).join(", "),
            headers: unique(headers).join(", "),
            exposed: (!exposed.is_empty()).then(|| exposed.join(", ")),
            max_age: Some(settings.max_age.as_secs()).filter(|s| *s > 0),
        }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        !origin.is_empty() && self.rules.iter().any(|r| r.matches(origin))
    }

    /// Value for `Access-Control-Allow-Origin`, or `None` when denied.
    pub fn allow_origin_value<'o>(&self, origin: &'o str) -> Option<&'o str> {
        if !self.is_allowed(origin) {
            return None;
        }
        Some(if self.wildcard { "*" } else { origin })
    }

    /// Writes the CORS headers for a request into `headers`. Returns `true`
    /// when the request is a preflight that must be answered with `204`.
    pub fn apply(&self, method: &Method, origin: Option<&str>, headers: &mut HeaderMap) -> bool {
        if let Some(allow) = origin.and_then(|o| self.allow_origin_value(o)) {
            set(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, allow);
            if allow != "*" {
                headers.append(header::VARY, HeaderValue::from_static("Origin"));
            }
            if self.allow_credentials {
                set(headers, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
            }
            if let Some(exposed) = &self.exposed {
                set(headers, header::ACCESS_CONTROL_EXPOSE_HEADERS, exposed);
            }
        }

        if method != Method::OPTIONS {
            return false;
        }
        set(headers, header::ACCESS_CONTROL_ALLOW_METHODS, &self.methods);
        set(headers, header::ACCESS_CONTROL_ALLOW_HEADERS, &self.headers);
        if let Some(max_age) = self.max_age {
            set(headers, header::ACCESS_CONTROL_MAX_AGE, &max_age.to_string());
        }
        true
    }
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// `x-REQUESTED-with` → `X-Requested-With`.
fn canonical_header(name: &str) -> String {
    name.trim()
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn unique(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

// ── Interceptor ───────────────────────────────────────────────────────────────

pub struct CorsInterceptor {
    policy: CorsPolicy,
}

impl CorsInterceptor {
    pub fn new(policy: CorsPolicy) -> Self {
        Self { policy }
    }
}

impl Interceptor for CorsInterceptor {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn intercept<'a>(&'a self, req: Request, next: Next) -> InterceptFuture<'a> {
        Box::pin(async move {
            let origin = req.header(header::ORIGIN.as_str()).map(str::to_owned);
            let mut cors = HeaderMap::new();
            if self.policy.apply(req.method(), origin.as_deref(), &mut cors) {
                let mut res = Response::status(StatusCode::NO_CONTENT);
                res.headers_mut().extend(cors);
                return Ok(res);
            }

            // Rejections downstream still carry CORS headers, or the browser
            // hides the error body from the caller.
            let mut res = render(next.run(req).await);
            for (name, value) in &cors {
                res.headers_mut().append(name, value.clone());
            }
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::middleware::Pipeline;

    fn policy(origins: &[&str]) -> CorsPolicy {
        CorsPolicy::new(&CorsSettings {
            allowed_origins: origins.iter().map(|o| (*o).to_owned()).collect(),
            ..CorsSettings::default()
        })
    }

    #[test]
    fn wildcard_subdomain_matches_scheme_and_suffix() {
        let p = policy(&["https://*.example.com"]);
        assert!(p.is_allowed("https://a.example.com"));
        assert!(p.is_allowed("https://deep.a.EXAMPLE.com"));
        assert!(!p.is_allowed("http://a.example.com"));
        assert!(!p.is_allowed("https://example.com"));
        assert!(!p.is_allowed("https://a.example.com.evil.io"));
        assert!(!p.is_allowed("https://aexample.com"));
    }

    #[test]
    fn exact_entries_compare_case_insensitively() {
        let p = policy(&[" http://localhost:3000 ", ""]);
        assert!(p.is_allowed("HTTP://LOCALHOST:3000"));
        assert!(!p.is_allowed("http://localhost:3001"));
        assert!(!p.is_allowed(""));
        assert_eq!(p.allow_origin_value("http://localhost:3000"), Some("http://localhost:3000"));
    }

    #[test]
    fn star_is_echoed_literally() {
        let p = policy(&["https://app.example.com", "*"]);
        assert_eq!(p.allow_origin_value("https://anything.io"), Some("*"));
    }

    #[test]
    fn defaults_and_dedup() {
        let p = CorsPolicy::new(&CorsSettings {
            allowed_origins: vec!["*".into()],
            allowed_headers: vec!["x-api-KEY".into(), "X-Api-Key".into(), "content-type".into()],
            exposed_headers: vec!["x-total-count".into()],
            max_age: Duration::from_secs(600),
            ..CorsSettings::default()
        });
        let mut headers = HeaderMap::new();
        assert!(p.apply(&Method::OPTIONS, Some("https://x.io"), &mut headers));
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, POST, PUT, PATCH, DELETE, OPTIONS");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "X-Api-Key, Content-Type");
        assert_eq!(headers[header::ACCESS_CONTROL_EXPOSE_HEADERS], "X-Total-Count");
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "600");
    }

    #[test]
    fn denied_origin_gets_no_allow_headers() {
        let p = policy(&["https://*.example.com"]);
        let mut headers = HeaderMap::new();
        assert!(!p.apply(&Method::GET, Some("https://evil.io"), &mut headers));
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn preflight_never_reaches_handler() {
        async fn handler(_req: Request) -> Response {
            panic!("preflight reached the handler")
        }
        let chain = Pipeline::new()
            .with(CorsInterceptor::new(CorsPolicy::new(&CorsSettings {
                allowed_origins: vec!["https://*.example.com".into()],
                allow_credentials: true,
                ..CorsSettings::default()
            })))
            .into_chain(handler);

        let req = http::Request::builder()
            .method("OPTIONS")
            .uri("/api/v1/me")
            .header("Origin", "https://a.example.com")
            .body(Bytes::new())
            .unwrap();
        let res = chain.handle(Request::from_http(req)).await;
        assert_eq!(res.status_code(), StatusCode::NO_CONTENT);
        assert_eq!(res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.example.com");
        assert_eq!(res.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(res.headers()[header::VARY], "Origin");
    }

    #[tokio::test]
    async fn simple_request_gets_headers_on_the_way_out() {
        let chain = Pipeline::new()
            .with(CorsInterceptor::new(policy(&["http://localhost:3000"])))
            .into_chain(|_req: Request| async { "ok" });
        let req = http::Request::builder()
            .uri("/")
            .header("Origin", "http://localhost:3000")
            .body(Bytes::new())
            .unwrap();
        let res = chain.handle(Request::from_http(req)).await;
        assert_eq!(res.body().as_ref(), b"ok");
        assert_eq!(res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:3000");
    }
}
