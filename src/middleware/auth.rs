//! Bearer-credential gates.
//!
//! An [`AuthGate`] pulls a token from the request, hands it to the injected
//! [`TokenValidator`] and either stores the resulting [`Claims`] in the
//! scratch map or rejects with `401`.
//!
//! Token lookup, first match wins:
//!
//! 1. the configured header (default `Authorization`) when it starts with the
//!    configured prefix (default `Bearer `); prefix stripped, whitespace trimmed
//! 2. the cookie for the gate's credential kind (`access_cookie` or
//!    `refresh_cookie`)
//!
//! Access and refresh gates differ only in cookie, validator method and the
//! scratch-map type they write ([`AccessClaims`] vs [`RefreshClaims`]), so a
//! handler behind an access gate can never be handed refresh claims.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::abort::Abort;
use crate::config::AuthSettings;
use crate::context::RequestContext;
use crate::error::BoxError;
use crate::middleware::{InterceptFuture, Interceptor, Next};
use crate::request::Request;

// ── Claims ────────────────────────────────────────────────────────────────────

/// Identity attributes produced by a successful validation.
///
/// Well-known fields are typed; anything else the validator wants to pass on
/// goes in `extra` and is flattened when serialised.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Claims {
    pub fn subject(sub: impl Into<String>) -> Self {
        Self { sub: Some(sub.into()), ..Self::default() }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Typed lookup into `extra`; `None` if missing or of another shape.
    pub fn extra_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.extra.get(key).and_then(|v| T::deserialize(v).ok())
    }
}

/// Claims from a validated access credential.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessClaims(pub Claims);

/// Claims from a validated refresh credential.
#[derive(Clone, Debug, PartialEq)]
pub struct RefreshClaims(pub Claims);

// ── Validator ─────────────────────────────────────────────────────────────────

/// Token validation supplied by the application (JWT, PASETO, opaque lookup…).
///
/// The error is recorded for the error log but never shown to the client.
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    async fn validate_access(&self, ctx: &RequestContext, token: &str) -> Result<Claims, BoxError>;
    async fn validate_refresh(&self, ctx: &RequestContext, token: &str) -> Result<Claims, BoxError>;
}

/// Development validator: accepts exactly one token for both kinds.
#[derive(Clone, Debug)]
pub struct StubValidator {
    token: String,
    claims: Claims,
}

impl StubValidator {
    pub fn new(token: impl Into<String>, claims: Claims) -> Self {
        Self { token: token.into(), claims }
    }

    fn check(&self, token: &str) -> Result<Claims, BoxError> {
        if token == self.token {
            Ok(self.claims.clone())
        } else {
            Err("token not recognised".into())
        }
    }
}

impl Default for StubValidator {
    fn default() -> Self {
        Self::new("ok", Claims::subject("demo").with_role("user"))
    }
}

#[async_trait]
impl TokenValidator for StubValidator {
    async fn validate_access(&self, _ctx: &RequestContext, token: &str) -> Result<Claims, BoxError> {
        self.check(token)
    }

    async fn validate_refresh(&self, _ctx: &RequestContext, token: &str) -> Result<Claims, BoxError> {
        self.check(token)
    }
}

// ── Gate ──────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    Access,
    Refresh,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        })
    }
}

/// Rejects requests that carry no valid credential of one kind.
///
/// The credential is looked up in this order, and the first place that has
/// one decides:
///
/// 1. the `auth.header` header (default `Authorization`) when its value
///    starts with `auth.prefix` (default `Bearer `). The rest, trimmed, is
///    the token. A header that matches the prefix but carries nothing counts
///    as a missing token; the cookie is not consulted.
/// 2. the cookie named by `auth.access_cookie` or `auth.refresh_cookie`,
///    depending on the gate's [`CredentialKind`]
///
/// No credential: `401 no_token`. A credential the [`TokenValidator`] turns
/// down: `401 invalid_token`, with the validator's error recorded on the
/// request (and written to the error log) but never sent to the client.
/// Accepted: the claims are stored as [`AccessClaims`] or [`RefreshClaims`]
/// and the chain continues.
#[derive(Clone)]
pub struct AuthGate {
    kind: CredentialKind,
    settings: AuthSettings,
    validator: Arc<dyn TokenValidator>,
}

impl AuthGate {
    /// Gate for access credentials, the kind the server puts in front of
    /// `base_path` when `auth.enable_access_gate` is set.
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use portico::config::AuthSettings;
    /// use portico::{AuthGate, Pipeline, StubValidator};
    ///
    /// let gate = AuthGate::access(AuthSettings::default(), Arc::new(StubValidator::default()));
    /// let admin_only = Pipeline::new().with(gate);
    /// ```
    pub fn access(settings: AuthSettings, validator: Arc<dyn TokenValidator>) -> Self {
        Self { kind: CredentialKind::Access, settings: settings.normalized(), validator }
    }

    /// Gate for refresh credentials. Put it on the routes that mint new
    /// tokens with [`Router::route_with`](crate::Router::route_with); it reads
    /// `auth.refresh_cookie` and stores [`RefreshClaims`].
    pub fn refresh(settings: AuthSettings, validator: Arc<dyn TokenValidator>) -> Self {
        Self { kind: CredentialKind::Refresh, settings: settings.normalized(), validator }
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    /// Finds the credential for this gate's kind. `None` means missing.
    pub fn extract_token<'r>(&self, req: &'r Request) -> Option<&'r str> {
        let prefixed = req
            .header(&self.settings.header)
            .and_then(|v| v.strip_prefix(self.settings.prefix.as_str()));
        if let Some(rest) = prefixed {
            let token = rest.trim();
            return (!token.is_empty()).then_some(token);
        }

        let cookie = match self.kind {
            CredentialKind::Access => self.settings.access_cookie.as_deref(),
            CredentialKind::Refresh => self.settings.refresh_cookie.as_deref(),
        }?;
        req.cookie(cookie).filter(|t| !t.is_empty())
    }

    async fn validate(&self, ctx: &RequestContext, token: &str) -> Result<Claims, BoxError> {
        match self.kind {
            CredentialKind::Access => self.validator.validate_access(ctx, token).await,
            CredentialKind::Refresh => self.validator.validate_refresh(ctx, token).await,
        }
    }

    fn missing(&self) -> Abort {
        match self.kind {
            CredentialKind::Access => Abort::unauthorized("no_token", "access token missing"),
            CredentialKind::Refresh => Abort::unauthorized("no_token", "refresh token missing"),
        }
    }

    fn invalid(&self) -> Abort {
        match self.kind {
            CredentialKind::Access => Abort::unauthorized("invalid_token", "invalid access token"),
            CredentialKind::Refresh => Abort::unauthorized("invalid_token", "invalid refresh token"),
        }
    }
}

impl Interceptor for AuthGate {
    fn name(&self) -> &'static str {
        match self.kind {
            CredentialKind::Access => "auth_access",
            CredentialKind::Refresh => "auth_refresh",
        }
    }

    fn intercept<'a>(&'a self, req: Request, next: Next) -> InterceptFuture<'a> {
        Box::pin(async move {
            let ctx = req.context().clone();
            let Some(token) = self.extract_token(&req).map(str::to_owned) else {
                debug!(kind = %self.kind, "no credential presented");
                ctx.abort();
                return Err(self.missing());
            };

            match self.validate(&ctx, &token).await {
                Ok(claims) => {
                    match self.kind {
                        CredentialKind::Access => {
                            ctx.insert(AccessClaims(claims));
                        }
                        CredentialKind::Refresh => {
                            ctx.insert(RefreshClaims(claims));
                        }
                    }
                    next.run(req).await
                }
                Err(e) => {
                    debug!(kind = %self.kind, "credential rejected: {e}");
                    ctx.record_error(self.name(), e);
                    ctx.abort();
                    Err(self.invalid())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::middleware::Pipeline;
    use crate::response::Response;

    fn settings() -> AuthSettings {
        AuthSettings {
            access_cookie: Some("access_token".into()),
            refresh_cookie: Some("refresh_token".into()),
            ..AuthSettings::default()
        }
    }

    /// Accepts `a-*` tokens as access, `r-*` tokens as refresh.
    struct PrefixValidator;

    #[async_trait]
    impl TokenValidator for PrefixValidator {
        async fn validate_access(&self, _ctx: &RequestContext, token: &str) -> Result<Claims, BoxError> {
            token.strip_prefix("a-").map(Claims::subject).ok_or_else(|| "signature mismatch for kid=42".into())
        }

        async fn validate_refresh(&self, _ctx: &RequestContext, token: &str) -> Result<Claims, BoxError> {
            token.strip_prefix("r-").map(Claims::subject).ok_or_else(|| "not a refresh token".into())
        }
    }

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::builder().uri("/me");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        Request::from_http(builder.body(Bytes::new()).unwrap())
    }

    async fn who(req: Request) -> String {
        let access = req.context().get::<AccessClaims>().and_then(|c| c.0.sub);
        let refresh = req.context().get::<RefreshClaims>().and_then(|c| c.0.sub);
        format!("{access:?}/{refresh:?}")
    }

    async fn body_json(res: &Response) -> serde_json::Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    #[test]
    fn header_beats_cookie() {
        let gate = AuthGate::access(settings(), Arc::new(PrefixValidator));
        let req = request(&[("authorization", "Bearer   a-header  "), ("cookie", "access_token=a-cookie")]);
        assert_eq!(gate.extract_token(&req), Some("a-header"));
    }

    #[test]
    fn falls_back_to_kind_specific_cookie() {
        let access = AuthGate::access(settings(), Arc::new(PrefixValidator));
        let refresh = AuthGate::refresh(settings(), Arc::new(PrefixValidator));
        let req = request(&[
            ("authorization", "Basic dXNlcjpwYXNz"),
            ("cookie", "access_token=a-1; refresh_token=r-2"),
        ]);
        assert_eq!(access.extract_token(&req), Some("a-1"));
        assert_eq!(refresh.extract_token(&req), Some("r-2"));
    }

    #[tokio::test]
    async fn missing_token_is_rejected_before_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let chain = Pipeline::new()
            .with(AuthGate::access(settings(), Arc::new(PrefixValidator)))
            .into_chain(move |_req: Request| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "secret"
                }
            });

        let res = chain.handle(request(&[])).await;
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        let body = body_json(&res).await;
        assert_eq!(body["code"], "no_token");
        assert_eq!(body["error"], "access token missing");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_bearer_header_is_missing_even_with_a_cookie() {
        let gate = AuthGate::access(settings(), Arc::new(PrefixValidator));
        let req = request(&[("authorization", "Bearer    "), ("cookie", "access_token=a-cookie")]);
        assert_eq!(gate.extract_token(&req), None);

        let chain = Pipeline::new().with(gate).into_chain(who);
        let res = chain
            .handle(request(&[("authorization", "Bearer    "), ("cookie", "access_token=a-cookie")]))
            .await;
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(&res).await["code"], "no_token");
    }

    #[tokio::test]
    async fn invalid_token_hides_validator_detail() {
        let chain = Pipeline::new()
            .with(AuthGate::access(settings(), Arc::new(PrefixValidator)))
            .into_chain(who);

        let req = request(&[("authorization", "Bearer nope")]);
        let ctx = req.context().clone();
        let res = chain.handle(req).await;
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        let raw = std::str::from_utf8(res.body()).unwrap().to_owned();
        assert!(!raw.contains("kid=42"));
        assert_eq!(body_json(&res).await["code"], "invalid_token");

        let errors = ctx.take_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("kid=42"));
        assert!(ctx.is_aborted());
    }

    #[tokio::test]
    async fn access_claims_reach_handler() {
        let chain = Pipeline::new()
            .with(AuthGate::access(settings(), Arc::new(PrefixValidator)))
            .into_chain(who);
        let res = chain.handle(request(&[("cookie", "access_token=a-alice")])).await;
        assert_eq!(res.body().as_ref(), br#"Some("alice")/None"#);
    }

    #[tokio::test]
    async fn refresh_token_is_not_an_access_token() {
        let chain = Pipeline::new()
            .with(AuthGate::access(settings(), Arc::new(PrefixValidator)))
            .into_chain(who);
        let res = chain.handle(request(&[("authorization", "Bearer r-bob")])).await;
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);

        let chain = Pipeline::new()
            .with(AuthGate::refresh(settings(), Arc::new(PrefixValidator)))
            .into_chain(who);
        let res = chain.handle(request(&[("cookie", "access_token=a-bob; refresh_token=r-bob")])).await;
        assert_eq!(res.body().as_ref(), br#"None/Some("bob")"#);
    }

    #[test]
    fn claims_round_trip_through_json_with_extras() {
        let claims = Claims::subject("u1").with_scope("read").with_extra("tenant", serde_json::json!("acme"));
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json, serde_json::json!({"sub": "u1", "scopes": ["read"], "tenant": "acme"}));
        let back: Claims = serde_json::from_value(json).unwrap();
        assert_eq!(back.extra_as::<String>("tenant").as_deref(), Some("acme"));
        assert!(back.has_scope("read"));
        assert_eq!(back.extra_as::<u32>("tenant"), None);
    }
}
