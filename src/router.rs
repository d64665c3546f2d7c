//! Radix-tree request router with route groups.
//!
//! One tree per HTTP method. O(path-length) lookup. Every route is compiled
//! into its own [`Chain`] when the router is sealed, so the interceptors that
//! apply to a route (its groups' and its own) are resolved once at startup,
//! never per request.
//!
//! ```text
//! Router::new()                       prefix ""
//!   .get("/livez", live)              → /livez             []
//!   .group("/api/v1", |api| api       prefix "/api/v1"
//!       .with(access_gate)            group stage
//!       .get("/me", me)               → /api/v1/me         [access_gate]
//!       .route_with(Method::Post, "/refresh", Pipeline::new().with(refresh_gate), refresh))
//!                                     → /api/v1/refresh    [access_gate, refresh_gate]
//! ```

use std::collections::HashMap;
use std::fmt;

use http::header::{self, HeaderValue};
use matchit::Router as MatchitRouter;
use serde::Serialize;

use crate::abort::Abort;
use crate::error::Error;
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::method::Method;
use crate::middleware::{Chain, Interceptor, Pipeline};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// One registered route, as listed by `/sys/routes` and the route table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub method: Method,
    pub path: String,
    pub handler: String,
}

struct Entry {
    method: Method,
    path: String,
    pipeline: Pipeline,
    handler: BoxedHandler,
    handler_name: String,
}

/// The application router.
///
/// Registrations chain by value. Interceptors added with [`Router::with`]
/// apply to every route of this router, including routes merged in from
/// nested groups, and run before each route's own interceptors.
#[derive(Default)]
pub struct Router {
    pipeline: Pipeline,
    entries: Vec<Entry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group-level interceptor.
    pub fn with(mut self, interceptor: impl Interceptor) -> Self {
        self.pipeline.push(interceptor);
        self
    }

    /// Registers a handler for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax; `req.param("name")` retrieves them:
    ///
    /// ```rust
    /// # use portico::{Method, Request, Response, Router};
    /// # async fn get_user(_: Request) -> Response { Response::text("") }
    /// # async fn create_user(_: Request) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::Get,  "/users/{id}", get_user)
    ///     .on(Method::Post, "/users",      create_user);
    /// ```
    pub fn on<H: Handler>(self, method: Method, path: &str, handler: H) -> Self {
        self.route_with(method, path, Pipeline::new(), handler)
    }

    /// Registers a handler behind route-level interceptors.
    pub fn route_with<H: Handler>(mut self, method: Method, path: &str, pipeline: Pipeline, handler: H) -> Self {
        self.entries.push(Entry {
            method,
            path: path.to_owned(),
            pipeline,
            handler: handler.into_boxed_handler(),
            handler_name: short_type_name::<H>(),
        });
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Get, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Post, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Put, path, handler)
    }

    pub fn patch(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Patch, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Delete, path, handler)
    }

    /// Registers the routes built by `build` under `prefix`.
    pub fn group(self, prefix: &str, build: impl FnOnce(Router) -> Router) -> Self {
        self.nest(prefix, build(Router::new()))
    }

    /// Merges `child` under `prefix`. The child's group interceptors run
    /// before each of its routes' own.
    pub fn nest(mut self, prefix: &str, child: Router) -> Self {
        let Router { pipeline: group, entries } = child;
        for entry in entries {
            let mut pipeline = group.clone();
            pipeline.extend(&entry.pipeline);
            self.entries.push(Entry { path: join(prefix, &entry.path), pipeline, ..entry });
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        self.entries.iter().map(Entry::info).collect()
    }

    /// Seals every route into its chain: this router's group stages, then
    /// the route's own, then the handler.
    pub(crate) fn compile(self) -> Result<RouteTable, Error> {
        let mut trees: HashMap<Method, MatchitRouter<Chain>> = HashMap::new();
        let mut listing = Vec::with_capacity(self.entries.len());

        for entry in self.entries {
            listing.push(entry.info());

            let mut pipeline = self.pipeline.clone();
            pipeline.extend(&entry.pipeline);
            let chain = pipeline.into_chain_boxed(entry.handler);

            trees
                .entry(entry.method)
                .or_default()
                .insert(entry.path.as_str(), chain)
                .map_err(|e| Error::config(format!("invalid route {} {}: {e}", entry.method, entry.path)))?;
        }

        Ok(RouteTable { trees, listing })
    }
}

impl Entry {
    fn info(&self) -> RouteInfo {
        RouteInfo { method: self.method, path: self.path.clone(), handler: self.handler_name.clone() }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("interceptors", &self.pipeline.names())
            .field("routes", &self.routes())
            .finish()
    }
}

/// `"/api/v1" + "/users"`; a group's `/` is the prefix itself.
fn join(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    match path {
        "" | "/" if !prefix.is_empty() => prefix.to_owned(),
        _ if path.starts_with('/') => format!("{prefix}{path}"),
        _ => format!("{prefix}/{path}"),
    }
}

/// `my_app::handlers::list_users` → `list_users`.
fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    if base.ends_with("{{closure}}") {
        return "closure".to_owned();
    }
    base.rsplit("::").next().unwrap_or(base).to_owned()
}

// ── Sealed table ──────────────────────────────────────────────────────────────

/// Result of a lookup.
pub(crate) enum Lookup {
    Found(Chain, HashMap<String, String>),
    /// The path exists under other methods only.
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

/// Compiled routes. Immutable once the server starts.
pub(crate) struct RouteTable {
    trees: HashMap<Method, MatchitRouter<Chain>>,
    listing: Vec<RouteInfo>,
}

impl RouteTable {
    /// `HEAD` falls back to the `GET` route when none is registered for it.
    pub(crate) fn lookup(&self, method: &http::Method, path: &str) -> Lookup {
        let method = Method::from_http(method);
        if let Some(found) = method.and_then(|m| self.find(m, path)) {
            return found;
        }
        if method == Some(Method::Head) {
            if let Some(found) = self.find(Method::Get, path) {
                return found;
            }
        }

        let allowed: Vec<Method> = Method::ALL
            .iter()
            .copied()
            .filter(|m| self.trees.get(m).is_some_and(|tree| tree.at(path).is_ok()))
            .collect();
        if allowed.is_empty() { Lookup::NotFound } else { Lookup::MethodNotAllowed(allowed) }
    }

    /// Routes `req` into its chain. Unknown paths get the `404` envelope,
    /// known paths with the wrong method the `405` one plus `Allow`.
    pub(crate) fn dispatch(&self, mut req: Request) -> BoxFuture<Response> {
        match self.lookup(req.method(), req.path()) {
            Lookup::Found(chain, params) => {
                req.params = params;
                Box::pin(async move { chain.handle(req).await })
            }
            Lookup::MethodNotAllowed(allowed) => {
                let mut res = Abort::method_not_allowed().into_response();
                let allow = allowed.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ");
                if let Ok(value) = HeaderValue::from_str(&allow) {
                    res.headers_mut().insert(header::ALLOW, value);
                }
                Box::pin(std::future::ready(res))
            }
            Lookup::NotFound => Box::pin(std::future::ready(Abort::not_found().into_response())),
        }
    }

    fn find(&self, method: Method, path: &str) -> Option<Lookup> {
        let matched = self.trees.get(&method)?.at(path).ok()?;
        let params = matched.params.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
        Some(Lookup::Found(matched.value.clone(), params))
    }

    pub(crate) fn routes(&self) -> &[RouteInfo] {
        &self.listing
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::middleware::{Next, from_fn};

    async fn noop(_req: Request) -> &'static str {
        "noop"
    }

    fn tag(label: &'static str) -> impl Interceptor {
        from_fn(label, move |req: Request, next: Next| async move {
            let mut res = next.run(req).await?;
            let trail = res
                .headers()
                .get("x-trail")
                .and_then(|v| v.to_str().ok())
                .map(|t| format!("{label},{t}"))
                .unwrap_or_else(|| label.to_owned());
            res.headers_mut().insert("x-trail", trail.parse().map_err(|_| Abort::internal())?);
            Ok(res)
        })
    }

    fn request(method: http::Method, path: &str) -> Request {
        Request::from_http(http::Request::builder().method(method).uri(path).body(Bytes::new()).unwrap())
    }

    #[test]
    fn joins_prefixes() {
        assert_eq!(join("/api/v1", "/users"), "/api/v1/users");
        assert_eq!(join("/api/v1/", "users"), "/api/v1/users");
        assert_eq!(join("/api", "/"), "/api");
        assert_eq!(join("", "/"), "/");
    }

    #[test]
    fn names_handlers_by_their_last_path_segment() {
        assert_eq!(short_type_name::<fn()>(), "fn()");
        let router = Router::new().get("/noop", noop);
        assert_eq!(router.routes()[0].handler, "noop");
    }

    #[tokio::test]
    async fn outer_group_then_inner_group_then_route_interceptors() {
        let table = Router::new()
            .with(tag("outer"))
            .get("/open", noop)
            .group("/api", |api| {
                api.with(tag("group"))
                    .route_with(Method::Get, "/users/{id}", Pipeline::new().with(tag("route")), |req: Request| async move {
                        req.param("id").unwrap_or_default().to_owned()
                    })
            })
            .compile()
            .unwrap();

        let res = table.dispatch(request(http::Method::GET, "/api/users/42")).await;
        assert_eq!(res.body().as_ref(), b"42");
        // Outermost stage tags last on the way out.
        assert_eq!(res.headers()["x-trail"], "outer,group,route");

        let res = table.dispatch(request(http::Method::GET, "/open")).await;
        assert_eq!(res.headers()["x-trail"], "outer");
    }

    #[tokio::test]
    async fn distinguishes_not_found_from_wrong_method() {
        let table = Router::new().post("/items", noop).put("/items", noop).compile().unwrap();
        assert!(matches!(table.lookup(&http::Method::POST, "/items"), Lookup::Found(..)));
        match table.lookup(&http::Method::GET, "/items") {
            Lookup::MethodNotAllowed(allowed) => assert_eq!(allowed, [Method::Post, Method::Put]),
            _ => panic!("expected 405"),
        }

        let res = table.dispatch(request(http::Method::GET, "/items")).await;
        assert_eq!(res.status_code(), http::StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers()[header::ALLOW], "POST, PUT");
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["code"], "method_not_allowed");

        let res = table.dispatch(request(http::Method::GET, "/nothing")).await;
        assert_eq!(res.status_code(), http::StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["code"], "not_found");
    }

    #[test]
    fn head_falls_back_to_get() {
        let table = Router::new().get("/x", noop).compile().unwrap();
        assert!(matches!(table.lookup(&http::Method::HEAD, "/x"), Lookup::Found(..)));
    }

    #[test]
    fn conflicting_routes_fail_to_compile() {
        let err = Router::new().get("/users/{id}", noop).get("/users/{name}", noop).compile().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn listing_keeps_registration_order() {
        let router = Router::new().get("/a", noop).group("/g", |g| g.delete("/b", noop));
        let table = router.compile().unwrap();
        let paths: Vec<_> = table.routes().iter().map(|r| (r.method, r.path.as_str())).collect();
        assert_eq!(paths, [(Method::Get, "/a"), (Method::Delete, "/g/b")]);
    }
}
