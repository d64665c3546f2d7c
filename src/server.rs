//! Server assembly, the accept loop and graceful shutdown.
//!
//! # Request path
//!
//! ```text
//! accept ─▶ hyper conn (HTTP/1.1 or HTTP/2) ─▶ read body (timeouts.read)
//!        ─▶ trace ─▶ recovery ─▶ error_capture ─▶ request_id ─▶ cors ─▶ [timeout]
//!        ─▶ user interceptors ─▶ router ─▶ group stages ─▶ route stages ─▶ handler
//! ```
//!
//! The whole dispatch is bounded by `timeouts.write`; past it the connection
//! is closed without a response. A connection with no request in flight for
//! `timeouts.idle` is closed, whichever protocol it speaks; HTTP/1.1 heads
//! must also arrive within `timeouts.read_header`.
//!
//! # Shutdown
//!
//! When a [`ShutdownHandle`] (or SIGINT/SIGTERM) asks for it:
//!
//! 1. `before_stop` hooks run
//! 2. phase becomes `Draining`: the listener is dropped and every connection
//!    is told to finish its in-flight request and close
//! 3. after `shutdown_timeout`, whatever is still running is abandoned:
//!    request scopes are cancelled and connection tasks aborted
//! 4. the access sink, then the error sink, are closed
//! 5. phase becomes `Stopped` with the [`ShutdownReport`]
//!
//! Set `terminationGracePeriodSeconds` in your pod spec longer than
//! `shutdown_timeout`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use parking_lot::Mutex;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::abort::Abort;
use crate::config::{Config, HttpTimeouts};
use crate::context::{Cancellation, RequestContext};
use crate::error::{BoxError, Error};
use crate::handler::BoxFuture;
use crate::middleware::auth::{AuthGate, TokenValidator};
use crate::middleware::capture::ErrorCaptureInterceptor;
use crate::middleware::cors::{CorsInterceptor, CorsPolicy};
use crate::middleware::recovery::RecoveryInterceptor;
use crate::middleware::request_id::RequestIdInterceptor;
use crate::middleware::timeout::TimeoutInterceptor;
use crate::middleware::trace::TraceInterceptor;
use crate::middleware::{Chain, Interceptor, Pipeline};
use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::router::{RouteInfo, Router};
use crate::routes_table;
use crate::shutdown::{self, Coordinator, ShutdownHandle, ShutdownReport};
use crate::sink::{LogSink, LogSinks};
use crate::sys::{self, SysState};

type Hook = Box<dyn FnOnce() -> BoxFuture<Result<(), BoxError>> + Send>;

fn boxed_hook<F, Fut>(hook: F) -> Hook
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Box::new(move || Box::pin(hook()))
}

// ── Route registration ───────────────────────────────────────────────────────

/// A module that contributes routes to the `base_path` group without
/// knowing anything else about the server.
pub trait RouteRegistrar: Send + 'static {
    fn register(&self, group: Router) -> Router;
}

impl<F> RouteRegistrar for F
where
    F: Fn(Router) -> Router + Send + 'static,
{
    fn register(&self, group: Router) -> Router {
        self(group)
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Configures a [`Server`]. Nothing here can change once [`build`](Self::build)
/// has run.
///
/// ```rust,no_run
/// use portico::{Config, Request, Router, ServerBuilder, StubValidator};
///
/// async fn me(req: Request) -> String {
///     format!("{:?}", req.context().get::<portico::AccessClaims>())
/// }
///
/// # async fn run() -> Result<(), portico::Error> {
/// let mut config = Config::default();
/// config.base_path = "/api/v1".into();
/// config.auth.enable_access_gate = true;
///
/// let server = ServerBuilder::new(config)
///     .token_validator(StubValidator::default())
///     .register(|api: Router| api.get("/me", me))
///     .build()?;
/// server.serve().await?;
/// # Ok(())
/// # }
/// ```
pub struct ServerBuilder {
    config: Config,
    validator: Option<Arc<dyn TokenValidator>>,
    registrars: Vec<Box<dyn RouteRegistrar>>,
    interceptors: Pipeline,
    sinks: Option<Arc<LogSinks>>,
    before_start: Vec<Hook>,
    before_stop: Vec<Hook>,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            validator: None,
            registrars: Vec::new(),
            interceptors: Pipeline::new(),
            sinks: None,
            before_start: Vec::new(),
            before_stop: Vec::new(),
        }
    }

    /// Validator behind the `base_path` access gate. Route-level gates take
    /// their validator directly, see [`AuthGate`].
    pub fn token_validator(mut self, validator: impl TokenValidator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Adds routes under `base_path`.
    pub fn register(mut self, registrar: impl RouteRegistrar) -> Self {
        self.registrars.push(Box::new(registrar));
        self
    }

    /// Adds a global interceptor after the built-in ones.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Uses these sinks instead of opening the ones named in the config.
    ///
    /// Pass an `Arc` to keep a handle of your own. The server still closes
    /// them when it stops, and anything written afterwards is dropped.
    pub fn sinks(mut self, sinks: impl Into<Arc<LogSinks>>) -> Self {
        self.sinks = Some(sinks.into());
        self
    }

    /// Runs before the first connection is accepted. An error aborts start.
    pub fn before_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.before_start.push(boxed_hook(hook));
        self
    }

    /// Runs when shutdown begins, before draining. Errors are logged.
    pub fn before_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.before_stop.push(boxed_hook(hook));
        self
    }

    pub fn build(self) -> Result<Server, Error> {
        let config = self.config.normalized();

        let sinks = match self.sinks {
            Some(sinks) => sinks,
            None => Arc::new(LogSinks {
                access: LogSink::from_settings(
                    "access",
                    config.log.access_file.as_deref(),
                    config.log.rotate_max_size,
                    config.log.rotate_backups,
                    LogSink::stdout,
                )?,
                error: LogSink::from_settings(
                    "error",
                    config.log.error_file.as_deref(),
                    config.log.rotate_max_size,
                    config.log.rotate_backups,
                    LogSink::stderr,
                )?,
            }),
        };

        let mut global = Pipeline::new()
            .with(TraceInterceptor::new(Arc::clone(&sinks)))
            .with(RecoveryInterceptor::new(Arc::clone(&sinks)))
            .with(ErrorCaptureInterceptor::new(Arc::clone(&sinks)))
            .with(RequestIdInterceptor::new(&config.request_id_header))
            .with(CorsInterceptor::new(CorsPolicy::new(&config.cors)));
        let timeout = config.request_timeout.policy();
        if timeout.is_enabled() {
            global.push(TimeoutInterceptor::new(timeout));
        }
        global.extend(&self.interceptors);

        let mut api = Router::new();
        if config.auth.enable_access_gate {
            let validator = self
                .validator
                .ok_or_else(|| Error::config("auth.enable_access_gate is set but no token validator was provided"))?;
            api = api.with(AuthGate::access(config.auth.clone(), validator));
        }
        for registrar in &self.registrars {
            api = registrar.register(api);
        }

        let (coordinator, handle) = shutdown::channel();
        let sys = Arc::new(SysState::new(config.version.clone(), config.base_path.clone(), handle.clone()));
        let router = sys::mount(Router::new(), &sys).nest(&config.base_path, api);
        let table = Arc::new(router.compile()?);
        sys.set_routes(table.routes().to_vec());

        let entry = global.into_chain(move |req: Request| table.dispatch(req));

        Ok(Server {
            app: Arc::new(App {
                entry,
                sinks,
                sys,
                scope: Cancellation::new(),
                in_flight: AtomicUsize::new(0),
                timeouts: config.timeouts,
            }),
            config,
            before_start: self.before_start,
            before_stop: self.before_stop,
            coordinator,
            handle,
        })
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

/// Everything a connection task needs, shared across all of them.
struct App {
    entry: Chain,
    sinks: Arc<LogSinks>,
    sys: Arc<SysState>,
    /// Parent of every request scope; cancelled when draining gives up.
    scope: Cancellation,
    in_flight: AtomicUsize,
    timeouts: HttpTimeouts,
}

impl App {
    async fn call(&self, req: http::Request<Bytes>, remote_addr: Option<SocketAddr>) -> Response {
        let mut req = Request::from_http(req);
        req.ctx = RequestContext::with_cancellation(self.scope.child());
        if let Some(addr) = remote_addr {
            req = req.with_remote_addr(addr);
        }
        self.entry.handle(req).await
    }
}

/// Counts a request as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A built server, ready to serve.
pub struct Server {
    app: Arc<App>,
    config: Config,
    before_start: Vec<Hook>,
    before_stop: Vec<Hook>,
    coordinator: Coordinator,
    handle: ShutdownHandle,
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// The normalized configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every route, system endpoints included.
    pub fn routes(&self) -> &[RouteInfo] {
        self.app.sys.routes()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// Runs one request through the full chain without a socket.
    pub async fn call(&self, req: http::Request<Bytes>) -> Response {
        self.app.call(req, None).await
    }

    /// Binds `host:port` from the config and serves until shut down.
    pub async fn serve(self) -> Result<ShutdownReport, Error> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind { addr, source })?;
        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener until shut down.
    pub async fn serve_on(self, listener: TcpListener) -> Result<ShutdownReport, Error> {
        let Server { app, config, before_start, before_stop, mut coordinator, handle } = self;

        for hook in before_start {
            hook().await.map_err(|e| Error::Hook(e.to_string()))?;
        }

        let local_addr = listener.local_addr()?;
        app.sys.set_addr(local_addr);
        if config.print_routes {
            routes_table::print(app.sys.routes());
        }
        let signals = config.handle_signals.then(|| shutdown::spawn_signal_listener(handle.clone()));

        let mut builder = ConnBuilder::new(TokioExecutor::new());
        builder.http1().timer(TokioTimer::new()).header_read_timeout(config.timeouts.read_header);
        builder.http2().timer(TokioTimer::new());

        let graceful = GracefulShutdown::new();
        let mut tasks = JoinSet::new();

        info!(addr = %local_addr, base_path = %config.base_path, "portico listening");

        let trigger = loop {
            tokio::select! {
                // Check shutdown first so a request stops accepting at once,
                // even with connections queued.
                biased;

                trigger = coordinator.requested() => break trigger,

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let activity = Arc::new(ConnActivity::new());
                    let svc = {
                        let activity = Arc::clone(&activity);
                        service_fn(move |req: hyper::Request<Incoming>| {
                            let app = Arc::clone(&app);
                            let activity = Arc::clone(&activity);
                            async move {
                                let _busy = activity.enter();
                                serve_request(&app, req, remote_addr).await
                            }
                        })
                    };
                    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);
                    let conn: BoxFuture<Result<(), BoxError>> = Box::pin(graceful.watch(conn.into_owned()));
                    let idle = config.timeouts.idle;

                    tasks.spawn(async move {
                        tokio::select! {
                            res = conn => if let Err(e) = res {
                                debug!(peer = %remote_addr, "connection closed with error: {e}");
                            },
                            () = activity.idle_for(idle) => {
                                debug!(peer = %remote_addr, ?idle, "closing idle connection");
                            }
                        }
                    });
                }

                // Reap finished connection tasks so the set does not grow
                // without bound.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        let started = Instant::now();
        info!(%trigger, "shutdown started");

        for hook in before_stop {
            if let Err(e) = hook().await {
                warn!("before_stop hook failed: {e}");
            }
        }

        coordinator.draining();
        drop(listener);
        let pending = app.in_flight.load(Ordering::SeqCst);
        info!(in_flight = pending, connections = tasks.len(), "draining");

        let drained_in_time = tokio::select! {
            () = graceful.shutdown() => true,
            () = tokio::time::sleep(config.shutdown_timeout) => false,
        };
        let abandoned = if drained_in_time {
            0
        } else {
            let abandoned = app.in_flight.load(Ordering::SeqCst);
            warn!(abandoned, timeout = ?config.shutdown_timeout, "drain timed out, abandoning requests");
            app.scope.cancel();
            tasks.abort_all();
            abandoned
        };
        while tasks.join_next().await.is_some() {}

        if let Some(signals) = signals {
            signals.abort();
        }
        app.sinks.close();

        let report = ShutdownReport {
            drained: pending.saturating_sub(abandoned),
            abandoned,
            elapsed: started.elapsed(),
        };
        coordinator.stopped(report);
        info!(drained = report.drained, abandoned = report.abandoned, elapsed = ?report.elapsed, "portico stopped");
        Ok(report)
    }
}

// ── Connection idle tracking ─────────────────────────────────────────────────

/// Requests in flight on one connection and when the last one finished.
struct ConnActivity {
    busy: AtomicUsize,
    last: Mutex<tokio::time::Instant>,
}

impl ConnActivity {
    fn new() -> Self {
        Self { busy: AtomicUsize::new(0), last: Mutex::new(tokio::time::Instant::now()) }
    }

    fn enter(&self) -> Busy<'_> {
        self.busy.fetch_add(1, Ordering::SeqCst);
        Busy(self)
    }

    /// Resolves once the connection has had no request in flight for `idle`.
    async fn idle_for(&self, idle: Duration) {
        loop {
            let wait = if self.busy.load(Ordering::SeqCst) > 0 {
                idle
            } else {
                let quiet = self.last.lock().elapsed();
                if quiet >= idle {
                    return;
                }
                idle - quiet
            };
            tokio::time::sleep(wait).await;
        }
    }
}

struct Busy<'a>(&'a ConnActivity);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        *self.0.last.lock() = tokio::time::Instant::now();
        self.0.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Request dispatch ─────────────────────────────────────────────────────────

/// One request on one connection. Failures inside the chain are responses;
/// only an expired write deadline surfaces as a service error, which makes
/// hyper close the connection.
async fn serve_request(
    app: &App,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, BoxError> {
    let _in_flight = InFlight::enter(&app.in_flight);
    let (parts, body) = req.into_parts();

    let body = match tokio::time::timeout(app.timeouts.read, body.collect()).await {
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(e)) => {
            debug!(peer = %remote_addr, "request body read failed: {e}");
            let abort = Abort::new(StatusCode::BAD_REQUEST, "bad_request", "failed to read request body");
            return Ok(abort.into_response().into_inner());
        }
        Err(_) => {
            warn!(peer = %remote_addr, method = %parts.method, path = parts.uri.path(), "request body read timed out");
            let abort = Abort::new(StatusCode::REQUEST_TIMEOUT, "read_timeout", "request body read timed out");
            return Ok(abort.into_response().into_inner());
        }
    };

    let req = http::Request::from_parts(parts, body);
    match tokio::time::timeout(app.timeouts.write, app.call(req, Some(remote_addr))).await {
        Ok(res) => Ok(res.into_inner()),
        Err(_) => {
            warn!(peer = %remote_addr, timeout = ?app.timeouts.write, "response not produced within write timeout");
            Err("write timeout exceeded".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::auth::StubValidator;

    fn quiet() -> LogSinks {
        LogSinks { access: LogSink::stdout("access"), error: LogSink::stderr("error") }
    }

    #[test]
    fn access_gate_without_validator_is_a_build_error() {
        let mut config = Config::default();
        config.auth.enable_access_gate = true;
        let err = ServerBuilder::new(config).sinks(quiet()).build().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn gate_covers_base_path_but_not_system_routes() {
        let mut config = Config::default();
        config.base_path = "/api".into();
        config.auth.enable_access_gate = true;
        let server = ServerBuilder::new(config)
            .sinks(quiet())
            .token_validator(StubValidator::default())
            .register(|api: Router| api.get("/ping", |_req: Request| async { "pong" }))
            .build()
            .unwrap();

        let get = |path: &str, token: Option<&str>| {
            let mut builder = http::Request::builder().uri(path);
            if let Some(token) = token {
                builder = builder.header("Authorization", format!("Bearer {token}"));
            }
            builder.body(Bytes::new()).unwrap()
        };

        assert_eq!(server.call(get("/api/ping", None)).await.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.call(get("/api/ping", Some("ok"))).await.body().as_ref(), b"pong");
        assert_eq!(server.call(get("/livez", None)).await.status_code(), StatusCode::OK);
        assert!(server.routes().iter().any(|r| r.path == "/api/ping"));
    }

    #[tokio::test]
    async fn idle_clock_only_runs_between_requests() {
        let activity = ConnActivity::new();
        let idle = Duration::from_millis(50);

        let busy = activity.enter();
        assert!(tokio::time::timeout(Duration::from_millis(150), activity.idle_for(idle)).await.is_err());
        drop(busy);

        let start = Instant::now();
        activity.idle_for(idle).await;
        assert!(start.elapsed() >= Duration::from_millis(40), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn before_start_failure_aborts_serve() {
        let server = ServerBuilder::new(Config::default())
            .sinks(quiet())
            .before_start(|| async { Err::<(), BoxError>("migrations pending".into()) })
            .build()
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = server.serve_on(listener).await.err().unwrap();
        assert!(matches!(err, Error::Hook(msg) if msg.contains("migrations pending")));
    }
}
