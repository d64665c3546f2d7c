//! Built-in system endpoints.
//!
//! Mounted at the root, outside `base_path` and its access gate:
//!
//! | Path | Answer |
//! |---|---|
//! | `/livez`, `/sys/healthz` | `200 {"ok":true,"status":"live"}` while the process can answer at all |
//! | `/readyz`, `/sys/readyz` | `200 {"ok":true,"status":"ready"}` while running, `503` once draining |
//! | `/sys/info` | version, start time, uptime, address, base path |
//! | `/sys/routes` | every registered route |
//! | `/sys/routes/table` | prints the route table to stdout |

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, SecondsFormat};
use http::StatusCode;
use serde_json::json;

use crate::request::Request;
use crate::response::Response;
use crate::router::{RouteInfo, Router};
use crate::routes_table;
use crate::shutdown::ShutdownHandle;

/// State the system endpoints report on. Address and routes are only known
/// once the server has bound and compiled its table.
pub(crate) struct SysState {
    version: String,
    base_path: String,
    started_at: DateTime<Local>,
    started: Instant,
    addr: OnceLock<SocketAddr>,
    routes: OnceLock<Vec<RouteInfo>>,
    shutdown: ShutdownHandle,
}

impl SysState {
    pub(crate) fn new(version: String, base_path: String, shutdown: ShutdownHandle) -> Self {
        Self {
            version,
            base_path,
            started_at: Local::now(),
            started: Instant::now(),
            addr: OnceLock::new(),
            routes: OnceLock::new(),
            shutdown,
        }
    }

    pub(crate) fn set_addr(&self, addr: SocketAddr) {
        let _ = self.addr.set(addr);
    }

    pub(crate) fn set_routes(&self, routes: Vec<RouteInfo>) {
        let _ = self.routes.set(routes);
    }

    pub(crate) fn routes(&self) -> &[RouteInfo] {
        self.routes.get().map(Vec::as_slice).unwrap_or_default()
    }
}

/// Registers the system endpoints on `router`.
pub(crate) fn mount(router: Router, state: &Arc<SysState>) -> Router {
    let ready = {
        let state = Arc::clone(state);
        move |_req: Request| {
            let state = Arc::clone(&state);
            async move { readiness(&state) }
        }
    };
    let info = {
        let state = Arc::clone(state);
        move |_req: Request| {
            let state = Arc::clone(&state);
            async move { info(&state) }
        }
    };
    let routes = {
        let state = Arc::clone(state);
        move |_req: Request| {
            let state = Arc::clone(&state);
            async move { Response::json_value(StatusCode::OK, &json!({"ok": true, "routes": state.routes()})) }
        }
    };
    let table = {
        let state = Arc::clone(state);
        move |_req: Request| {
            let state = Arc::clone(&state);
            async move {
                routes_table::print(state.routes());
                Response::json_value(StatusCode::OK, &json!({"ok": true}))
            }
        }
    };

    router
        .get("/livez", liveness)
        .get("/readyz", ready.clone())
        .group("/sys", |sys| {
            sys.get("/healthz", liveness)
                .get("/readyz", ready)
                .get("/info", info)
                .get("/routes", routes)
                .get("/routes/table", table)
        })
}

/// Always `200`: answering at all is the liveness signal.
pub async fn liveness(_req: Request) -> Response {
    Response::json_value(StatusCode::OK, &json!({"ok": true, "status": "live"}))
}

fn readiness(state: &SysState) -> Response {
    if state.shutdown.phase().is_running() {
        Response::json_value(StatusCode::OK, &json!({"ok": true, "status": "ready"}))
    } else {
        Response::error(StatusCode::SERVICE_UNAVAILABLE, "not_ready", "server is shutting down", None)
    }
}

fn info(state: &SysState) -> Response {
    Response::json_value(
        StatusCode::OK,
        &json!({
            "ok": true,
            "version": state.version,
            "started": state.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "uptime": format_uptime(state.started.elapsed()),
            "addr": state.addr.get().map(ToString::to_string),
            "basePath": state.base_path,
        }),
    )
}

/// `3725s` → `1h2m5s`.
fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m{s}s"),
        _ => format!("{h}h{m}m{s}s"),
    }
}
