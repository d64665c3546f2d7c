//! portico demo: gated JSON API, CORS, request deadline, rotating logs.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/livez
//!   curl -i http://localhost:3000/api/v1/me                          # 401 no_token
//!   curl -i -H 'Authorization: Bearer ok' http://localhost:3000/api/v1/me
//!   curl -i -H 'Authorization: Bearer ok' http://localhost:3000/api/v1/slow   # 504 after 2s
//!   curl -i -X OPTIONS -H 'Origin: https://app.example.com' http://localhost:3000/api/v1/me
//!   curl -i --cookie 'refresh_token=ok' -H 'Authorization: Bearer ok' -X POST \
//!        http://localhost:3000/api/v1/auth/refresh
//!   curl http://localhost:3000/sys/info
//!
//! Ctrl-C drains in-flight requests and prints the shutdown report.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use portico::{
    AccessClaims, AuthGate, Claims, Config, Method, Pipeline, RefreshClaims, Request, Response, Router,
    ServerBuilder, StubValidator,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut config = Config::default().with_env_overrides();
    config.port = 3000;
    config.base_path = "/api/v1".into();
    config.print_routes = true;
    config.cors.allowed_origins = vec!["https://*.example.com".into(), "http://localhost:5173".into()];
    config.cors.allow_credentials = true;
    config.request_timeout.duration = Duration::from_secs(2);
    config.log.access_file = Some("logs/access.log".into());
    config.log.error_file = Some("logs/error.log".into());
    config.log.rotate_max_size = 1024 * 1024;
    config.log.rotate_backups = 3;
    config.auth.access_cookie = Some("access_token".into());
    config.auth.refresh_cookie = Some("refresh_token".into());
    config.auth.enable_access_gate = true;

    let validator = StubValidator::new("ok", Claims::subject("alice").with_role("admin").with_scope("read"));
    let refresh_stage = Pipeline::new().with(AuthGate::refresh(config.auth.clone(), Arc::new(validator.clone())));

    let server = ServerBuilder::new(config)
        .token_validator(validator)
        .register(|api: Router| api.get("/me", me).get("/slow", slow))
        .register(move |api: Router| {
            api.group("/auth", |auth| {
                auth.route_with(Method::Post, "/refresh", refresh_stage.clone(), refresh)
            })
        })
        .before_start(|| async {
            tracing::info!("warming caches");
            Ok::<(), portico::BoxError>(())
        })
        .before_stop(|| async {
            tracing::info!("deregistering from service discovery");
            Ok::<(), portico::BoxError>(())
        })
        .build()
        .expect("invalid server configuration");

    match server.serve().await {
        Ok(report) => println!(
            "stopped: {} drained, {} abandoned in {:?}",
            report.drained, report.abandoned, report.elapsed
        ),
        Err(e) => eprintln!("server error: {e}"),
    }
}

// GET /api/v1/me
async fn me(req: Request) -> Response {
    match req.context().get::<AccessClaims>() {
        Some(AccessClaims(claims)) => Response::json_value(StatusCode::OK, &claims),
        None => Response::status(StatusCode::UNAUTHORIZED),
    }
}

// GET /api/v1/slow: outlives the 2s deadline unless cancelled.
async fn slow(req: Request) -> &'static str {
    tokio::select! {
        _ = req.cancelled() => tracing::info!("slow handler saw cancellation"),
        _ = tokio::time::sleep(Duration::from_secs(10)) => {}
    }
    "finally"
}

// POST /api/v1/auth/refresh: behind both the access and the refresh gate.
async fn refresh(req: Request) -> Response {
    let subject = req.context().get::<RefreshClaims>().and_then(|c| c.0.sub);
    Response::json_value(StatusCode::OK, &serde_json::json!({ "ok": true, "refreshed_for": subject }))
}
