//! Draining and abandoning in-flight requests over a real socket.

use std::sync::Arc;
use std::time::Duration;

use portico::middleware::{Next, from_fn};
use portico::sink::{LogSink, LogSinks};
use portico::{Config, Phase, Request, Router, ServerBuilder, ShutdownReport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

fn config(shutdown_timeout: Duration) -> Config {
    let mut config = Config::default();
    config.handle_signals = false;
    config.shutdown_timeout = shutdown_timeout;
    config
}

fn quiet() -> LogSinks {
    LogSinks { access: LogSink::stdout("access"), error: LogSink::stderr("error") }
}

/// Server with one `/work` route that announces its start on `started` and
/// then sleeps for `work`.
async fn start(
    shutdown_timeout: Duration,
    work: Duration,
    started: Arc<Notify>,
) -> (std::net::SocketAddr, portico::ShutdownHandle, JoinHandle<Result<ShutdownReport, portico::Error>>) {
    let server = ServerBuilder::new(config(shutdown_timeout))
        .sinks(quiet())
        .register(move |api: Router| {
            let started = Arc::clone(&started);
            api.get("/work", move |_req: Request| {
                let started = Arc::clone(&started);
                async move {
                    started.notify_one();
                    tokio::time::sleep(work).await;
                    "done"
                }
            })
        })
        .build()
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let serving = tokio::spawn(server.serve_on(listener));
    (addr, handle, serving)
}

async fn get(addr: std::net::SocketAddr, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").as_bytes())
        .await?;
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;
    Ok(raw)
}

#[tokio::test]
async fn in_flight_request_is_drained() {
    let started = Arc::new(Notify::new());
    let (addr, handle, serving) = start(Duration::from_secs(5), Duration::from_millis(300), Arc::clone(&started)).await;

    let response = tokio::spawn(get(addr, "/work"));
    started.notified().await;

    let report = handle.shutdown().await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.abandoned, 0);

    let raw = response.await.unwrap().unwrap();
    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    assert!(raw.ends_with("done"), "{raw}");

    assert_eq!(serving.await.unwrap().unwrap(), report);
    assert_eq!(handle.phase(), Phase::Stopped(report));

    // Repeated calls observe the same completed shutdown.
    assert_eq!(handle.shutdown().await, Some(report));

    assert!(get(addr, "/livez").await.is_err());
}

#[tokio::test]
async fn slow_request_is_abandoned_after_timeout() {
    let started = Arc::new(Notify::new());
    let (addr, handle, serving) = start(Duration::from_millis(100), Duration::from_secs(5), Arc::clone(&started)).await;

    let response = tokio::spawn(get(addr, "/work"));
    started.notified().await;

    let begun = std::time::Instant::now();
    let report = handle.shutdown().await.unwrap();
    assert!(begun.elapsed() < Duration::from_secs(2));
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.drained, 0);

    // The client sees the connection go away without a response.
    let raw = response.await.unwrap().unwrap_or_default();
    assert!(!raw.contains("done"));

    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn idle_server_stops_with_empty_report() {
    let started = Arc::new(Notify::new());
    let (addr, handle, serving) = start(Duration::from_secs(1), Duration::ZERO, started).await;

    let raw = get(addr, "/readyz").await.unwrap();
    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");

    let report = handle.shutdown().await.unwrap();
    assert_eq!((report.drained, report.abandoned), (0, 0));
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn handle_outliving_a_dropped_server_reports_nothing() {
    let server = ServerBuilder::new(config(Duration::from_secs(1))).sinks(quiet()).build().unwrap();
    let handle = server.shutdown_handle();
    drop(server);
    assert!(!handle.request());
    assert_eq!(handle.shutdown().await, None);
}

#[tokio::test]
async fn sinks_are_closed_and_late_writes_dropped_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let access_path = dir.path().join("access.log");
    let error_path = dir.path().join("error.log");
    let sinks = Arc::new(LogSinks {
        access: LogSink::open("access", &access_path, 0, 0).unwrap(),
        error: LogSink::open("error", &error_path, 0, 0).unwrap(),
    });

    let mut config = config(Duration::from_millis(100));
    // Forks the chain onto its own task, which outlives the aborted connection.
    config.request_timeout.duration = Duration::from_secs(10);

    let started = Arc::new(Notify::new());
    let finished = Arc::new(Notify::new());
    let late_sinks = Arc::clone(&sinks);
    let late_done = Arc::clone(&finished);
    let server = ServerBuilder::new(config)
        .sinks(Arc::clone(&sinks))
        .interceptor(from_fn("late_log", move |req: Request, next: Next| {
            let sinks = Arc::clone(&late_sinks);
            let done = Arc::clone(&late_done);
            async move {
                let slow = req.query() == Some("slow");
                let outcome = next.run(req).await;
                if slow {
                    sinks.access.write_line("late access line");
                    sinks.error.write_line("late error line");
                    done.notify_one();
                }
                outcome
            }
        }))
        .register({
            let started = Arc::clone(&started);
            move |api: Router| {
                let started = Arc::clone(&started);
                api.get("/work", move |req: Request| {
                    let started = Arc::clone(&started);
                    async move {
                        if req.query() == Some("slow") {
                            started.notify_one();
                            tokio::time::sleep(Duration::from_millis(600)).await;
                        }
                        "done"
                    }
                })
            }
        })
        .build()
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let serving = tokio::spawn(server.serve_on(listener));

    // One request completes normally and is logged.
    let raw = get(addr, "/work").await.unwrap();
    assert!(raw.ends_with("done"), "{raw}");

    let pending = tokio::spawn(get(addr, "/work?slow"));
    started.notified().await;

    let report = handle.shutdown().await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert!(sinks.access.is_closed());
    assert!(sinks.error.is_closed());
    serving.await.unwrap().unwrap();
    let _ = pending.await;

    let access_at_stop = std::fs::read_to_string(&access_path).unwrap();
    let error_at_stop = std::fs::read_to_string(&error_path).unwrap();
    assert!(access_at_stop.contains("| 200 |"), "{access_at_stop}");

    // The abandoned request's task finishes after the stop and tries to log.
    tokio::time::timeout(Duration::from_secs(2), finished.notified()).await.unwrap();
    assert_eq!(std::fs::read_to_string(&access_path).unwrap(), access_at_stop);
    assert_eq!(std::fs::read_to_string(&error_path).unwrap(), error_at_stop);
    assert!(!access_at_stop.contains("late"));
}

#[tokio::test]
async fn idle_keep_alive_connection_is_closed() {
    let mut config = config(Duration::from_secs(1));
    config.timeouts.idle = Duration::from_millis(200);
    config.timeouts.read_header = Duration::from_secs(30);
    let server = ServerBuilder::new(config).sinks(quiet()).build().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let serving = tokio::spawn(server.serve_on(listener));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /livez HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();

    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    while !raw.ends_with(b"}") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before the response");
        raw.extend_from_slice(&buf[..n]);
    }
    assert!(raw.starts_with(b"HTTP/1.1 200"));

    // Kept alive after the response, then closed once idle.
    let begun = std::time::Instant::now();
    let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
    assert!(begun.elapsed() >= Duration::from_millis(100), "{:?}", begun.elapsed());

    handle.shutdown().await.unwrap();
    serving.await.unwrap().unwrap();
}
