//! Graceful shutdown coordination.
//!
//! The server moves through three phases, published on a `watch` channel:
//!
//! ```text
//! Running ──request──▶ Draining ──drained or timed out──▶ Stopped(report)
//! ```
//!
//! Anything that wants the server down sends a message on the control
//! channel through a [`ShutdownHandle`]. SIGINT/SIGTERM are just another
//! sender: a listener task translates them into the same message.
//!
//! The sequence itself (hooks, drain, sink close) is run by the serve loop;
//! this module owns the phases, the handle and the signal adapter.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How a shutdown was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// [`ShutdownHandle::request`] or [`ShutdownHandle::shutdown`].
    Requested,
    /// An OS signal, by name.
    Signal(&'static str),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::Signal(name) => write!(f, "signal {name}"),
        }
    }
}

/// What happened to the requests that were in flight when draining began.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Requests that completed during the drain.
    pub drained: usize,
    /// Requests still running when `shutdown_timeout` expired.
    pub abandoned: usize,
    /// From the shutdown request to `Stopped`.
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Stopped(ShutdownReport),
}

impl Phase {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn report(&self) -> Option<ShutdownReport> {
        match self {
            Self::Stopped(report) => Some(*report),
            _ => None,
        }
    }
}

/// Cloneable remote control for a server's shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    control: mpsc::Sender<Trigger>,
    phase: watch::Receiver<Phase>,
}

impl ShutdownHandle {
    /// Asks the server to shut down and returns immediately. Returns `false`
    /// if the server has already stopped (or never ran).
    pub fn request(&self) -> bool {
        self.send(Trigger::Requested)
    }

    fn send(&self, trigger: Trigger) -> bool {
        match self.control.try_send(trigger) {
            Ok(()) => true,
            // A request is already queued.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Requests shutdown and waits for the report. Calling it again, from
    /// any clone, returns the same report without doing anything.
    ///
    /// `None` if the server was dropped without ever serving.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        self.request();
        self.stopped().await
    }

    /// Waits for `Stopped` without requesting anything.
    pub async fn stopped(&self) -> Option<ShutdownReport> {
        let mut phase = self.phase.clone();
        let stopped = phase.wait_for(|p| matches!(p, Phase::Stopped(_))).await.ok()?;
        stopped.report()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }
}

/// The serve loop's end of the channels.
pub(crate) struct Coordinator {
    control: mpsc::Receiver<Trigger>,
    phase: watch::Sender<Phase>,
}

pub(crate) fn channel() -> (Coordinator, ShutdownHandle) {
    let (control_tx, control_rx) = mpsc::channel(1);
    let (phase_tx, phase_rx) = watch::channel(Phase::Running);
    (
        Coordinator { control: control_rx, phase: phase_tx },
        ShutdownHandle { control: control_tx, phase: phase_rx },
    )
}

impl Coordinator {
    /// Resolves on the first shutdown request. Never resolves if every
    /// handle is gone.
    pub(crate) async fn requested(&mut self) -> Trigger {
        match self.control.recv().await {
            Some(trigger) => trigger,
            None => std::future::pending().await,
        }
    }

    pub(crate) fn draining(&self) {
        self.phase.send_replace(Phase::Draining);
    }

    /// Publishes the final report and stops accepting further requests.
    pub(crate) fn stopped(mut self, report: ShutdownReport) {
        self.control.close();
        self.phase.send_replace(Phase::Stopped(report));
    }
}

/// Forwards the first SIGINT/SIGTERM to `handle`.
pub(crate) fn spawn_signal_listener(handle: ShutdownHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = wait_for_os_signal().await;
        info!(signal = name, "shutdown signal received");
        handle.send(Trigger::Signal(name));
    })
}

async fn wait_for_os_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                warn!("failed to install Ctrl-C handler: {e}");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = sigterm => name,
    }
}
