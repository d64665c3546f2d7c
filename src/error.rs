//! Unified error type.

use std::net::SocketAddr;
use std::path::PathBuf;

/// The error type returned by portico's fallible operations.
///
/// Application-level errors (401, 404, 504, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values or [`Abort`](crate::Abort)s, not as
/// `Error`s. This type surfaces infrastructure failures: configuration,
/// binding a port, opening log files, start hooks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("log sink {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("before_start hook failed: {0}")]
    Hook(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Boxed error used at the validator and capture seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
