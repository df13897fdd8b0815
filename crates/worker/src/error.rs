use std::time::Duration;

use sluice_queue::SharedError;
use sluice_window::AbortionSource;
use thiserror::Error;

use crate::protocol::{RemoteError, RemoteErrorKind};

/// Failures moving frames across a [`Port`](crate::port::Port).
#[derive(Debug, Error)]
pub enum PortError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("port closed")]
    Closed,
}

/// Invalid or unreadable pool configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end a worker pool run.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("execution context did not become ready within {}ms", .0.as_millis())]
    InitTimeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("execution context exited without acknowledging termination")]
    ContextLost,

    #[error("execution context did not terminate within {}ms", .0.as_millis())]
    TerminateTimeout(Duration),

    #[error("port error: {0}")]
    Port(#[from] PortError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("execution context I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pool task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why a single task did not produce a result.
///
/// Callers only ever see their own task's failure, never the protocol
/// messages behind it.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The handler ran and failed inside the execution context.
    #[error(transparent)]
    Remote(RemoteError),

    /// The task was dispatched but its response never arrived.
    #[error("{cause}")]
    Correlation {
        abortion: AbortionSource,
        cause: SharedError,
    },

    /// The task was dropped before it was dispatched.
    #[error("task was dropped before it completed")]
    Cancelled,

    #[error("payload codec error: {0}")]
    Codec(String),
}

impl TaskError {
    /// Whether the handler stopped because the task's signal fired.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Remote(remote) if remote.kind == RemoteErrorKind::Aborted)
    }
}
