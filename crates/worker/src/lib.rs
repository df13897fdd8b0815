//! Offload queue items to an isolated execution context.
//!
//! The pool side ([`run_queue_worker`], [`WorkerPool`]) and the context side
//! ([`serve`], [`serve_stdio`]) are separate entry points connected by a
//! [`Port`] carrying MessagePack [`WireMessage`] frames.

pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod port;
pub mod protocol;
pub mod serve;

pub use config::PoolConfig;
pub use context::ExecutionContext;
pub use error::{ConfigError, PoolError, PortError, TaskError};
pub use pool::{run_queue_worker, TaskHandle, WorkerPool, WorkerTask};
pub use port::{Port, PortReceiver, PortSender};
pub use protocol::{Outcome, RemoteError, RemoteErrorKind, WireMessage};
pub use serve::{handler_fn, serve, serve_stdio, HandlerFn, TaskHandler};
