//! Isolated execution contexts a pool can dispatch to.
//!
//! A context is whatever runs [`serve`] on the far side of a [`Port`]: a
//! dedicated OS thread with its own runtime, a child process speaking frames
//! over stdio, or any pre-connected port.

use std::process::Stdio;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::port::Port;
use crate::serve::{serve, TaskHandler};

/// The pool's end of a running execution context.
#[derive(Debug)]
pub struct ExecutionContext {
    name: String,
    port: Port,
    backing: Backing,
}

#[derive(Debug)]
enum Backing {
    Thread(JoinHandle<()>),
    Process(Child),
    Detached,
}

impl ExecutionContext {
    /// Run `handler` on a new OS thread with a current-thread runtime.
    ///
    /// Only encoded frames cross between the thread and the pool.
    pub fn spawn_thread<H: TaskHandler>(
        name: impl Into<String>,
        handler: H,
        channel_capacity: usize,
    ) -> Result<Self, PoolError> {
        let name = name.into();
        let (port, remote) = Port::pair(channel_capacity);

        let thread_name = name.clone();
        let handle = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(context = %thread_name, error = %e, "failed to build context runtime");
                    return;
                }
            };
            if let Err(e) = runtime.block_on(serve(remote, handler)) {
                warn!(context = %thread_name, error = %e, "execution context stopped");
            }
        })?;

        info!(context = %name, "spawned thread context");
        Ok(Self {
            name,
            port,
            backing: Backing::Thread(handle),
        })
    }

    /// Spawn `command` as a child process serving over its stdin and stdout.
    ///
    /// The child is expected to call [`serve_stdio`](crate::serve::serve_stdio).
    /// Its stderr is inherited so its logs stay visible.
    pub fn spawn_process(mut command: Command, channel_capacity: usize) -> Result<Self, PoolError> {
        let name = command.as_std().get_program().to_string_lossy().into_owned();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PoolError::Handshake(format!("`{name}` was spawned without piped stdio")));
        };

        info!(context = %name, pid = child.id(), "spawned process context");
        Ok(Self {
            name,
            port: Port::from_io(stdout, stdin, channel_capacity),
            backing: Backing::Process(child),
        })
    }

    /// Adopt a port whose far end is already served elsewhere.
    pub fn from_port(name: impl Into<String>, port: Port) -> Self {
        Self {
            name: name.into(),
            port,
            backing: Backing::Detached,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (Port, Teardown) {
        let teardown = Teardown {
            name: self.name,
            backing: self.backing,
        };
        (self.port, teardown)
    }
}

/// Releases whatever runs the context once the pool is done with its port.
#[derive(Debug)]
pub(crate) struct Teardown {
    name: String,
    backing: Backing,
}

impl Teardown {
    /// Wait up to `timeout` for the context to exit after its port closed.
    /// A child process that outlives the timeout is killed; a thread is
    /// left to finish on its own.
    pub(crate) async fn shutdown(self, timeout: Duration) {
        match self.backing {
            Backing::Thread(handle) => {
                let joined = tokio::task::spawn_blocking(move || handle.join());
                match tokio::time::timeout(timeout, joined).await {
                    Ok(Ok(Ok(()))) => debug!(context = %self.name, "thread context joined"),
                    Ok(Ok(Err(_))) => warn!(context = %self.name, "thread context panicked"),
                    Ok(Err(e)) => warn!(context = %self.name, error = %e, "joining thread context failed"),
                    Err(_) => warn!(context = %self.name, "thread context still running after shutdown timeout"),
                }
            }
            Backing::Process(mut child) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => debug!(context = %self.name, %status, "process context exited"),
                Ok(Err(e)) => warn!(context = %self.name, error = %e, "waiting for process context failed"),
                Err(_) => {
                    warn!(context = %self.name, "process context still running after shutdown timeout, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(context = %self.name, error = %e, "killing process context failed");
                    }
                }
            },
            Backing::Detached => {}
        }
    }
}
