//! sluice-worker: demo pool that offloads work to a child process.
//!
//! `run` starts the orchestrator: it spawns this binary again with `serve`,
//! submits a batch of doubling tasks and logs each result. `serve` is the
//! execution context, speaking frames over stdin/stdout.
//!
//! # Usage
//!
//! ```bash
//! # Orchestrate 32 tasks over a child process
//! sluice-worker run --tasks 32
//!
//! # Same, with the context on a thread instead of a process
//! sluice-worker run --thread
//!
//! # Pool settings from a file or the environment
//! sluice-worker run --config worker.toml
//! SLUICE_WORKER_CONCURRENCY=8 sluice-worker run
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use sluice_queue::{delay, AbortSignal};
use sluice_worker::{serve_stdio, ExecutionContext, PoolConfig, TaskHandler, WorkerPool};
use tokio::process::Command;

/// Offload tasks from a bounded queue to an isolated execution context.
#[derive(Parser, Debug)]
#[command(name = "sluice-worker", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the orchestrator and a demo batch of tasks.
    Run {
        /// Pool config file (TOML). Defaults plus environment when omitted.
        #[arg(long, env = "SLUICE_WORKER_CONFIG")]
        config: Option<PathBuf>,

        /// Number of tasks to submit.
        #[arg(long, default_value_t = 16)]
        tasks: u64,

        /// Simulated work per task in milliseconds.
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,

        /// Serve on a thread instead of a child process.
        #[arg(long)]
        thread: bool,
    },
    /// Serve calls over stdin/stdout as an execution context.
    Serve,
}

/// Demo task: wait `delay_ms`, then double `input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Doubling {
    input: u64,
    delay_ms: u64,
}

struct Doubler;

#[async_trait::async_trait]
impl TaskHandler for Doubler {
    type Input = Doubling;
    type Output = u64;

    async fn handle(&self, task: Doubling, signal: Option<AbortSignal>) -> anyhow::Result<u64> {
        let signal = signal.unwrap_or_else(AbortSignal::never);
        delay(Duration::from_millis(task.delay_ms), &signal).await?;
        Ok(task.input * 2)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout carries frames in serve mode, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Mode::Serve => {
            serve_stdio(Doubler).await?;
            Ok(())
        }
        Mode::Run {
            config,
            tasks,
            delay_ms,
            thread,
        } => run(config, tasks, delay_ms, thread).await,
    }
}

async fn run(config: Option<PathBuf>, tasks: u64, delay_ms: u64, thread: bool) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => PoolConfig::from_file(path)?,
        None => PoolConfig::from_env()?,
    };
    tracing::info!(?config, tasks, "starting sluice-worker");

    let context = if thread {
        ExecutionContext::spawn_thread("sluice-context", Doubler, config.channel_capacity)?
    } else {
        let mut command = Command::new(std::env::current_exe()?);
        command.arg("serve");
        ExecutionContext::spawn_process(command, config.channel_capacity)?
    };
    let pool = WorkerPool::<Doubling, u64>::start(context, config)?;

    let canceller = pool.canceller();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        canceller.abort();
    });

    let mut handles = Vec::with_capacity(tasks as usize);
    for input in 0..tasks {
        match pool.submit(Doubling { input, delay_ms }).await {
            Ok(handle) => handles.push((input, handle)),
            Err(e) => {
                tracing::warn!(error = %e, "pool stopped taking tasks");
                break;
            }
        }
    }
    pool.close();

    let mut failed = 0usize;
    for (input, handle) in handles {
        match handle.await {
            Ok(output) => tracing::info!(input, output, "task done"),
            Err(e) => {
                failed += 1;
                tracing::warn!(input, error = %e, "task failed");
            }
        }
    }
    pool.join().await?;

    if failed > 0 {
        anyhow::bail!("{failed} tasks failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
