//! Combinators that run the user function in separate tasks.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::error::QueueError;
use crate::queue::Queue;
use crate::semaphore::Semaphore;
use crate::signal::{is_aborted, AbortController, AbortSignal};

fn joined(result: Result<anyhow::Result<()>, JoinError>) -> anyhow::Result<()> {
    result.context("mapping task panicked")?
}

impl<T: Send + 'static> Queue<T> {
    /// Map with up to `limit` invocations of `f` in flight.
    ///
    /// Results are emitted in completion order. The derived queue completes
    /// once the source is exhausted and every invocation has finished.
    pub fn concurrent_map<U, F, Fut>(&self, limit: usize, f: F) -> Result<Queue<U>, QueueError>
    where
        U: Send + 'static,
        F: Fn(T, AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        QueueError::check_positive("concurrent_map", "limit", limit)?;
        let f = Arc::new(f);

        Ok(self.transform(format!("concurrent_map({limit})"), 1, move |up, out| async move {
            let semaphore = Semaphore::new(limit);
            let mut jobs = JoinSet::new();

            loop {
                let slot = async {
                    let permit = semaphore.acquire_permit().await;
                    up.next().await.map(|item| (permit, item))
                };

                tokio::select! {
                    biased;
                    Some(result) = jobs.join_next() => joined(result)?,
                    next = slot => {
                        let Some((permit, item)) = next else {
                            break;
                        };
                        let f = Arc::clone(&f);
                        let out = out.clone();
                        let signal = up.signal().clone();
                        jobs.spawn(async move {
                            // Held until the result is handed downstream.
                            let _permit = permit;
                            match f(item, signal).await {
                                Ok(mapped) => {
                                    out.emit(mapped).await;
                                    Ok(())
                                }
                                Err(e) if is_aborted(&e) => Ok(()),
                                Err(e) => Err(e),
                            }
                        });
                    }
                }
            }

            while let Some(result) = jobs.join_next().await {
                joined(result)?;
            }
            Ok(())
        }))
    }

    /// Map each item, cancelling the invocation for the previous item first.
    ///
    /// A result produced after its invocation was cancelled is discarded.
    pub fn switch_map<U, F, Fut>(&self, mut f: F) -> Queue<U>
    where
        U: Send + 'static,
        F: FnMut(T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.transform("switch_map", 1, move |up, out| async move {
            let mut current: Option<(AbortController, JoinHandle<anyhow::Result<()>>)> = None;

            while let Some(item) = up.next().await {
                if let Some((controller, handle)) = current.take() {
                    controller.abort();
                    joined(handle.await)?;
                }
                if out.is_closed() {
                    break;
                }

                let controller = AbortController::new();
                let signal = controller.signal();
                let running = f(item, signal.clone());
                let out = out.clone();
                let handle = tokio::spawn(async move {
                    match running.await {
                        Ok(_) if signal.is_aborted() => Ok(()),
                        Ok(mapped) => {
                            out.emit(mapped).await;
                            Ok(())
                        }
                        Err(e) if is_aborted(&e) => Ok(()),
                        Err(e) => Err(e),
                    }
                });
                current = Some((controller, handle));
            }

            if let Some((controller, handle)) = current.take() {
                if up.signal().is_aborted() {
                    controller.abort();
                }
                joined(handle.await)?;
            }
            Ok(())
        })
    }
}
