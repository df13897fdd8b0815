//! The `transform` primitive every combinator is built on.

use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use super::shared::{parent_link, Shared, StorageKind};
use super::Queue;
use crate::error::{share_error, QueueError};
use crate::signal::{is_aborted, AbortController, AbortSignal};

/// Read side handed to a stage: the parent queue plus the stage's abort signal.
pub struct Upstream<T> {
    queue: Queue<T>,
    signal: AbortSignal,
}

impl<T: Send + 'static> Upstream<T> {
    /// Next upstream item, or `None` once the upstream is exhausted or the
    /// stage has been cancelled.
    pub async fn next(&self) -> Option<T> {
        if self.signal.is_aborted() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.signal.aborted() => None,
            item = self.queue.recv() => item,
        }
    }

    /// Fires when the derived queue completes.
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }
}

/// Write side handed to a stage.
pub struct Emitter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Emitter<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Whether the derived queue no longer accepts items.
    pub fn is_closed(&self) -> bool {
        self.shared.is_completed()
    }

    pub fn complete(&self) -> bool {
        self.shared.complete()
    }

    pub(crate) fn fail(&self, failure: QueueError) -> bool {
        self.shared.fail(failure)
    }

    /// Take the unread value of a single-slot queue, if any.
    pub(crate) fn take_unread(&self) -> Option<T> {
        self.shared.drain().pop()
    }
}

impl<T: Send + 'static> Emitter<T> {
    /// Forward an item downstream, waiting for room.
    ///
    /// Returns `false` once the derived queue has completed; the stage should
    /// stop producing.
    pub async fn emit(&self, item: T) -> bool {
        matches!(self.shared.enqueue(item).await, Ok(true))
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Derive a new queue driven by `stage`.
    ///
    /// `stage` reads from the [`Upstream`] and writes through the [`Emitter`].
    /// The derived queue completes when `stage` returns. Completing the
    /// derived queue early fires the upstream's abort signal. An error other
    /// than [`Aborted`](crate::signal::Aborted) fails the derived queue.
    pub fn transform<U, F, Fut>(&self, name: impl Into<String>, capacity: usize, stage: F) -> Queue<U>
    where
        U: Send + 'static,
        F: FnOnce(Upstream<T>, Emitter<U>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let kind = StorageKind::Bounded {
            capacity: capacity.max(1),
            reject_on_full: false,
        };
        self.spawn_stage(name.into(), kind, stage)
    }

    /// Like [`transform`](Self::transform) but into a single-slot,
    /// last-value-wins queue.
    pub(crate) fn transform_latest<U, F, Fut>(&self, name: impl Into<String>, stage: F) -> Queue<U>
    where
        U: Send + 'static,
        F: FnOnce(Upstream<T>, Emitter<U>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_stage(name.into(), StorageKind::Latest, stage)
    }

    fn spawn_stage<U, F, Fut>(&self, name: String, kind: StorageKind, stage: F) -> Queue<U>
    where
        U: Send + 'static,
        F: FnOnce(Upstream<T>, Emitter<U>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let controller = AbortController::new();
        let signal = controller.signal();
        let sink = Shared::new(
            name,
            kind,
            vec![parent_link(self.shared())],
            Some(Box::new(move || {
                controller.abort();
            })),
        );

        let emitter = Emitter::new(Arc::clone(&sink));
        let source = Arc::clone(self.shared());
        let running = stage(
            Upstream {
                queue: self.clone(),
                signal,
            },
            emitter.clone(),
        );

        tokio::spawn(async move {
            let outcome = running.await;
            settle(&emitter, &source, outcome);
        });

        Queue::from_shared(sink)
    }
}

/// Complete or fail a derived queue once its stage has returned.
fn settle<T, U>(emitter: &Emitter<U>, source: &Shared<T>, outcome: anyhow::Result<()>) {
    match outcome {
        Ok(()) => match source.failure() {
            Some(failure) => {
                emitter.fail(failure);
            }
            None => {
                emitter.complete();
            }
        },
        Err(e) if is_aborted(&e) => {
            emitter.complete();
        }
        Err(e) => {
            let name = emitter.shared.name.clone();
            warn!(stage = %name, error = %e, "stage failed");
            emitter.fail(QueueError::Failed {
                name,
                source: share_error(e),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn forwards_emitted_items_and_completes() {
        let queue = Queue::new(4);
        for i in 1..=3 {
            queue.enqueue(i).await.unwrap();
        }
        queue.complete();

        let sums = queue.transform("pairs", 4, |up, out| async move {
            let mut total = 0;
            while let Some(item) = up.next().await {
                total += item;
                out.emit(total).await;
            }
            Ok(())
        });
        assert_eq!(sums.collect_vec().await.unwrap(), vec![1, 3, 6]);
    }

    #[tokio::test]
    async fn completing_derived_queue_cancels_stage_and_parent() {
        let queue = Queue::<u32>::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let derived = queue.transform("watch", 1, |up, _out: Emitter<u32>| async move {
            while up.next().await.is_some() {}
            let _ = tx.send(up.signal().is_aborted());
            Ok(())
        });

        derived.complete();
        assert!(rx.await.unwrap());
        assert!(queue.is_completed());
    }

    #[tokio::test]
    async fn stage_error_fails_derived_queue() {
        let queue = Queue::new(1);
        queue.enqueue(1).await.unwrap();
        let derived = queue.transform("explode", 1, |up, _out: Emitter<u32>| async move {
            up.next().await;
            anyhow::bail!("boom")
        });
        let err = derived.collect_vec().await.unwrap_err();
        assert_eq!(err.to_string(), "stage `explode` failed: boom");
    }

    #[tokio::test]
    async fn upstream_failure_is_forwarded() {
        let queue = Queue::new(1);
        queue.enqueue(1u32).await.unwrap();
        let failing = queue.transform("first", 1, |up, _out: Emitter<u32>| async move {
            up.next().await;
            anyhow::bail!("first failed")
        });
        let downstream = failing.map(|x, _| async move { Ok(x) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = downstream.collect_vec().await.unwrap_err();
        assert!(err.to_string().contains("first failed"));
    }

    #[tokio::test]
    async fn aborted_error_is_a_normal_end() {
        let queue = Queue::<u32>::new(1);
        queue.complete();
        let derived = queue.transform("quiet", 1, |_up, _out: Emitter<u32>| async move {
            Err(anyhow::Error::new(crate::signal::Aborted))
        });
        assert_eq!(derived.collect_vec().await.unwrap(), Vec::<u32>::new());
    }
}
