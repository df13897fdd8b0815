//! Bounded, backpressured queues.
//!
//! A [`Queue`] is a cheap handle over shared state. Producers suspend while
//! the buffer is full and consumers suspend while it is empty. Queues derived
//! through [`Queue::transform`] keep weak links to their parents so that
//! completing a downstream queue tells the upstream to stop producing.

mod latest;
pub(crate) mod shared;
mod stage;

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::{share_error, QueueError};
use crate::signal::AbortController;

pub use latest::LatestValueQueue;
pub use stage::{Emitter, Upstream};

use shared::{Shared, StorageKind};

// ── Options ─────────────────────────────────────────────────────

/// Construction options for a [`Queue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub capacity: usize,
    /// Fail `enqueue` with [`QueueError::Full`] instead of waiting for room.
    pub reject_on_full: bool,
}

impl QueueOptions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn reject_on_full(mut self, reject: bool) -> Self {
        self.reject_on_full = reject;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "anonymous".to_string(),
            capacity: 1,
            reject_on_full: false,
        }
    }
}

// ── Queue ───────────────────────────────────────────────────────

/// Handle to a bounded FIFO queue.
///
/// Cloning a handle shares the same queue. When the last handle is dropped
/// the queue completes, which cascades to its parents exactly like an
/// explicit [`complete`](Self::complete).
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Queue<T> {
    pub(crate) fn from_shared(shared: Arc<Shared<T>>) -> Self {
        shared.acquire_handle();
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.shared
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn is_completed(&self) -> bool {
        self.shared.is_completed()
    }

    /// The error this queue terminated with, if it failed.
    pub fn failure(&self) -> Option<QueueError> {
        self.shared.failure()
    }

    /// Gate consumption. Producers keep filling the buffer while paused.
    pub fn set_paused(&self, paused: bool) {
        self.shared.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    /// Mark the queue completed. Returns `false` if it already was.
    ///
    /// Suspended producers resolve `Ok(false)`, consumers finish once the
    /// buffer is drained, and every parent queue is completed in turn.
    pub fn complete(&self) -> bool {
        self.shared.complete()
    }

    /// Remove and return every buffered item without waiting.
    pub fn drain(&self) -> Vec<T> {
        self.shared.drain()
    }

    /// Stop this queue's completion from cascading to its parents.
    pub fn detach(self) -> Self {
        self.shared.detach();
        self
    }
}

impl<T: Send + 'static> Queue<T> {
    /// A bounded queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self::with_options(QueueOptions::new(capacity))
    }

    pub fn with_options(options: QueueOptions) -> Self {
        let kind = StorageKind::Bounded {
            capacity: options.capacity.max(1),
            reject_on_full: options.reject_on_full,
        };
        Self::from_shared(Shared::new(options.name, kind, Vec::new(), None))
    }

    /// Add an item, waiting while the buffer is full.
    ///
    /// Resolves `Ok(false)` if the queue completes while waiting.
    pub async fn enqueue(&self, item: T) -> Result<bool, QueueError> {
        self.shared.enqueue(item).await
    }

    /// Take the next item, or `None` once completed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.shared.recv().await
    }

    /// Lazy stream over the queue's items, ending once completed and drained.
    pub fn items(&self) -> impl Stream<Item = T> + Send + 'static {
        futures::stream::unfold(self.clone(), |queue| async move {
            let item = queue.recv().await?;
            Some((item, queue))
        })
    }

    /// Consume every item, failing if the queue terminated with an error.
    pub async fn collect_vec(&self) -> Result<Vec<T>, QueueError> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        match self.failure() {
            Some(failure) => Err(failure),
            None => Ok(items),
        }
    }

    pub async fn collect_set(&self) -> Result<HashSet<T>, QueueError>
    where
        T: Eq + Hash,
    {
        Ok(self.collect_vec().await?.into_iter().collect())
    }

    /// Fold every item into an accumulator, in arrival order.
    pub async fn reduce<A, F, Fut>(&self, initial: A, mut reducer: F) -> Result<A, QueueError>
    where
        F: FnMut(A, T) -> Fut,
        Fut: Future<Output = anyhow::Result<A>>,
    {
        let mut acc = initial;
        while let Some(item) = self.recv().await {
            acc = reducer(acc, item).await.map_err(|e| QueueError::Failed {
                name: format!("{}.reduce", self.name()),
                source: share_error(e),
            })?;
        }
        match self.failure() {
            Some(failure) => Err(failure),
            None => Ok(acc),
        }
    }

    /// Move every item into `target`, completing it afterwards.
    ///
    /// Stops early if `target` completes first.
    pub async fn pipe_to(&self, target: &Queue<T>) {
        while let Some(item) = self.recv().await {
            match target.enqueue(item).await {
                Ok(true) => {}
                _ => {
                    debug!(source = %self.name(), target = %target.name(), "pipe target closed");
                    return;
                }
            }
        }
        target.complete();
    }

    /// Feed a stream into a new queue, completing it when the stream ends.
    pub fn from_stream<S>(stream: S, capacity: usize) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let controller = AbortController::new();
        let signal = controller.signal();
        let shared = Shared::new(
            "from_stream".to_string(),
            StorageKind::Bounded {
                capacity: capacity.max(1),
                reject_on_full: false,
            },
            Vec::new(),
            Some(Box::new(move || {
                controller.abort();
            })),
        );
        let emitter = Emitter::new(Arc::clone(&shared));
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = signal.aborted() => None,
                    next = stream.next() => next,
                };
                match next {
                    Some(item) => {
                        if !emitter.emit(item).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            emitter.complete();
        });
        Self::from_shared(shared)
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self::from_shared(Arc::clone(&self.shared))
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        self.shared.release_handle();
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.shared.name)
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn yields_items_in_order_then_stops() {
        let queue = Queue::new(8);
        for i in 0..5 {
            assert!(queue.enqueue(i).await.unwrap());
        }
        queue.complete();
        let items: Vec<i32> = queue.items().collect().await;
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn enqueue_after_complete_fails() {
        let queue = Queue::new(1);
        queue.complete();
        let err = queue.enqueue(1).await.unwrap_err();
        assert!(matches!(err, QueueError::Completed { .. }));
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let queue = Queue::<u8>::new(1);
        assert!(queue.complete());
        assert!(!queue.complete());
    }

    #[tokio::test]
    async fn reject_on_full_fails_immediately() {
        let queue = Queue::with_options(QueueOptions::new(2).name("jobs").reject_on_full(true));
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();
        let err = queue.enqueue(3).await.unwrap_err();
        assert_eq!(err.to_string(), "the queue `jobs` is full with current size 2");
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn full_queue_suspends_producers_in_order() {
        let queue = Queue::new(1);
        queue.enqueue(0).await.unwrap();

        let mut producers = Vec::new();
        for i in 1..=3 {
            let q = queue.clone();
            producers.push(tokio::spawn(async move { q.enqueue(i).await }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.len(), 1);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(queue.recv().await.unwrap());
            assert!(queue.len() <= 1);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        for p in producers {
            assert!(p.await.unwrap().unwrap());
        }
    }

    #[tokio::test]
    async fn completion_releases_suspended_producer_with_false() {
        let queue = Queue::new(1);
        queue.enqueue(1).await.unwrap();
        let q = queue.clone();
        let producer = tokio::spawn(async move { q.enqueue(2).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.complete();
        assert!(!producer.await.unwrap().unwrap());
        // Already buffered items survive completion.
        assert_eq!(queue.drain(), vec![1]);
    }

    #[tokio::test]
    async fn completion_wakes_waiting_consumer() {
        let queue = Queue::<u8>::new(1);
        let q = queue.clone();
        let consumer = tokio::spawn(async move { q.recv().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.complete();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn paused_queue_accepts_but_does_not_deliver() {
        let queue = Queue::new(4);
        queue.set_paused(true);
        queue.enqueue(1).await.unwrap();

        let q = queue.clone();
        let consumer = tokio::spawn(async move { q.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!consumer.is_finished());

        queue.set_paused(false);
        assert_eq!(consumer.await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn dropping_last_handle_completes() {
        let queue = Queue::<u8>::new(1);
        let doubled = queue.map(|x, _| async move { Ok(x * 2) });
        assert!(!queue.is_completed());
        drop(doubled);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.is_completed());
    }

    #[tokio::test]
    async fn reduce_folds_in_order() {
        let queue = Queue::new(4);
        for s in ["a", "b", "c"] {
            queue.enqueue(s.to_string()).await.unwrap();
        }
        queue.complete();
        let joined = queue
            .reduce(String::new(), |acc, s| async move { Ok(acc + &s) })
            .await
            .unwrap();
        assert_eq!(joined, "abc");
    }

    #[tokio::test]
    async fn pipe_to_moves_items_and_completes_target() {
        let source = Queue::new(4);
        let target = Queue::new(4);
        for i in 0..3 {
            source.enqueue(i).await.unwrap();
        }
        source.complete();
        source.pipe_to(&target).await;
        assert!(target.is_completed());
        assert_eq!(target.collect_vec().await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn from_stream_completes_at_end() {
        let queue = Queue::from_stream(futures::stream::iter(vec![1, 2, 3]), 1);
        assert_eq!(queue.collect_vec().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn from_stream_stops_pulling_once_completed() {
        let pulled = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let endless = futures::stream::iter(0u64..).inspect(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let queue = Queue::from_stream(endless, 2);

        assert_eq!(queue.recv().await, Some(0));
        assert_eq!(queue.recv().await, Some(1));
        queue.complete();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let settled = pulled.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), settled);
        queue.drain();
        assert_eq!(queue.recv().await, None);
    }
}
