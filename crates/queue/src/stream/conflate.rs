//! Lossy combinators backed by a single-slot queue.
//!
//! A slow reader of these queues only ever sees the latest value, never a
//! backlog.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::error::QueueError;
use crate::queue::Queue;
use crate::signal::AbortSignal;

impl<T: Send + 'static> Queue<T> {
    /// Fold consecutive items together while the reader is busy.
    ///
    /// The accumulator persists across reads; the first item seeds it.
    pub fn conflate<F, Fut>(&self, mut reducer: F) -> Queue<T>
    where
        T: Clone,
        F: FnMut(T, T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.transform_latest("conflate", move |up, out| async move {
            let mut acc: Option<T> = None;
            while let Some(item) = up.next().await {
                let next = match acc.take() {
                    None => item,
                    Some(prior) => reducer(prior, item, up.signal().clone()).await?,
                };
                acc = Some(next.clone());
                if !out.emit(next).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Like [`conflate`](Self::conflate) with an explicit starting accumulator.
    pub fn conflate_with_seed<U, F, Fut>(&self, seed: U, mut reducer: F) -> Queue<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(U, T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.transform_latest("conflate_with_seed", move |up, out| async move {
            let mut acc = seed;
            while let Some(item) = up.next().await {
                acc = reducer(acc, item, up.signal().clone()).await?;
                if !out.emit(acc.clone()).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Fold items into a fresh accumulator after every read.
    ///
    /// The first item after a read goes through `seed`, later ones are folded
    /// into the unread value with `reducer`.
    pub fn conflate_with_seed_fn<U, S, SFut, F, Fut>(&self, mut seed: S, mut reducer: F) -> Queue<U>
    where
        U: Send + 'static,
        S: FnMut(T, AbortSignal) -> SFut + Send + 'static,
        SFut: Future<Output = anyhow::Result<U>> + Send + 'static,
        F: FnMut(U, T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.transform_latest("conflate_with_seed_fn", move |up, out| async move {
            while let Some(item) = up.next().await {
                let signal = up.signal().clone();
                let next = match out.take_unread() {
                    Some(prior) => reducer(prior, item, signal).await?,
                    None => seed(item, signal).await?,
                };
                if !out.emit(next).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Emit an item once no newer one has arrived for `duration`.
    ///
    /// A pending item is flushed immediately when the source completes.
    pub fn debounce(&self, duration: Duration) -> Result<Queue<T>, QueueError> {
        QueueError::check_duration("debounce", "duration", duration)?;
        Ok(self.transform_latest("debounce", move |up, out| async move {
            let mut pending: Option<T> = None;
            let mut deadline = Instant::now();
            loop {
                let next = if pending.is_some() {
                    tokio::select! {
                        biased;
                        _ = sleep_until(deadline) => {
                            if let Some(item) = pending.take() {
                                if !out.emit(item).await {
                                    return Ok(());
                                }
                            }
                            continue;
                        }
                        item = up.next() => item,
                    }
                } else {
                    up.next().await
                };

                match next {
                    Some(item) => {
                        pending = Some(item);
                        deadline = Instant::now() + duration;
                    }
                    None => break,
                }
            }

            if let Some(item) = pending {
                out.emit(item).await;
            }
            Ok(())
        }))
    }
}
