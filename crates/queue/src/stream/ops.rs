//! Per-item combinators: mapping, filtering, prefixes and fan-in/fan-out.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::QueueError;
use crate::queue::shared::{parent_link, Shared, StorageKind};
use crate::queue::{Emitter, Queue};
use crate::signal::{AbortController, AbortSignal};

impl<T: Send + 'static> Queue<T> {
    pub fn map<U, F, Fut>(&self, mut f: F) -> Queue<U>
    where
        U: Send + 'static,
        F: FnMut(T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.transform("map", 1, move |up, out| async move {
            while let Some(item) = up.next().await {
                let mapped = f(item, up.signal().clone()).await?;
                if !out.emit(mapped).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Keep the items `predicate` accepts.
    ///
    /// The predicate sees the item by reference; whatever its future needs
    /// must be copied out before the future is built.
    pub fn filter<F, Fut>(&self, mut predicate: F) -> Queue<T>
    where
        F: FnMut(&T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.transform("filter", 1, move |up, out| async move {
            while let Some(item) = up.next().await {
                if predicate(&item, up.signal().clone()).await? && !out.emit(item).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Emit every intermediate accumulator.
    pub fn scan<U, F, Fut>(&self, initial: U, mut f: F) -> Queue<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(U, T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.transform("scan", 1, move |up, out| async move {
            let mut acc = initial;
            while let Some(item) = up.next().await {
                acc = f(acc, item, up.signal().clone()).await?;
                if !out.emit(acc.clone()).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Map while threading a state value through every call.
    pub fn stateful_map<S, U, F, Fut>(&self, state: S, mut f: F) -> Queue<U>
    where
        S: Send + 'static,
        U: Send + 'static,
        F: FnMut(S, T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<(S, U)>> + Send + 'static,
    {
        self.transform("stateful_map", 1, move |up, out| async move {
            let mut state = state;
            while let Some(item) = up.next().await {
                let (next, mapped) = f(state, item, up.signal().clone()).await?;
                state = next;
                if !out.emit(mapped).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Run a side effect on each item before passing it through.
    pub fn tap<F, Fut>(&self, mut f: F) -> Queue<T>
    where
        F: FnMut(&T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.transform("tap", 1, move |up, out| async move {
            while let Some(item) = up.next().await {
                f(&item, up.signal().clone()).await?;
                if !out.emit(item).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// The first `count` items. Completing afterwards also completes this queue.
    pub fn take(&self, count: usize) -> Result<Queue<T>, QueueError> {
        QueueError::check_positive("take", "count", count)?;
        Ok(self.transform(format!("take({count})"), 1, move |up, out| async move {
            for _ in 0..count {
                match up.next().await {
                    Some(item) => {
                        if !out.emit(item).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Ok(())
        }))
    }

    /// Everything after the first `count` items.
    pub fn skip(&self, count: usize) -> Result<Queue<T>, QueueError> {
        QueueError::check_positive("skip", "count", count)?;
        Ok(self.transform(format!("skip({count})"), 1, move |up, out| async move {
            let mut seen = 0usize;
            while let Some(item) = up.next().await {
                seen += 1;
                if seen > count && !out.emit(item).await {
                    break;
                }
            }
            Ok(())
        }))
    }

    /// Items up to the first one `predicate` rejects, which is included when
    /// `inclusive` is set.
    pub fn take_while<F, Fut>(&self, mut predicate: F, inclusive: bool) -> Queue<T>
    where
        F: FnMut(&T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.transform("take_while", 1, move |up, out| async move {
            while let Some(item) = up.next().await {
                let keep = predicate(&item, up.signal().clone()).await?;
                if !keep {
                    if inclusive {
                        out.emit(item).await;
                    }
                    break;
                }
                if !out.emit(item).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// A pass-through copy whose completion does not cascade back here.
    pub fn fork(&self) -> Queue<T> {
        self.transform("fork", 1, |up, out| async move {
            while let Some(item) = up.next().await {
                if !out.emit(item).await {
                    break;
                }
            }
            Ok(())
        })
        .detach()
    }

    /// Interleave several queues into one.
    ///
    /// The merged queue completes once every source has completed.
    /// Completing it early completes every source.
    pub fn merge(capacity: usize, sources: Vec<Queue<T>>) -> Result<Queue<T>, QueueError> {
        QueueError::check_positive("merge", "capacity", capacity)?;

        let controller = AbortController::new();
        let signal = controller.signal();
        let parents = sources.iter().map(|source| parent_link(source.shared())).collect();
        let merged = Shared::new(
            "merge".to_string(),
            StorageKind::Bounded {
                capacity,
                reject_on_full: false,
            },
            parents,
            Some(Box::new(move || {
                controller.abort();
            })),
        );

        if sources.is_empty() {
            merged.complete();
        }

        let remaining = Arc::new(AtomicUsize::new(sources.len()));
        for source in sources {
            let emitter = Emitter::new(Arc::clone(&merged));
            let remaining = Arc::clone(&remaining);
            let signal = signal.clone();
            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = signal.aborted() => None,
                        item = source.recv() => item,
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
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    emitter.complete();
                }
            });
        }

        Ok(Queue::from_shared(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn filled(items: Vec<i32>) -> Queue<i32> {
        let queue = Queue::new(items.len().max(1));
        for item in items {
            queue.enqueue(item).await.unwrap();
        }
        queue.complete();
        queue
    }

    #[tokio::test]
    async fn map_and_filter_preserve_order() {
        let queue = filled(vec![1, 2, 3, 4, 5, 6]).await;
        let out = queue
            .filter(|&x, _| async move { Ok(x % 2 == 0) })
            .map(|x, _| async move { Ok(x * 10) })
            .collect_vec()
            .await
            .unwrap();
        assert_eq!(out, vec![20, 40, 60]);
    }

    #[tokio::test]
    async fn map_error_fails_derived_queue() {
        let queue = filled(vec![1, 2]).await;
        let err = queue
            .map(|x, _| async move {
                if x == 2 {
                    anyhow::bail!("bad item {x}");
                }
                Ok(x)
            })
            .collect_vec()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad item 2"));
    }

    #[tokio::test]
    async fn scan_emits_running_totals() {
        let queue = filled(vec![1, 2, 3]).await;
        let out = queue
            .scan(0, |acc, x, _| async move { Ok(acc + x) })
            .collect_vec()
            .await
            .unwrap();
        assert_eq!(out, vec![1, 3, 6]);
    }

    #[tokio::test]
    async fn stateful_map_threads_state() {
        let queue = filled(vec![5, 6, 7]).await;
        let out = queue
            .stateful_map(0usize, |index, x, _| async move { Ok((index + 1, format!("{index}:{x}"))) })
            .collect_vec()
            .await
            .unwrap();
        assert_eq!(out, vec!["0:5", "1:6", "2:7"]);
    }

    #[tokio::test]
    async fn take_completes_upstream() {
        let queue = Queue::new(8);
        for i in 0..5 {
            queue.enqueue(i).await.unwrap();
        }
        let out = queue.take(2).unwrap().collect_vec().await.unwrap();
        assert_eq!(out, vec![0, 1]);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.is_completed());
    }

    #[tokio::test]
    async fn take_and_skip_reject_zero() {
        let queue = Queue::<i32>::new(1);
        let err = queue.take(0).unwrap_err();
        assert_eq!(err.to_string(), "take() count must be greater than 0, got 0");
        assert!(queue.skip(0).is_err());
    }

    #[tokio::test]
    async fn skip_drops_prefix() {
        let queue = filled(vec![1, 2, 3, 4]).await;
        let out = queue.skip(2).unwrap().collect_vec().await.unwrap();
        assert_eq!(out, vec![3, 4]);
    }

    #[tokio::test]
    async fn take_while_optionally_includes_boundary() {
        let exclusive = filled(vec![1, 2, 3, 1]).await;
        let out = exclusive
            .take_while(|&x, _| async move { Ok(x < 3) }, false)
            .collect_vec()
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2]);

        let inclusive = filled(vec![1, 2, 3, 1]).await;
        let out = inclusive
            .take_while(|&x, _| async move { Ok(x < 3) }, true)
            .collect_vec()
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn tap_sees_every_item() {
        let seen = Arc::new(AtomicUsize::new(0));
        let queue = filled(vec![1, 2, 3]).await;
        let counter = seen.clone();
        let out = queue
            .tap(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .collect_vec()
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fork_completion_does_not_cascade() {
        let queue = Queue::<i32>::new(1);
        let forked = queue.fork();
        forked.complete();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!queue.is_completed());
    }

    #[tokio::test]
    async fn merge_waits_for_every_source() {
        let a = Queue::new(4);
        let b = Queue::new(4);
        let merged = Queue::merge(4, vec![a.clone(), b.clone()]).unwrap();

        a.enqueue(1).await.unwrap();
        a.complete();
        b.enqueue(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!merged.is_completed());

        b.enqueue(3).await.unwrap();
        b.complete();
        let mut out = merged.collect_vec().await.unwrap();
        out.sort();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn merge_of_nothing_is_already_complete() {
        let merged = Queue::<u8>::merge(1, Vec::new()).unwrap();
        assert!(merged.is_completed());
        assert!(Queue::<u8>::merge(0, Vec::new()).is_err());
    }
}
