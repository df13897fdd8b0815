//! Micro-batch accumulator behind [`Queue::group_within`].
//!
//! Collects items and flushes when either the size threshold or the time
//! window is reached, whichever comes first.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::error::QueueError;
use crate::queue::Queue;

/// Accumulates items into micro-batches.
///
/// The time window starts at the first item of each batch.
#[derive(Debug)]
pub struct MicroBatcher<T> {
    buffer: Vec<T>,
    max_size: usize,
    max_wait: Duration,
    batch_started: Option<Instant>,
}

impl<T> MicroBatcher<T> {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(max_size),
            max_size,
            max_wait,
            batch_started: None,
        }
    }

    /// Add an item, starting the batch timer if this is the first one.
    pub fn push(&mut self, item: T) {
        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
        }
        self.buffer.push(item);
    }

    /// When the current batch must be flushed by, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.batch_started.map(|started| started + self.max_wait)
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_size
    }

    /// Whether the size or time threshold has been reached.
    pub fn should_flush(&self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        self.is_full() || self.deadline().is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Take the current batch and reset the timer.
    pub fn flush(&mut self) -> Vec<T> {
        self.batch_started = None;
        std::mem::replace(&mut self.buffer, Vec::with_capacity(self.max_size))
    }

    pub fn try_flush(&mut self) -> Option<Vec<T>> {
        if self.should_flush() {
            Some(self.flush())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Group items into batches of at most `count`, flushing a partial batch
    /// `duration` after its first item. A partial batch is flushed when the
    /// source completes.
    pub fn group_within(&self, count: usize, duration: Duration) -> Result<Queue<Vec<T>>, QueueError> {
        QueueError::check_positive("group_within", "count", count)?;
        QueueError::check_duration("group_within", "duration", duration)?;

        Ok(self.transform(format!("group_within({count})"), 1, move |up, out| async move {
            let mut batcher = MicroBatcher::new(count, duration);
            loop {
                let next = match batcher.deadline() {
                    Some(deadline) => tokio::select! {
                        biased;
                        _ = sleep_until(deadline) => {
                            if !out.emit(batcher.flush()).await {
                                return Ok(());
                            }
                            continue;
                        }
                        item = up.next() => item,
                    },
                    None => up.next().await,
                };

                let Some(item) = next else {
                    break;
                };
                batcher.push(item);
                if let Some(batch) = batcher.try_flush() {
                    if !out.emit(batch).await {
                        return Ok(());
                    }
                }
            }

            if !batcher.is_empty() {
                out.emit(batcher.flush()).await;
            }
            Ok(())
        }))
    }
}
