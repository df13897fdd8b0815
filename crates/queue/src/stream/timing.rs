//! Rate and idleness combinators driven by the tokio clock.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::error::QueueError;
use crate::queue::Queue;
use crate::signal::delay;

/// An item released by [`Queue::throttle_with_stats`] with the bucket state
/// at the time of release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleStats<T> {
    pub item: T,
    pub remaining_tokens: usize,
    pub reset_in: Duration,
}

impl<T: Send + 'static> Queue<T> {
    /// Token-bucket rate limit of `count` items per `per`, reporting the
    /// bucket state with every item.
    pub fn throttle_with_stats(&self, count: usize, per: Duration) -> Result<Queue<ThrottleStats<T>>, QueueError> {
        QueueError::check_positive("throttle", "count", count)?;
        QueueError::check_duration("throttle", "per", per)?;

        Ok(self.transform("throttle", 1, move |up, out| async move {
            let mut tokens = count;
            let mut last_refill = Instant::now();

            while let Some(item) = up.next().await {
                tokens = tokens.saturating_sub(1);
                let stats = ThrottleStats {
                    item,
                    remaining_tokens: tokens,
                    reset_in: per.saturating_sub(last_refill.elapsed()),
                };
                if !out.emit(stats).await {
                    break;
                }

                let now = Instant::now();
                let since_refill = now - last_refill;
                if since_refill >= per {
                    let windows = (since_refill.as_nanos() / per.as_nanos()) as usize;
                    tokens = count.min(tokens.saturating_add(windows.saturating_mul(count)));
                    last_refill = now;
                }

                if tokens == 0 {
                    delay(per.saturating_sub(since_refill), up.signal()).await?;
                    tokens = count;
                    last_refill = Instant::now();
                }
            }
            Ok(())
        }))
    }

    /// Release at most `count` items per `per`.
    pub fn throttle(&self, count: usize, per: Duration) -> Result<Queue<T>, QueueError> {
        Ok(self
            .throttle_with_stats(count, per)?
            .map(|stats, _| async move { Ok(stats.item) }))
    }

    /// Hold back the first item for `duration`.
    pub fn initial_delay(&self, duration: Duration) -> Result<Queue<T>, QueueError> {
        QueueError::check_duration("initial_delay", "duration", duration)?;
        Ok(self.transform("initial_delay", 1, move |up, out| async move {
            let mut first = true;
            while let Some(item) = up.next().await {
                if first {
                    first = false;
                    delay(duration, up.signal()).await?;
                }
                if !out.emit(item).await {
                    break;
                }
            }
            Ok(())
        }))
    }

    /// Complete once no item has arrived for `duration`.
    ///
    /// The timer starts immediately and restarts on every arrival. It keeps
    /// running while a downstream reader holds up an emit.
    pub fn idle_timeout(&self, duration: Duration) -> Result<Queue<T>, QueueError> {
        QueueError::check_duration("idle_timeout", "duration", duration)?;
        Ok(self.transform(format!("idle_timeout({duration:?})"), 1, move |up, out| async move {
            let mut deadline = Instant::now() + duration;
            loop {
                let next = tokio::select! {
                    item = up.next() => item,
                    _ = sleep_until(deadline) => {
                        debug!(timeout = ?duration, "idle timeout elapsed");
                        break;
                    }
                };
                let Some(item) = next else {
                    break;
                };

                deadline = Instant::now() + duration;
                tokio::select! {
                    emitted = out.emit(item) => {
                        if !emitted {
                            break;
                        }
                    }
                    _ = sleep_until(deadline) => {
                        debug!(timeout = ?duration, "idle timeout elapsed while emitting");
                        break;
                    }
                }
            }
            Ok(())
        }))
    }
}
