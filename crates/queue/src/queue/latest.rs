use std::sync::Arc;

use super::shared::{Shared, StorageKind};
use super::Queue;
use crate::error::QueueError;

/// Single-slot queue where a new value replaces any unread one.
///
/// Producers never wait. Readers obtained through [`reader`](Self::reader)
/// see only the most recent value accumulated since their last read.
pub struct LatestValueQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> LatestValueQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Shared::new(name.into(), StorageKind::Latest, Vec::new(), None),
        }
    }

    /// Store `item`, overwriting an unread value.
    pub fn accumulate(&self, item: T) -> Result<(), QueueError> {
        self.shared.try_enqueue(item).map(|_| ())
    }

    pub fn has_unread(&self) -> bool {
        self.shared.len() > 0
    }

    /// Remove the unread value without waiting.
    pub fn take_unread(&self) -> Option<T> {
        self.shared.drain().pop()
    }

    /// A consumer handle over this queue.
    pub fn reader(&self) -> Queue<T> {
        Queue::from_shared(Arc::clone(&self.shared))
    }

    pub fn complete(&self) -> bool {
        self.shared.complete()
    }

    pub fn is_completed(&self) -> bool {
        self.shared.is_completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_value_overwrites_unread() {
        let latest = LatestValueQueue::new("gauge");
        latest.accumulate(1).unwrap();
        latest.accumulate(2).unwrap();
        assert!(latest.has_unread());

        let reader = latest.reader();
        assert_eq!(reader.recv().await, Some(2));
        assert!(!latest.has_unread());
    }

    #[tokio::test]
    async fn unread_value_survives_completion() {
        let latest = LatestValueQueue::new("gauge");
        latest.accumulate("last").unwrap();
        latest.complete();
        let reader = latest.reader();
        assert_eq!(reader.recv().await, Some("last"));
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn accumulate_after_complete_fails() {
        let latest = LatestValueQueue::new("gauge");
        latest.complete();
        assert!(matches!(latest.accumulate(1), Err(QueueError::Completed { .. })));
    }
}
