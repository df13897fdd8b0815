//! State shared by every handle, emitter and stage attached to one queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{oneshot, watch, Notify};
use tracing::debug;

use crate::error::QueueError;

/// Anything a derived queue can complete when it finishes.
pub(crate) trait Completable: Send + Sync {
    fn complete(&self) -> bool;
}

/// Weak back-reference from a derived queue to one of its parents.
pub(crate) type ParentLink = Weak<dyn Completable>;

pub(crate) type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Which buffering discipline a queue uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageKind {
    /// FIFO buffer holding at most `capacity` items.
    Bounded { capacity: usize, reject_on_full: bool },
    /// Single slot, last value wins.
    Latest,
}

enum Storage<T> {
    Bounded {
        buffer: VecDeque<T>,
        producers: VecDeque<PendingEnqueue<T>>,
    },
    Latest {
        slot: Option<T>,
    },
}

/// A producer suspended on a full buffer, holding the item it wants to add.
struct PendingEnqueue<T> {
    item: T,
    ack: oneshot::Sender<bool>,
}

struct State<T> {
    storage: Storage<T>,
    completed: bool,
    failure: Option<QueueError>,
    on_complete: Option<CompletionCallback>,
    parents: Vec<ParentLink>,
}

/// Outcome of trying to add an item without waiting.
pub(crate) enum Admission {
    Accepted,
    Waiting(oneshot::Receiver<bool>),
}

/// Outcome of trying to take an item without waiting.
pub(crate) enum Pop<T> {
    Item(T),
    Empty,
    Finished,
}

pub(crate) struct Shared<T> {
    pub(crate) name: String,
    kind: StorageKind,
    state: Mutex<State<T>>,
    readable: Notify,
    paused: watch::Sender<bool>,
    /// Live consumer handles. The queue completes when this drops to zero.
    pub(crate) handles: AtomicUsize,
}

impl<T> Shared<T> {
    pub(crate) fn new(
        name: String,
        kind: StorageKind,
        parents: Vec<ParentLink>,
        on_complete: Option<CompletionCallback>,
    ) -> Arc<Self> {
        let storage = match kind {
            StorageKind::Bounded { capacity, .. } => Storage::Bounded {
                buffer: VecDeque::with_capacity(capacity),
                producers: VecDeque::new(),
            },
            StorageKind::Latest => Storage::Latest { slot: None },
        };
        let (paused, _) = watch::channel(false);
        Arc::new(Self {
            name,
            kind,
            state: Mutex::new(State {
                storage,
                completed: false,
                failure: None,
                on_complete,
                parents,
            }),
            readable: Notify::new(),
            paused,
            handles: AtomicUsize::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn capacity(&self) -> usize {
        match self.kind {
            StorageKind::Bounded { capacity, .. } => capacity,
            StorageKind::Latest => 1,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.state().storage {
            Storage::Bounded { buffer, .. } => buffer.len(),
            Storage::Latest { slot } => usize::from(slot.is_some()),
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state().completed
    }

    pub(crate) fn failure(&self) -> Option<QueueError> {
        self.state().failure.clone()
    }

    pub(crate) fn detach(&self) {
        self.state().parents.clear();
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub(crate) fn try_enqueue(&self, item: T) -> Result<Admission, QueueError> {
        let mut state = self.state();
        if state.completed {
            return Err(QueueError::Completed {
                name: self.name.clone(),
            });
        }

        let admission = match &mut state.storage {
            Storage::Latest { slot } => {
                *slot = Some(item);
                Admission::Accepted
            }
            Storage::Bounded { buffer, producers } => {
                let StorageKind::Bounded {
                    capacity,
                    reject_on_full,
                } = self.kind
                else {
                    unreachable!("bounded storage always has a bounded kind");
                };

                if buffer.len() < capacity && producers.is_empty() {
                    buffer.push_back(item);
                    Admission::Accepted
                } else if reject_on_full {
                    return Err(QueueError::Full {
                        name: self.name.clone(),
                        size: buffer.len(),
                    });
                } else {
                    let (ack, rx) = oneshot::channel();
                    producers.push_back(PendingEnqueue { item, ack });
                    Admission::Waiting(rx)
                }
            }
        };

        if matches!(admission, Admission::Accepted) {
            self.readable.notify_one();
        }
        Ok(admission)
    }

    /// Add an item, suspending while the buffer is full.
    ///
    /// Resolves `Ok(false)` if the queue completes while suspended.
    pub(crate) async fn enqueue(&self, item: T) -> Result<bool, QueueError> {
        match self.try_enqueue(item)? {
            Admission::Accepted => Ok(true),
            Admission::Waiting(rx) => Ok(rx.await.unwrap_or(false)),
        }
    }

    pub(crate) fn try_pop(&self) -> Pop<T> {
        let mut state = self.state();
        let completed = state.completed;
        let item = match &mut state.storage {
            Storage::Latest { slot } => slot.take(),
            Storage::Bounded { buffer, producers } => {
                let item = buffer.pop_front();
                if item.is_some() {
                    // Admit the oldest producer that is still waiting.
                    while let Some(pending) = producers.pop_front() {
                        if pending.ack.is_closed() {
                            continue;
                        }
                        buffer.push_back(pending.item);
                        let _ = pending.ack.send(true);
                        break;
                    }
                }
                item
            }
        };

        match item {
            Some(item) => Pop::Item(item),
            None if completed => Pop::Finished,
            None => Pop::Empty,
        }
    }

    /// Take the next item, waiting for one if the buffer is empty.
    ///
    /// Returns `None` once the queue is completed and drained. Cancel safe.
    pub(crate) async fn recv(&self) -> Option<T> {
        loop {
            self.wait_unpaused().await;

            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_pop() {
                Pop::Item(item) => return Some(item),
                Pop::Finished => return None,
                Pop::Empty => {}
            }

            notified.await;
        }
    }

    async fn wait_unpaused(&self) {
        if !self.is_paused() {
            return;
        }
        let mut rx = self.paused.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    /// Remove every buffered item, admitting suspended producers' items too.
    pub(crate) fn drain(&self) -> Vec<T> {
        let mut state = self.state();
        match &mut state.storage {
            Storage::Latest { slot } => slot.take().into_iter().collect(),
            Storage::Bounded { buffer, producers } => {
                let mut items: Vec<T> = buffer.drain(..).collect();
                for pending in producers.drain(..) {
                    if pending.ack.send(true).is_ok() {
                        items.push(pending.item);
                    }
                }
                items
            }
        }
    }

    pub(crate) fn complete(&self) -> bool {
        self.finish(None)
    }

    pub(crate) fn fail(&self, failure: QueueError) -> bool {
        self.finish(Some(failure))
    }

    fn finish(&self, failure: Option<QueueError>) -> bool {
        let (callback, parents, producers) = {
            let mut state = self.state();
            if state.completed {
                return false;
            }
            state.completed = true;
            state.failure = failure;
            let producers = match &mut state.storage {
                Storage::Bounded { producers, .. } => std::mem::take(producers),
                Storage::Latest { .. } => VecDeque::new(),
            };
            (
                state.on_complete.take(),
                std::mem::take(&mut state.parents),
                producers,
            )
        };

        for pending in producers {
            let _ = pending.ack.send(false);
        }
        self.readable.notify_waiters();

        if let Some(callback) = callback {
            callback();
        }
        for parent in parents.iter().filter_map(Weak::upgrade) {
            parent.complete();
        }

        debug!(queue = %self.name, "queue completed");
        true
    }
}

impl<T: Send> Completable for Shared<T> {
    fn complete(&self) -> bool {
        Shared::complete(self)
    }
}

/// Weak link suitable for a child's parent list.
pub(crate) fn parent_link<T: Send + 'static>(shared: &Arc<Shared<T>>) -> ParentLink {
    let weak: Weak<Shared<T>> = Arc::downgrade(shared);
    weak
}

impl<T> Shared<T> {
    pub(crate) fn release_handle(&self) {
        if self.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!(queue = %self.name, "last handle dropped");
            self.complete();
        }
    }

    pub(crate) fn acquire_handle(&self) {
        self.handles.fetch_add(1, Ordering::AcqRel);
    }
}
