//! Backpressured, cancellable async queues with a combinator algebra.

pub mod error;
pub mod queue;
pub mod semaphore;
pub mod signal;
pub mod stream;

pub use error::{share_error, QueueError, SharedError};
pub use queue::{Emitter, LatestValueQueue, Queue, QueueOptions, Upstream};
pub use semaphore::{Permit, Semaphore};
pub use signal::{delay, is_aborted, AbortController, AbortListener, AbortSignal, Aborted};
pub use stream::{MicroBatcher, ThrottleStats};
