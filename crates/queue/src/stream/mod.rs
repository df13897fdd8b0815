//! Combinators over [`Queue`](crate::Queue).
//!
//! Every combinator is an inherent method built on
//! [`Queue::transform`](crate::Queue::transform). User callbacks receive the
//! stage's [`AbortSignal`](crate::AbortSignal) and return `anyhow::Result`;
//! returning [`Aborted`](crate::Aborted) ends the stage quietly, any other
//! error fails the derived queue.

mod batcher;
mod concurrent;
mod conflate;
mod ops;
mod timing;

pub use batcher::MicroBatcher;
pub use timing::ThrottleStats;
