//! Queue error types.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// A cloneable, type-erased error shared between every party that observes
/// the same failure.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Convert a callback error into a [`SharedError`].
pub fn share_error(error: anyhow::Error) -> SharedError {
    let boxed: Box<dyn StdError + Send + Sync + 'static> = error.into();
    Arc::from(boxed)
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("the queue `{name}` is full with current size {size}")]
    Full { name: String, size: usize },

    #[error("the queue `{name}` is completed, no more items can be enqueued")]
    Completed { name: String },

    #[error("{operation}() {message}")]
    InvalidArgument {
        operation: &'static str,
        message: String,
    },

    #[error("stage `{name}` failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: SharedError,
    },
}

impl QueueError {
    /// Reject a count or limit below one.
    pub(crate) fn check_positive(operation: &'static str, what: &str, value: usize) -> Result<(), Self> {
        if value < 1 {
            return Err(Self::InvalidArgument {
                operation,
                message: format!("{what} must be greater than 0, got {value}"),
            });
        }
        Ok(())
    }

    /// Reject a zero duration.
    pub(crate) fn check_duration(
        operation: &'static str,
        what: &str,
        value: std::time::Duration,
    ) -> Result<(), Self> {
        if value.is_zero() {
            return Err(Self::InvalidArgument {
                operation,
                message: format!("{what} must be greater than 0, got {value:?}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn invalid_argument_message_names_operation() {
        let err = QueueError::check_positive("take", "count", 0).unwrap_err();
        assert_eq!(err.to_string(), "take() count must be greater than 0, got 0");
    }

    #[test]
    fn zero_duration_is_rejected() {
        assert!(QueueError::check_duration("debounce", "duration", Duration::ZERO).is_err());
        assert!(QueueError::check_duration("debounce", "duration", Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn failed_keeps_source() {
        let err = QueueError::Failed {
            name: "map".into(),
            source: share_error(anyhow::anyhow!("boom")),
        };
        assert_eq!(err.to_string(), "stage `map` failed: boom");
        assert!(StdError::source(&err).is_some());
    }
}
