use std::fmt;
use std::time::Duration;

use sluice_queue::SharedError;
use thiserror::Error;

/// What ended a correlation run. The first source observed is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortionSource {
    ExternalSignal,
    ResponsesCompleted,
    ResponsesFailed,
    CorrelationTimeout,
    RequestsCompleted,
    RequestsFailed,
}

impl AbortionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalSignal => "external_signal",
            Self::ResponsesCompleted => "responses_completed",
            Self::ResponsesFailed => "responses_failed",
            Self::CorrelationTimeout => "correlation_timeout",
            Self::RequestsCompleted => "requests_completed",
            Self::RequestsFailed => "requests_failed",
        }
    }
}

impl fmt::Display for AbortionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol faults detected by the correlator itself.
#[derive(Debug, Error)]
pub enum CorrelationFault {
    #[error("received a response with an unrecognized id={id}: {response}")]
    UnrecognizedId { id: String, response: String },

    #[error("responses completed but there are still {inflight} requests in flight")]
    ResponsesEndedEarly { inflight: usize },

    #[error(
        "timed out after {}ms waiting for a response for a prior request: {request}",
        .timeout.as_millis()
    )]
    ResponseTimeout { timeout: Duration, request: String },

    #[error(
        "timed out after {}ms waiting for requests and responses to finish together",
        .timeout.as_millis()
    )]
    CompletionTimeout { timeout: Duration },
}

/// A correlation run that ended with an error.
///
/// `uncorrelated` holds every request that was sent but never matched, in
/// the order they were sent, so callers can fail each one individually.
#[derive(Debug, Error)]
#[error("{cause}")]
pub struct WindowCorrelationError<Req> {
    pub abortion: AbortionSource,
    pub uncorrelated: Vec<Req>,
    #[source]
    pub cause: SharedError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn abortion_sources_render_snake_case() {
        assert_eq!(AbortionSource::CorrelationTimeout.to_string(), "correlation_timeout");
        assert_eq!(AbortionSource::ExternalSignal.as_str(), "external_signal");
    }

    #[test]
    fn correlation_error_displays_cause() {
        let err = WindowCorrelationError {
            abortion: AbortionSource::ResponsesFailed,
            uncorrelated: vec![1, 2],
            cause: Arc::new(CorrelationFault::UnrecognizedId {
                id: "9".into(),
                response: "Reply { id: 9 }".into(),
            }),
        };
        assert_eq!(
            err.to_string(),
            "received a response with an unrecognized id=9: Reply { id: 9 }"
        );
    }

    #[test]
    fn timeout_message_reports_millis() {
        let fault = CorrelationFault::ResponseTimeout {
            timeout: Duration::from_millis(250),
            request: "Job(1)".into(),
        };
        assert_eq!(
            fault.to_string(),
            "timed out after 250ms waiting for a response for a prior request: Job(1)"
        );
    }
}
