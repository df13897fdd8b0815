//! Windowed request/response correlation.
//!
//! Requests are read from one queue and sent while fewer than `window_size`
//! are awaiting a response. Responses are read from another queue and paired
//! with their request by id. A supervisor fails the run when a request waits
//! longer than the response timeout.

use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use sluice_queue::{share_error, AbortController, AbortSignal, Aborted, Queue, Semaphore, SharedError};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, instrument, warn};

use crate::error::{AbortionSource, CorrelationFault, WindowCorrelationError};

// ── Contract ────────────────────────────────────────────────────

/// A request paired with the response that answered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMatch<Id, Req, Res> {
    pub id: Id,
    pub request: Req,
    pub response: Res,
}

/// The protocol a correlation run drives.
#[async_trait]
pub trait Correlate: Send + Sync {
    type Request: Clone + Debug + Send + Sync + 'static;
    type Response: Debug + Send + 'static;
    type Id: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    fn request_id(&self, request: &Self::Request) -> Self::Id;

    fn response_id(&self, response: &Self::Response) -> Self::Id;

    /// Put a request on the wire. Called after the request is registered as
    /// in flight, so its response may arrive before this returns.
    async fn send_request(&self, request: &Self::Request) -> anyhow::Result<()>;

    async fn on_match(&self, matched: WindowMatch<Self::Id, Self::Request, Self::Response>) -> anyhow::Result<()>;
}

/// Limits for a correlation run.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Maximum number of requests awaiting a response.
    pub window_size: NonZeroUsize,
    /// How long a request may wait for its response. Zero disables.
    pub response_timeout: Duration,
    /// Once one side finishes, how long the other may take. Zero disables.
    pub completion_timeout: Duration,
}

impl WindowConfig {
    pub fn new(window_size: NonZeroUsize) -> Self {
        Self {
            window_size,
            response_timeout: Duration::ZERO,
            completion_timeout: Duration::ZERO,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }
}

// ── Run state ───────────────────────────────────────────────────

struct Inflight<Req> {
    request: Req,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct Termination {
    source: Option<AbortionSource>,
    cause: Option<SharedError>,
    requests_completed: bool,
}

struct Window<'a, C: Correlate> {
    correlate: &'a C,
    config: &'a WindowConfig,
    inflight: Mutex<IndexMap<C::Id, Inflight<C::Request>>>,
    semaphore: Semaphore,
    termination: Mutex<Termination>,
    stop_requests: AbortController,
    stop_responses: AbortController,
    deadlines_changed: Notify,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<'a, C: Correlate> Window<'a, C> {
    fn new(correlate: &'a C, config: &'a WindowConfig) -> Self {
        Self {
            correlate,
            config,
            inflight: Mutex::new(IndexMap::new()),
            semaphore: Semaphore::new(config.window_size.get()),
            termination: Mutex::new(Termination::default()),
            stop_requests: AbortController::new(),
            stop_responses: AbortController::new(),
            deadlines_changed: Notify::new(),
        }
    }

    fn inflight_len(&self) -> usize {
        locked(&self.inflight).len()
    }

    fn is_aborted(&self) -> bool {
        locked(&self.termination).source.is_some()
    }

    /// Record an abort. The first terminating source wins and the first
    /// cause is kept.
    ///
    /// `RequestsCompleted` only lets outstanding responses drain, so it is
    /// replaced by whichever source ends the run. Every other source stops
    /// the request loop, and any abort carrying a cause stops both loops.
    fn abort(&self, source: AbortionSource, cause: Option<SharedError>) {
        let has_cause = cause.is_some();
        let first = {
            let mut termination = locked(&self.termination);
            if termination.cause.is_none() {
                termination.cause = cause;
            }
            // `RequestsCompleted` is provisional until a failure takes its place.
            let replaceable = matches!(termination.source, None | Some(AbortionSource::RequestsCompleted));
            if source == AbortionSource::RequestsCompleted {
                termination.requests_completed = true;
            }
            if replaceable && termination.source != Some(source) {
                termination.source = Some(source);
                true
            } else {
                false
            }
        };

        if first {
            debug!(%source, has_cause, "correlation aborting");
            if source == AbortionSource::RequestsCompleted {
                if self.inflight_len() == 0 {
                    self.stop_responses.abort();
                }
            } else {
                self.stop_requests.abort();
            }
        }
        if has_cause {
            self.stop_requests.abort();
            self.stop_responses.abort();
        }
    }

    async fn next_from<T: Send + 'static>(queue: &Queue<T>, stop: &AbortSignal) -> Option<T> {
        tokio::select! {
            biased;
            _ = stop.aborted() => None,
            item = queue.recv() => item,
        }
    }

    async fn process_requests(&self, requests: &Queue<C::Request>) {
        let stop = self.stop_requests.signal();

        while let Some(request) = Self::next_from(requests, &stop).await {
            if self.is_aborted() {
                break;
            }

            tokio::select! {
                biased;
                _ = stop.aborted() => break,
                _ = self.semaphore.acquire() => {}
            }
            if self.is_aborted() {
                self.semaphore.release();
                break;
            }

            let id = self.correlate.request_id(&request);
            let deadline = (!self.config.response_timeout.is_zero())
                .then(|| Instant::now() + self.config.response_timeout);
            locked(&self.inflight).insert(
                id,
                Inflight {
                    request: request.clone(),
                    deadline,
                },
            );
            if deadline.is_some() {
                self.deadlines_changed.notify_one();
            }

            if let Err(e) = self.correlate.send_request(&request).await {
                warn!(error = %e, "sending request failed");
                self.abort(AbortionSource::RequestsFailed, Some(share_error(e)));
                return;
            }

            if self.is_aborted() {
                break;
            }
        }

        self.abort(AbortionSource::RequestsCompleted, None);
    }

    async fn process_responses(&self, responses: &Queue<C::Response>) {
        let stop = self.stop_responses.signal();

        while let Some(response) = Self::next_from(responses, &stop).await {
            let id = self.correlate.response_id(&response);
            let Some(inflight) = locked(&self.inflight).shift_remove(&id) else {
                let fault = CorrelationFault::UnrecognizedId {
                    id: format!("{id:?}"),
                    response: format!("{response:?}"),
                };
                self.abort(AbortionSource::ResponsesFailed, Some(Arc::new(fault)));
                return;
            };
            self.semaphore.release();

            let matched = WindowMatch {
                id,
                request: inflight.request,
                response,
            };
            if let Err(e) = self.correlate.on_match(matched).await {
                self.abort(AbortionSource::ResponsesFailed, Some(share_error(e)));
                return;
            }

            if locked(&self.termination).requests_completed && self.inflight_len() == 0 {
                return;
            }
        }

        match self.inflight_len() {
            0 => self.abort(AbortionSource::ResponsesCompleted, None),
            inflight => self.abort(
                AbortionSource::ResponsesCompleted,
                Some(Arc::new(CorrelationFault::ResponsesEndedEarly { inflight })),
            ),
        }
    }

    /// Fail the run when a request outlives its deadline. Never returns.
    async fn supervise(&self) {
        loop {
            let changed = self.deadlines_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let now = Instant::now();
            let mut expired = None;
            let mut earliest = None;
            {
                let mut inflight = locked(&self.inflight);
                for entry in inflight.values_mut() {
                    match entry.deadline {
                        Some(deadline) if deadline <= now => {
                            entry.deadline = None;
                            expired = Some(format!("{:?}", entry.request));
                            break;
                        }
                        Some(deadline) => {
                            earliest = Some(earliest.map_or(deadline, |e: Instant| e.min(deadline)));
                        }
                        None => {}
                    }
                }
            }

            if let Some(request) = expired {
                let fault = CorrelationFault::ResponseTimeout {
                    timeout: self.config.response_timeout,
                    request,
                };
                self.abort(AbortionSource::CorrelationTimeout, Some(Arc::new(fault)));
                self.semaphore.release();
                continue;
            }

            match earliest {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = changed => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    fn finish(self) -> Result<(), WindowCorrelationError<C::Request>> {
        let termination = std::mem::take(&mut *locked(&self.termination));
        let uncorrelated: Vec<C::Request> = locked(&self.inflight)
            .drain(..)
            .map(|(_, inflight)| inflight.request)
            .collect();

        match (termination.source, termination.cause) {
            (Some(abortion), Some(cause)) => Err(WindowCorrelationError {
                abortion,
                uncorrelated,
                cause,
            }),
            _ => Ok(()),
        }
    }
}

// ── Entry point ─────────────────────────────────────────────────

/// Drive `requests` through `correlate` and pair them with `responses`.
///
/// Returns `Ok(())` only when both streams finished and every request was
/// matched. Any other ending returns a [`WindowCorrelationError`] carrying
/// the abort source, the first cause and the requests left unmatched.
///
/// A `signal` that has already fired on entry fails the run straight away
/// with [`AbortionSource::ExternalSignal`] and the signal's reason, before
/// any request is read. Callers that want cancellation before the start to
/// count as success should check the signal first.
///
/// Neither queue is completed by this function; it only stops reading them.
#[instrument(skip_all, fields(window = config.window_size.get()))]
pub async fn correlate_window<C: Correlate>(
    config: &WindowConfig,
    requests: &Queue<C::Request>,
    responses: &Queue<C::Response>,
    correlate: &C,
    signal: Option<&AbortSignal>,
) -> Result<(), WindowCorrelationError<C::Request>> {
    let window = Window::new(correlate, config);

    if let Some(signal) = signal {
        if signal.is_aborted() {
            return Err(WindowCorrelationError {
                abortion: AbortionSource::ExternalSignal,
                uncorrelated: Vec::new(),
                cause: external_cause(signal),
            });
        }
    }
    let external = signal.cloned().unwrap_or_else(AbortSignal::never);

    {
        let requests_run = window.process_requests(requests);
        let responses_run = window.process_responses(responses);
        let supervisor = window.supervise();
        tokio::pin!(requests_run, responses_run, supervisor);

        let mut requests_done = false;
        let mut responses_done = false;
        let mut external_armed = true;
        let mut grace: Option<Instant> = None;
        let arm_grace = |grace: &mut Option<Instant>| {
            if grace.is_none() && !config.completion_timeout.is_zero() {
                *grace = Some(Instant::now() + config.completion_timeout);
            }
        };

        while !(requests_done && responses_done) {
            tokio::select! {
                _ = &mut requests_run, if !requests_done => {
                    requests_done = true;
                    arm_grace(&mut grace);
                }
                _ = &mut responses_run, if !responses_done => {
                    responses_done = true;
                    arm_grace(&mut grace);
                }
                _ = &mut supervisor => {}
                _ = external.aborted(), if external_armed => {
                    external_armed = false;
                    window.abort(AbortionSource::ExternalSignal, Some(external_cause(&external)));
                }
                _ = sleep_until(grace.unwrap_or_else(Instant::now)), if grace.is_some() => {
                    let fault = CorrelationFault::CompletionTimeout {
                        timeout: config.completion_timeout,
                    };
                    warn!(requests_done, responses_done, "completion timeout elapsed");
                    window.abort(AbortionSource::CorrelationTimeout, Some(Arc::new(fault)));
                    break;
                }
            }
        }
    }

    window.finish()
}

fn external_cause(signal: &AbortSignal) -> SharedError {
    signal.reason().unwrap_or_else(|| Arc::new(Aborted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_disable_timeouts() {
        let config = WindowConfig::new(NonZeroUsize::new(4).unwrap());
        assert!(config.response_timeout.is_zero());
        assert!(config.completion_timeout.is_zero());

        let config = config.with_response_timeout(Duration::from_millis(10));
        assert_eq!(config.response_timeout, Duration::from_millis(10));
    }
}
