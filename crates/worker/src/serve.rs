//! Execution-context side of the protocol.
//!
//! [`serve`] acknowledges with `Ready`, runs every `Call` through a
//! [`TaskHandler`] in its own task and answers with a `Response` carrying the
//! same id. `Terminate` stops new calls; running ones finish before
//! `Terminated` is sent.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_queue::{AbortController, AbortSignal};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::error::PortError;
use crate::port::{Port, PortSender};
use crate::protocol::{Outcome, RemoteError, RemoteErrorKind, WireMessage};

/// Frame buffer used by [`serve_stdio`].
const STDIO_CHANNEL_CAPACITY: usize = 64;

// ── Handler contract ────────────────────────────────────────────

/// The work an execution context performs for each call.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    /// Handle one call. `signal` is present when the caller can abort the
    /// task; returning [`Aborted`](sluice_queue::Aborted) reports the abort.
    async fn handle(&self, input: Self::Input, signal: Option<AbortSignal>) -> anyhow::Result<Self::Output>;
}

/// A [`TaskHandler`] backed by a closure. See [`handler_fn`].
pub struct HandlerFn<F, I, O> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<I, O, F, Fut>(f: F) -> HandlerFn<F, I, O>
where
    F: Fn(I, Option<AbortSignal>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
{
    HandlerFn {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<I, O, F, Fut> TaskHandler for HandlerFn<F, I, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(I, Option<AbortSignal>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn handle(&self, input: I, signal: Option<AbortSignal>) -> anyhow::Result<O> {
        (self.f)(input, signal).await
    }
}

// ── Serving loop ────────────────────────────────────────────────

type AbortMap = Arc<Mutex<HashMap<u64, AbortController>>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serve calls arriving on `port` until terminated or disconnected.
///
/// Returns once `Terminated` has been sent, or once the pool side of the
/// port is gone and every running call has finished.
#[instrument(skip_all)]
pub async fn serve<H: TaskHandler>(port: Port, handler: H) -> Result<(), PortError> {
    let Port {
        sender,
        mut receiver,
        writer,
    } = port;
    let handler = Arc::new(handler);
    let aborts: AbortMap = Arc::new(Mutex::new(HashMap::new()));
    let mut calls = JoinSet::new();

    sender.send(&WireMessage::Ready).await?;
    info!("ready");

    let mut terminating = false;
    let mut connected = true;
    while !(terminating && calls.is_empty()) {
        tokio::select! {
            message = receiver.recv(), if connected => match message? {
                Some(WireMessage::Call { id, payload, abortable }) if !terminating => {
                    let signal = abortable.then(|| {
                        let controller = AbortController::new();
                        let signal = controller.signal();
                        locked(&aborts).insert(id, controller);
                        signal
                    });
                    calls.spawn(run_call(
                        Arc::clone(&handler),
                        sender.clone(),
                        Arc::clone(&aborts),
                        id,
                        payload,
                        signal,
                    ));
                }
                Some(WireMessage::Call { id, .. }) => {
                    debug!(id, "rejecting call received after terminate");
                    let outcome = Outcome::Err(RemoteError::new(
                        RemoteErrorKind::Terminating,
                        "the execution context is terminating",
                    ));
                    sender.send(&WireMessage::Response { id, outcome }).await?;
                }
                Some(WireMessage::Abort { id }) => {
                    if let Some(controller) = locked(&aborts).remove(&id) {
                        debug!(id, "aborting call");
                        controller.abort();
                    }
                }
                Some(WireMessage::Terminate) => {
                    if !calls.is_empty() {
                        info!(
                            pending = calls.len(),
                            "received termination command but still waiting for pending calls"
                        );
                    }
                    terminating = true;
                }
                Some(other) => warn!(message = ?other, "ignoring unexpected message"),
                None => {
                    debug!(pending = calls.len(), "port closed by the pool");
                    connected = false;
                    terminating = true;
                }
            },
            Some(joined) = calls.join_next() => {
                if let Err(e) = joined {
                    warn!(error = %e, "call task failed");
                }
            }
            else => break,
        }
    }

    if connected {
        sender.send(&WireMessage::Terminated).await?;
        info!("terminated");
    }
    drop(sender);
    if let Some(writer) = writer {
        if let Err(e) = writer.await {
            warn!(error = %e, "frame writer failed");
        }
    }
    Ok(())
}

/// [`serve`] over this process's stdin and stdout.
///
/// Stdout carries frames, so logging must go to stderr.
pub async fn serve_stdio<H: TaskHandler>(handler: H) -> Result<(), PortError> {
    let port = Port::from_io(tokio::io::stdin(), tokio::io::stdout(), STDIO_CHANNEL_CAPACITY);
    serve(port, handler).await
}

async fn run_call<H: TaskHandler>(
    handler: Arc<H>,
    sender: PortSender,
    aborts: AbortMap,
    id: u64,
    payload: Vec<u8>,
    signal: Option<AbortSignal>,
) {
    let abortable = signal.is_some();
    let outcome = match rmp_serde::from_slice::<H::Input>(&payload) {
        Err(e) => Outcome::Err(RemoteError::new(
            RemoteErrorKind::Decode,
            format!("failed to decode call payload: {e}"),
        )),
        Ok(input) => match AssertUnwindSafe(handler.handle(input, signal)).catch_unwind().await {
            Ok(Ok(output)) => match rmp_serde::to_vec(&output) {
                Ok(bytes) => Outcome::Ok(bytes),
                Err(e) => Outcome::Err(RemoteError::new(
                    RemoteErrorKind::Decode,
                    format!("failed to encode call result: {e}"),
                )),
            },
            Ok(Err(e)) => Outcome::Err(RemoteError::from_anyhow(&e)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(id, %message, "handler panicked");
                Outcome::Err(RemoteError::new(RemoteErrorKind::Panicked, message))
            }
        },
    };

    if abortable {
        locked(&aborts).remove(&id);
    }
    if let Err(e) = sender.send(&WireMessage::Response { id, outcome }).await {
        debug!(id, error = %e, "dropping response, port closed");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sluice_queue::delay;

    fn doubler() -> impl TaskHandler<Input = (u64, u64), Output = u64> {
        handler_fn(|(input, delay_ms): (u64, u64), signal: Option<AbortSignal>| async move {
            let signal = signal.unwrap_or_else(AbortSignal::never);
            delay(Duration::from_millis(delay_ms), &signal).await?;
            anyhow::Ok(input * 2)
        })
    }

    fn call(id: u64, input: u64, delay_ms: u64, abortable: bool) -> WireMessage {
        WireMessage::Call {
            id,
            payload: rmp_serde::to_vec(&(input, delay_ms)).unwrap(),
            abortable,
        }
    }

    fn expect_response(message: Option<WireMessage>) -> (u64, Outcome) {
        match message {
            Some(WireMessage::Response { id, outcome }) => (id, outcome),
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn answers_calls_then_terminates() {
        let (mut pool, context) = Port::pair(8);
        let served = tokio::spawn(serve(context, doubler()));

        assert_eq!(pool.recv().await.unwrap(), Some(WireMessage::Ready));
        pool.send(&call(1, 21, 0, false)).await.unwrap();
        let (id, outcome) = expect_response(pool.recv().await.unwrap());
        assert_eq!(id, 1);
        let Outcome::Ok(bytes) = outcome else {
            panic!("call failed: {outcome:?}");
        };
        assert_eq!(rmp_serde::from_slice::<u64>(&bytes).unwrap(), 42);

        pool.send(&WireMessage::Terminate).await.unwrap();
        assert_eq!(pool.recv().await.unwrap(), Some(WireMessage::Terminated));
        served.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn abort_fires_only_the_matching_call() {
        let (mut pool, context) = Port::pair(8);
        tokio::spawn(serve(context, doubler()));
        assert_eq!(pool.recv().await.unwrap(), Some(WireMessage::Ready));

        pool.send(&call(1, 1, 1000, true)).await.unwrap();
        pool.send(&call(2, 2, 50, true)).await.unwrap();
        pool.send(&WireMessage::Abort { id: 1 }).await.unwrap();

        let (id, outcome) = expect_response(pool.recv().await.unwrap());
        assert_eq!(id, 1);
        let Outcome::Err(remote) = outcome else {
            panic!("aborted call succeeded");
        };
        assert_eq!(remote.kind, RemoteErrorKind::Aborted);
        assert_eq!(remote.message, "the signal has been aborted");

        let (id, outcome) = expect_response(pool.recv().await.unwrap());
        assert_eq!(id, 2);
        assert!(matches!(outcome, Outcome::Ok(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_waits_for_running_calls_and_rejects_new_ones() {
        let (mut pool, context) = Port::pair(8);
        tokio::spawn(serve(context, doubler()));
        assert_eq!(pool.recv().await.unwrap(), Some(WireMessage::Ready));

        pool.send(&call(1, 5, 100, false)).await.unwrap();
        pool.send(&WireMessage::Terminate).await.unwrap();
        pool.send(&call(2, 6, 0, false)).await.unwrap();

        let (id, outcome) = expect_response(pool.recv().await.unwrap());
        assert_eq!(id, 2);
        assert!(matches!(
            outcome,
            Outcome::Err(RemoteError { kind: RemoteErrorKind::Terminating, .. })
        ));

        let (id, outcome) = expect_response(pool.recv().await.unwrap());
        assert_eq!(id, 1);
        assert!(matches!(outcome, Outcome::Ok(_)));
        assert_eq!(pool.recv().await.unwrap(), Some(WireMessage::Terminated));
    }

    #[tokio::test]
    async fn bad_payload_and_panics_become_remote_errors() {
        let (mut pool, context) = Port::pair(8);
        let handler = handler_fn(|input: u64, _signal: Option<AbortSignal>| async move {
            if input == 0 {
                panic!("zero is not allowed");
            }
            anyhow::Ok(input)
        });
        tokio::spawn(serve(context, handler));
        assert_eq!(pool.recv().await.unwrap(), Some(WireMessage::Ready));

        pool.send(&WireMessage::Call {
            id: 1,
            payload: rmp_serde::to_vec("not a number").unwrap(),
            abortable: false,
        })
        .await
        .unwrap();
        let (_, outcome) = expect_response(pool.recv().await.unwrap());
        assert!(matches!(
            outcome,
            Outcome::Err(RemoteError { kind: RemoteErrorKind::Decode, .. })
        ));

        pool.send(&WireMessage::Call {
            id: 2,
            payload: rmp_serde::to_vec(&0u64).unwrap(),
            abortable: false,
        })
        .await
        .unwrap();
        let (_, outcome) = expect_response(pool.recv().await.unwrap());
        let Outcome::Err(remote) = outcome else {
            panic!("panicking call succeeded");
        };
        assert_eq!(remote.kind, RemoteErrorKind::Panicked);
        assert_eq!(remote.message, "handler panicked: zero is not allowed");
    }

    #[tokio::test]
    async fn disconnect_ends_serving_without_terminated() {
        let (mut pool, context) = Port::pair(4);
        let served = tokio::spawn(serve(context, doubler()));
        assert_eq!(pool.recv().await.unwrap(), Some(WireMessage::Ready));
        drop(pool);
        served.await.unwrap().unwrap();
    }
}
