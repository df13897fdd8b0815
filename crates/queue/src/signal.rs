//! Fire-once cancellation signals.
//!
//! An [`AbortController`] owns the trigger, any number of [`AbortSignal`]s
//! observe it. A signal fires at most once and may carry a reason that every
//! observer sees as the same shared error instance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SharedError;

/// Marker error for work interrupted by an [`AbortSignal`].
///
/// Combinators treat it as an early, normal termination rather than a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the signal has been aborted")]
pub struct Aborted;

/// Whether an error chain is a cancellation.
pub fn is_aborted(error: &anyhow::Error) -> bool {
    error.is::<Aborted>()
}

#[derive(Debug, Clone)]
struct Fired {
    reason: Option<SharedError>,
}

/// Trigger side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct AbortController {
    tx: Arc<watch::Sender<Option<Fired>>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// A signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire without a reason. Returns `false` if already fired.
    pub fn abort(&self) -> bool {
        self.fire(None)
    }

    /// Fire with a reason. Returns `false` if already fired.
    pub fn abort_with(&self, reason: SharedError) -> bool {
        self.fire(Some(reason))
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }

    fn fire(&self, reason: Option<SharedError>) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(Fired { reason });
            true
        })
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<Fired>>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    /// A signal that has already fired.
    pub fn aborted_with(reason: Option<SharedError>) -> Self {
        let controller = AbortController::new();
        controller.fire(reason);
        controller.signal()
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The reason the signal fired with, if it fired with one.
    pub fn reason(&self) -> Option<SharedError> {
        self.rx.borrow().as_ref().and_then(|fired| fired.reason.clone())
    }

    /// `Err(Aborted)` once the signal has fired.
    pub fn check(&self) -> Result<(), Aborted> {
        if self.is_aborted() {
            Err(Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolve once the signal fires. Resolves immediately if it already has.
    ///
    /// A signal whose controller is gone without firing never resolves.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(Option::is_some).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run `callback` once the signal fires.
    ///
    /// The returned listener unregisters the callback when dropped or disposed.
    pub fn on_abort<F, Fut>(&self, callback: F) -> AbortListener
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal = self.clone();
        AbortListener {
            handle: tokio::spawn(async move {
                signal.aborted().await;
                callback().await;
            }),
        }
    }
}

/// Registration of an [`AbortSignal::on_abort`] callback.
#[derive(Debug)]
pub struct AbortListener {
    handle: JoinHandle<()>,
}

impl AbortListener {
    /// Unregister the callback if it has not run yet.
    pub fn dispose(self) {
        self.handle.abort();
    }
}

impl Drop for AbortListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Sleep for `duration` unless `signal` fires first.
pub async fn delay(duration: Duration, signal: &AbortSignal) -> Result<(), Aborted> {
    signal.check()?;
    tokio::select! {
        _ = signal.aborted() => Err(Aborted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_once() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());
        assert!(controller.abort_with(Arc::new(std::io::Error::other("first"))));
        assert!(!controller.abort_with(Arc::new(std::io::Error::other("second"))));
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().unwrap().to_string(), "first");
    }

    #[test]
    fn signals_created_after_firing_see_it() {
        let controller = AbortController::new();
        controller.abort();
        assert!(controller.signal().is_aborted());
        assert_eq!(controller.signal().check(), Err(Aborted));
        assert!(controller.signal().reason().is_none());
    }

    #[tokio::test]
    async fn aborted_resolves_for_already_fired_signal() {
        let signal = AbortSignal::aborted_with(None);
        tokio::time::timeout(Duration::from_secs(1), signal.aborted())
            .await
            .expect("already-fired signal should resolve immediately");
    }

    #[tokio::test(start_paused = true)]
    async fn never_does_not_fire() {
        let signal = AbortSignal::never();
        let result = tokio::time::timeout(Duration::from_secs(60), signal.aborted()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_interrupted() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let handle = tokio::spawn(async move { delay(Duration::from_secs(10), &signal).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        controller.abort();
        assert_eq!(handle.await.unwrap(), Err(Aborted));
    }

    #[tokio::test]
    async fn on_abort_runs_callback_once_and_dispose_cancels() {
        let calls = Arc::new(AtomicUsize::new(0));

        let controller = AbortController::new();
        let c = calls.clone();
        let _listener = controller.signal().on_abort(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let disposed = AbortController::new();
        let c = calls.clone();
        disposed
            .signal()
            .on_abort(move || async move {
                c.fetch_add(100, Ordering::SeqCst);
            })
            .dispose();

        controller.abort();
        disposed.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn is_aborted_detects_marker() {
        let err = anyhow::Error::new(Aborted).context("while mapping");
        assert!(is_aborted(&err));
        assert!(!is_aborted(&anyhow::anyhow!("other")));
    }
}
