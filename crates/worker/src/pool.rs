//! Orchestrator side of the worker pool.
//!
//! [`run_queue_worker`] turns queued [`WorkerTask`]s into `Call` messages,
//! correlates the responses through a window of `concurrency` and resolves
//! each task's [`TaskHandle`]. Cancelling the pool stops dispatch and drains
//! the calls already sent through the `Terminate`/`Terminated` handshake.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_queue::{AbortController, AbortListener, AbortSignal, Queue, QueueError, QueueOptions};
use sluice_window::{correlate_window, Correlate, WindowConfig, WindowMatch};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::context::ExecutionContext;
use crate::error::{PoolError, TaskError};
use crate::port::{PortReceiver, PortSender};
use crate::protocol::{Outcome, WireMessage};

// ── Tasks ───────────────────────────────────────────────────────

type Reply<Res> = oneshot::Sender<Result<Res, TaskError>>;

/// A unit of work for the pool.
///
/// Dropping a task before it is answered resolves its handle with
/// [`TaskError::Cancelled`].
pub struct WorkerTask<Req, Res> {
    input: Req,
    reply: Reply<Res>,
    signal: Option<AbortSignal>,
}

impl<Req, Res> WorkerTask<Req, Res> {
    pub fn new(input: Req) -> (Self, TaskHandle<Res>) {
        let (reply, rx) = oneshot::channel();
        let task = Self {
            input,
            reply,
            signal: None,
        };
        (task, TaskHandle { rx })
    }

    /// Let `signal` abort the task while it runs.
    ///
    /// The abort is forwarded to the execution context; the task still
    /// resolves with whatever the handler returns.
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn input(&self) -> &Req {
        &self.input
    }
}

impl<Req: fmt::Debug, Res> fmt::Debug for WorkerTask<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTask")
            .field("input", &self.input)
            .field("abortable", &self.signal.is_some())
            .finish()
    }
}

/// Resolves with the task's result.
#[derive(Debug)]
pub struct TaskHandle<Res> {
    rx: oneshot::Receiver<Result<Res, TaskError>>,
}

impl<Res> Future for TaskHandle<Res> {
    type Output = Result<Res, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Cancelled)))
    }
}

// ── Correlation plumbing ────────────────────────────────────────

/// A task on its way to the execution context.
#[derive(Clone)]
struct Dispatch {
    id: u64,
    payload: Bytes,
    signal: Option<AbortSignal>,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("abortable", &self.signal.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Answer {
    id: u64,
    outcome: Outcome,
}

struct Pending<Res> {
    reply: Reply<Res>,
    listener: Option<AbortListener>,
}

type PendingMap<Res> = Arc<Mutex<HashMap<u64, Pending<Res>>>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PoolCorrelator<Res> {
    sender: PortSender,
    pending: PendingMap<Res>,
}

#[async_trait]
impl<Res: DeserializeOwned + Send + 'static> Correlate for PoolCorrelator<Res> {
    type Request = Dispatch;
    type Response = Answer;
    type Id = u64;

    fn request_id(&self, request: &Dispatch) -> u64 {
        request.id
    }

    fn response_id(&self, response: &Answer) -> u64 {
        response.id
    }

    async fn send_request(&self, request: &Dispatch) -> anyhow::Result<()> {
        let id = request.id;
        self.sender
            .send(&WireMessage::Call {
                id,
                payload: request.payload.to_vec(),
                abortable: request.signal.is_some(),
            })
            .await?;

        // Registered after the call is on the wire so an abort never overtakes it.
        if let Some(signal) = &request.signal {
            let sender = self.sender.clone();
            let listener = signal.on_abort(move || async move {
                debug!(id, "forwarding task abort");
                if let Err(e) = sender.send(&WireMessage::Abort { id }).await {
                    debug!(id, error = %e, "abort not delivered");
                }
            });
            if let Some(pending) = locked(&self.pending).get_mut(&id) {
                pending.listener = Some(listener);
            }
        }
        Ok(())
    }

    async fn on_match(&self, matched: WindowMatch<u64, Dispatch, Answer>) -> anyhow::Result<()> {
        let Some(pending) = locked(&self.pending).remove(&matched.id) else {
            return Ok(());
        };
        if let Some(listener) = pending.listener {
            listener.dispose();
        }

        let result = match matched.response.outcome {
            Outcome::Ok(bytes) => {
                rmp_serde::from_slice(&bytes).map_err(|e| TaskError::Codec(e.to_string()))
            }
            Outcome::Err(remote) => Err(TaskError::Remote(remote)),
        };
        if pending.reply.send(result).is_err() {
            debug!(id = matched.id, "task handle dropped before its result arrived");
        }
        Ok(())
    }
}

/// Tag each task with an id and park its reply until the response arrives.
///
/// Detached so that stopping dispatch leaves the caller's queue open.
fn dispatch_stage<Req, Res>(tasks: &Queue<WorkerTask<Req, Res>>, pending: PendingMap<Res>) -> Queue<Dispatch>
where
    Req: Serialize + Send + 'static,
    Res: Send + 'static,
{
    tasks
        .transform("worker.dispatch", 1, move |up, out| async move {
            let mut next_id = 0u64;
            while let Some(task) = up.next().await {
                let WorkerTask { input, reply, signal } = task;
                let payload = match rmp_serde::to_vec(&input) {
                    Ok(payload) => Bytes::from(payload),
                    Err(e) => {
                        let _ = reply.send(Err(TaskError::Codec(e.to_string())));
                        continue;
                    }
                };

                next_id += 1;
                let id = next_id;
                locked(&pending).insert(id, Pending { reply, listener: None });
                if !out.emit(Dispatch { id, payload, signal }).await {
                    locked(&pending).remove(&id);
                    break;
                }
            }
            Ok(())
        })
        .detach()
}

enum PumpEnd {
    Terminated,
    Lost,
}

/// Feed responses from the context into the correlator until `Terminated`
/// arrives or the port closes. Either way the response queue completes.
async fn pump_responses(mut receiver: PortReceiver, responses: Queue<Answer>) -> PumpEnd {
    let end = loop {
        match receiver.recv().await {
            Ok(Some(WireMessage::Response { id, outcome })) => {
                if let Err(e) = responses.enqueue(Answer { id, outcome }).await {
                    debug!(id, error = %e, "dropping late response");
                }
            }
            Ok(Some(WireMessage::Terminated)) => {
                debug!("execution context terminated");
                break PumpEnd::Terminated;
            }
            Ok(Some(other)) => warn!(message = ?other, "ignoring unexpected message"),
            Ok(None) => {
                warn!("execution context closed its port");
                break PumpEnd::Lost;
            }
            Err(e) => {
                warn!(error = %e, "reading from execution context failed");
                break PumpEnd::Lost;
            }
        }
    };
    responses.complete();
    end
}

/// Stops dispatch and asks the context to terminate, once.
struct Shutdown<Res> {
    sender: PortSender,
    dispatch: Queue<Dispatch>,
    pending: PendingMap<Res>,
    sent: AtomicBool,
}

impl<Res> Shutdown<Res> {
    async fn begin(&self) {
        if self.sent.swap(true, Ordering::SeqCst) {
            return;
        }

        self.dispatch.complete();
        let undispatched = self.dispatch.drain();
        if !undispatched.is_empty() {
            let mut pending = locked(&self.pending);
            for dispatch in &undispatched {
                pending.remove(&dispatch.id);
            }
        }
        if let Err(e) = self.sender.send(&WireMessage::Terminate).await {
            debug!(error = %e, "terminate not delivered");
        }
    }
}

// ── Entry point ─────────────────────────────────────────────────

/// Run `tasks` through the execution context until the queue completes or
/// `signal` fires.
///
/// Every task resolves: with the handler's result, with the correlation
/// error that ended the run while it was in flight, or with
/// [`TaskError::Cancelled`] if it was never dispatched. On return the task
/// queue is completed and the context has been torn down.
#[instrument(skip_all, fields(context = %context.name(), concurrency = config.concurrency))]
pub async fn run_queue_worker<Req, Res>(
    tasks: &Queue<WorkerTask<Req, Res>>,
    context: ExecutionContext,
    config: &PoolConfig,
    signal: Option<AbortSignal>,
) -> Result<(), PoolError>
where
    Req: Serialize + Send + 'static,
    Res: DeserializeOwned + Send + 'static,
{
    let (port, teardown) = context.into_parts();
    let (sender, mut receiver) = port.split();

    let ready = match config.validate() {
        Ok(()) => handshake(&mut receiver, config).await,
        Err(e) => Err(PoolError::from(e)),
    };
    if let Err(e) = ready {
        warn!(error = %e, "execution context failed to start");
        close_tasks(tasks);
        drop((sender, receiver));
        teardown.shutdown(config.terminate_timeout()).await;
        return Err(e);
    }
    info!("execution context ready");

    let pending: PendingMap<Res> = Arc::new(Mutex::new(HashMap::new()));
    let dispatch = dispatch_stage(tasks, Arc::clone(&pending));
    let responses = Queue::with_options(QueueOptions::new(config.concurrency).name("worker.responses"));
    let mut pump = tokio::spawn(pump_responses(receiver, responses.clone()));

    let correlator = PoolCorrelator {
        sender: sender.clone(),
        pending: Arc::clone(&pending),
    };
    let shutdown = Shutdown {
        sender: sender.clone(),
        dispatch: dispatch.clone(),
        pending: Arc::clone(&pending),
        sent: AtomicBool::new(false),
    };
    let window = WindowConfig::new(NonZeroUsize::new(config.concurrency).unwrap_or(NonZeroUsize::MIN))
        .with_response_timeout(config.task_timeout())
        .with_completion_timeout(config.completion_timeout());
    let external = signal.unwrap_or_else(AbortSignal::never);

    let outcome = {
        let run = correlate_window(&window, &dispatch, &responses, &correlator, None);
        tokio::pin!(run);
        tokio::select! {
            biased;
            _ = external.aborted() => {
                info!("pool cancelled, draining dispatched tasks");
                shutdown.begin().await;
                run.await
            }
            outcome = &mut run => outcome,
        }
    };

    if let Err(error) = outcome {
        warn!(
            abortion = %error.abortion,
            uncorrelated = error.uncorrelated.len(),
            error = %error,
            "correlation ended with an error"
        );
        let task_error = TaskError::Correlation {
            abortion: error.abortion,
            cause: error.cause,
        };
        let mut pending = locked(&pending);
        for dispatch in error.uncorrelated {
            if let Some(task) = pending.remove(&dispatch.id) {
                let _ = task.reply.send(Err(task_error.clone()));
            }
        }
    }

    responses.complete();
    shutdown.begin().await;
    let ended = match tokio::time::timeout(config.terminate_timeout(), &mut pump).await {
        Ok(Ok(end)) => Ok(end),
        Ok(Err(e)) => Err(PoolError::Join(e)),
        Err(_) => {
            pump.abort();
            Err(PoolError::TerminateTimeout(config.terminate_timeout()))
        }
    };

    // Closing every sender lets the context see the port close.
    locked(&pending).clear();
    drop((correlator, shutdown, sender));
    teardown.shutdown(config.terminate_timeout()).await;
    close_tasks(tasks);
    dispatch.complete();

    match ended? {
        PumpEnd::Terminated => {
            info!("worker pool finished");
            Ok(())
        }
        PumpEnd::Lost => Err(PoolError::ContextLost),
    }
}

async fn handshake(receiver: &mut PortReceiver, config: &PoolConfig) -> Result<(), PoolError> {
    match tokio::time::timeout(config.init_timeout(), receiver.recv()).await {
        Err(_) => Err(PoolError::InitTimeout(config.init_timeout())),
        Ok(Ok(Some(WireMessage::Ready))) => Ok(()),
        Ok(Ok(Some(other))) => Err(PoolError::Handshake(format!("expected ready, got {other:?}"))),
        Ok(Ok(None)) => Err(PoolError::ContextLost),
        Ok(Err(e)) => Err(PoolError::Port(e)),
    }
}

/// Complete the task queue and drop whatever is still buffered in it.
fn close_tasks<T: Send + 'static>(tasks: &Queue<T>) {
    tasks.complete();
    let dropped = tasks.drain().len();
    if dropped > 0 {
        debug!(dropped, "cancelled undispatched tasks");
    }
}

// ── Pool handle ─────────────────────────────────────────────────

/// A running pool with its own task queue.
pub struct WorkerPool<Req, Res> {
    tasks: Queue<WorkerTask<Req, Res>>,
    controller: AbortController,
    run: JoinHandle<Result<(), PoolError>>,
}

impl<Req, Res> WorkerPool<Req, Res>
where
    Req: Serialize + Send + 'static,
    Res: DeserializeOwned + Send + 'static,
{
    /// Start dispatching to `context`. The task queue holds `concurrency` tasks.
    pub fn start(context: ExecutionContext, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let tasks = Queue::with_options(QueueOptions::new(config.concurrency).name("worker.tasks"));
        let controller = AbortController::new();

        let run = {
            let tasks = tasks.clone();
            let signal = controller.signal();
            tokio::spawn(async move { run_queue_worker(&tasks, context, &config, Some(signal)).await })
        };

        Ok(Self {
            tasks,
            controller,
            run,
        })
    }

    /// Queue `input`, waiting while the task queue is full.
    pub async fn submit(&self, input: Req) -> Result<TaskHandle<Res>, QueueError> {
        let (task, handle) = WorkerTask::new(input);
        self.enqueue(task).await?;
        Ok(handle)
    }

    /// Queue `input` with a signal that aborts just this task.
    pub async fn submit_with_signal(&self, input: Req, signal: AbortSignal) -> Result<TaskHandle<Res>, QueueError> {
        let (task, handle) = WorkerTask::new(input);
        self.enqueue(task.with_signal(signal)).await?;
        Ok(handle)
    }

    async fn enqueue(&self, task: WorkerTask<Req, Res>) -> Result<(), QueueError> {
        if self.tasks.enqueue(task).await? {
            Ok(())
        } else {
            Err(QueueError::Completed {
                name: self.tasks.name().to_string(),
            })
        }
    }

    /// Stop taking tasks; queued ones still run.
    pub fn close(&self) {
        self.tasks.complete();
    }

    /// Cancel the pool: nothing new is dispatched and dispatched tasks drain.
    pub fn abort(&self) {
        self.controller.abort();
    }

    /// A controller that cancels the pool, for signal handlers and the like.
    pub fn canceller(&self) -> AbortController {
        self.controller.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tasks.is_completed()
    }

    /// Wait for the pool to finish.
    pub async fn join(self) -> Result<(), PoolError> {
        self.run.await?
    }
}
