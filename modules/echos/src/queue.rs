//! The echo queue: one pending batch, one deferred flush per batch.
//!
//! Enqueueing never dispatches. The first enqueue of a batch schedules the
//! flush; everything enqueued before that flush runs joins the same batch. The
//! flush detaches the batch before draining it, so echoes produced while
//! draining open a fresh batch with its own flush.
//!
//! On a current-thread Tokio runtime the flush is spawned onto that runtime
//! and runs on a later turn of it. Anywhere else (no runtime, or a
//! multi-thread runtime) flushes are handed to a flush thread owned by the
//! queue, which runs them one at a time on its own current-thread runtime.
//! There a batch may be cut short by a flush that starts while the caller is
//! still enqueueing; batches still drain in order and never overlap.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::runtime::{Builder, Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::action::{ActionRef, Dispatch, Item, Thunk};
use crate::config::FlushPolicy;
use crate::link::link_action;

/// A queued unit of deferred work, consumed exactly once by a flush.
pub struct Echo {
    action: ActionRef,
    dispatch_fn: Box<dyn FnOnce() + Send>,
}

impl Echo {
    fn new(dispatch: Dispatch, action: ActionRef, resolve: Option<oneshot::Sender<ActionRef>>) -> Self {
        let queued = action.clone();
        Self {
            action,
            dispatch_fn: Box::new(move || {
                dispatch.call(Item::Action(queued.clone()));
                if let Some(resolve) = resolve {
                    // The producer may have been dropped; nobody is waiting then.
                    let _ = resolve.send(queued);
                }
            }),
        }
    }

    pub fn action(&self) -> &ActionRef {
        &self.action
    }

    fn dispatch(self) {
        (self.dispatch_fn)()
    }
}

#[derive(Clone)]
pub struct EchoQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    batch: Mutex<Option<Vec<Echo>>>,
    policy: FlushPolicy,
    scheduled: AtomicUsize,
    flush_thread: OnceLock<mpsc::UnboundedSender<EchoQueue>>,
    warned_multi_thread: AtomicBool,
}

impl EchoQueue {
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                batch: Mutex::new(None),
                policy,
                scheduled: AtomicUsize::new(0),
                flush_thread: OnceLock::new(),
                warned_multi_thread: AtomicBool::new(false),
            }),
        }
    }

    fn batch(&self) -> MutexGuard<'_, Option<Vec<Echo>>> {
        self.inner.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `action` for dispatch through `dispatch` on a later turn.
    ///
    /// The action is linked to `source` now. `resolve`, if given, receives
    /// the action right after it has been dispatched.
    ///
    /// Works with or without a Tokio runtime; see the module docs for where
    /// the flush runs.
    pub fn enqueue(
        &self,
        dispatch: &Dispatch,
        action: ActionRef,
        source: Option<&ActionRef>,
        resolve: Option<oneshot::Sender<ActionRef>>,
    ) {
        link_action(&action, source);
        debug!(
            action_type = %action.action_type,
            action_id = %action.id,
            "action is queued"
        );

        let echo = Echo::new(dispatch.clone(), action, resolve);
        let opened = {
            let mut batch = self.batch();
            match batch.as_mut() {
                Some(pending) => {
                    pending.push(echo);
                    false
                }
                None => {
                    *batch = Some(vec![echo]);
                    true
                }
            }
        };

        if opened {
            self.inner.scheduled.fetch_add(1, Ordering::SeqCst);
            self.schedule();
        }
    }

    fn schedule(&self) {
        let queue = self.clone();
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                handle.spawn(async move { queue.flush() });
            }
            Ok(_) => {
                if !self.inner.warned_multi_thread.swap(true, Ordering::SeqCst) {
                    warn!(
                        "echos: multi-thread runtime; flushes run on the echo flush thread \
                         and batches are not strict"
                    );
                }
                self.hand_off(queue);
            }
            Err(_) => self.hand_off(queue),
        }
    }

    /// Send a flush to the queue's own flush thread, starting it on first use.
    fn hand_off(&self, queue: EchoQueue) {
        let sender = self.inner.flush_thread.get_or_init(spawn_flush_thread);
        if sender.send(queue).is_err() {
            error!("echo flush thread is gone; batch stays pending");
        }
    }

    /// `enqueue` each action in order, all with the same source.
    pub fn enqueue_all(
        &self,
        dispatch: &Dispatch,
        actions: impl IntoIterator<Item = ActionRef>,
        source: Option<&ActionRef>,
    ) {
        for action in actions {
            self.enqueue(dispatch, action, source, None);
        }
    }

    /// Detach the current batch and dispatch it in FIFO order.
    ///
    /// Normally run by the spawned flush task; calling it directly drains the
    /// batch early and leaves the scheduled task with nothing to do.
    pub fn flush(&self) {
        let Some(batch) = self.batch().take() else {
            return;
        };

        let total = batch.len();
        debug!(batch_len = total, "flushing echoes");

        for (index, echo) in batch.into_iter().enumerate() {
            let action = echo.action.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| echo.dispatch())) {
                Ok(()) => debug!(
                    action_type = %action.action_type,
                    action_id = %action.id,
                    "action is dispatched"
                ),
                Err(cause) => {
                    let dropped = total - index - 1;
                    match self.inner.policy {
                        FlushPolicy::Abort => {
                            error!(
                                action_type = %action.action_type,
                                action_id = %action.id,
                                dropped,
                                "echo dispatch panicked, aborting flush"
                            );
                            panic::resume_unwind(cause);
                        }
                        FlushPolicy::Continue => error!(
                            action_type = %action.action_type,
                            action_id = %action.id,
                            remaining = dropped,
                            "echo dispatch panicked, continuing flush"
                        ),
                    }
                }
            }
        }
    }

    /// Actions in the open batch, or `None` when no batch is pending.
    pub fn peek(&self) -> Option<Vec<ActionRef>> {
        self.batch()
            .as_ref()
            .map(|batch| batch.iter().map(|echo| echo.action.clone()).collect())
    }

    /// Run `f` against the open batch in place.
    pub fn with_pending<R>(&self, f: impl FnOnce(Option<&mut Vec<Echo>>) -> R) -> R {
        let mut batch = self.batch();
        f(batch.as_mut())
    }

    pub fn is_idle(&self) -> bool {
        self.batch().is_none()
    }

    /// Number of flush tasks spawned so far.
    pub fn scheduled_flushes(&self) -> usize {
        self.inner.scheduled.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> FlushPolicy {
        self.inner.policy
    }
}

/// Start the thread that drains handed-off batches, one flush at a time.
///
/// The thread lives until every sender is dropped. A flush that panics has
/// already been logged by `flush`, so the thread swallows the panic and keeps
/// serving.
fn spawn_flush_thread() -> mpsc::UnboundedSender<EchoQueue> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<EchoQueue>();
    let started = thread::Builder::new()
        .name("echos-flush".into())
        .spawn(move || {
            let runtime = match Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "echo flush thread could not start a runtime");
                    return;
                }
            };
            runtime.block_on(async move {
                while let Some(queue) = receiver.recv().await {
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| queue.flush()));
                    tokio::task::yield_now().await;
                }
            });
        });
    if let Err(e) = started {
        error!(error = %e, "echo flush thread could not be spawned");
    }
    sender
}

/// A producer that queues its action and resolves once it is dispatched.
pub(crate) struct EchoThunk {
    pub(crate) queue: EchoQueue,
    pub(crate) action: ActionRef,
}

#[async_trait]
impl Thunk for EchoThunk {
    async fn run(&self, dispatch: Dispatch) -> Result<ActionRef> {
        let (resolve, resolved) = oneshot::channel();
        self.queue
            .enqueue(&dispatch, self.action.clone(), None, Some(resolve));
        resolved
            .await
            .context("echo was dropped before it was dispatched")
    }
}
