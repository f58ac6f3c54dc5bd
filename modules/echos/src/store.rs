//! The host store seam and an in-memory store for tests and demos.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::action::{Action, ActionRef, Dispatch, Item};
use crate::config::runtime_available;
use crate::context::Echos;
use crate::error::{EchoError, EchoResult};

/// The host dispatch pipeline an echo context is installed into.
pub trait Store: Send + Sync {
    fn dispatch(&self, item: Item);

    fn state(&self) -> Value;

    /// Whether dispatching a producer runs it. Stores without a thunk
    /// stage should return false.
    fn runs_producers(&self) -> bool {
        true
    }
}

/// Pure state updates. No I/O, no side effects.
pub trait Reducer: Send + Sync {
    fn reduce(&self, state: &mut Value, action: &Action);
}

impl<F> Reducer for F
where
    F: Fn(&mut Value, &Action) + Send + Sync,
{
    fn reduce(&self, state: &mut Value, action: &Action) {
        self(state, action)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore (tests, no host application required)
// ---------------------------------------------------------------------------

/// In-memory host store: runs producers on the Tokio runtime, passes
/// everything else through the echo filter, reduces and records actions.
pub struct MemoryStore {
    state: Mutex<Value>,
    dispatched: Mutex<Vec<ActionRef>>,
    reducer: Option<Box<dyn Reducer>>,
    pipeline: OnceLock<Dispatch>,
}

impl MemoryStore {
    pub fn new(state: Value) -> Self {
        Self {
            state: Mutex::new(state),
            dispatched: Mutex::new(Vec::new()),
            reducer: None,
            pipeline: OnceLock::new(),
        }
    }

    pub fn with_reducer(mut self, reducer: impl Reducer + 'static) -> Self {
        self.reducer = Some(Box::new(reducer));
        self
    }

    /// Install `echos` into this store and bind it as the host.
    ///
    /// Pipeline: producer runner → echo filter → reducer/recorder.
    pub fn install(self, echos: &Echos) -> Arc<Self> {
        let store = Arc::new(self);
        let filter = echos.install(&store);

        let sink = {
            let store = Arc::downgrade(&store);
            Dispatch::new(move |item: Item| {
                if let Some(store) = store.upgrade() {
                    store.record(item);
                }
            })
        };
        let pipeline = run_producers(Arc::downgrade(&store), filter.wrap(sink));
        if store.pipeline.set(pipeline).is_err() {
            warn!("memory store pipeline was already set");
        }
        store
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, item: Item) {
        let action = match item {
            Item::Action(action) => action,
            other => {
                debug!(item = ?other, "memory store ignored a non-action item");
                return;
            }
        };
        if let Some(reducer) = &self.reducer {
            reducer.reduce(&mut Self::lock(&self.state), &action);
        }
        debug!(action_type = %action.action_type, action_id = %action.id, "action reduced");
        Self::lock(&self.dispatched).push(action);
    }

    /// Every action that reached the end of the pipeline, in order.
    pub fn dispatched(&self) -> Vec<ActionRef> {
        Self::lock(&self.dispatched).clone()
    }

    pub fn dispatched_types(&self) -> Vec<String> {
        Self::lock(&self.dispatched)
            .iter()
            .map(|action| action.action_type.clone())
            .collect()
    }

    /// Yield to the runtime until at least `count` actions have been
    /// recorded, or fail after a second.
    pub async fn settle(&self, count: usize) -> EchoResult<Vec<ActionRef>> {
        let wait = async {
            while Self::lock(&self.dispatched).len() < count {
                tokio::task::yield_now().await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), wait).await.is_err() {
            return Err(EchoError::Timeout {
                expected: count,
                seen: Self::lock(&self.dispatched).len(),
            });
        }
        Ok(self.dispatched())
    }

    /// Give spawned flushes and producers a chance to run.
    pub async fn quiesce(&self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }
}

impl Store for MemoryStore {
    fn dispatch(&self, item: Item) {
        match self.pipeline.get() {
            Some(pipeline) => pipeline.call(item),
            None => self.record(item),
        }
    }

    fn state(&self) -> Value {
        Self::lock(&self.state).clone()
    }

    fn runs_producers(&self) -> bool {
        runtime_available()
    }
}

/// The thunk stage: producers run on the runtime with the store's own
/// dispatch; everything else moves on to `next`.
fn run_producers(store: Weak<MemoryStore>, next: Dispatch) -> Dispatch {
    Dispatch::new(move |item: Item| {
        let producer = match item {
            Item::Producer(producer) => producer,
            other => {
                next.call(other);
                return;
            }
        };

        let dispatch = {
            let store = store.clone();
            Dispatch::new(move |item: Item| {
                if let Some(store) = store.upgrade() {
                    store.dispatch(item);
                }
            })
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!(producer = %producer.identity(), "no Tokio runtime; producer not run");
            return;
        };
        runtime.spawn(async move {
            match producer.run(dispatch).await {
                Ok(action) => debug!(
                    producer = %producer.identity(),
                    wrapped = producer.is_wrapped(),
                    action_type = %action.action_type,
                    "producer resolved"
                ),
                Err(e) => warn!(producer = %producer.identity(), error = %e, "producer failed"),
            }
        });
    })
}
