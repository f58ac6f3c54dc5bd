//! The echo context: queue, translator registry and the bound host store.
//!
//! One `Echos` value replaces what would otherwise be process-wide state.
//! Clones share everything. The store is held weakly and rebound by every
//! `install`, so a context follows the most recently installed store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde_json::Value;
use tracing::{info, warn};

use crate::action::{ActionRef, Dispatch, Item, Producer, Squeak};
use crate::chain::Connector;
use crate::config::{runtime_available, EchoConfig};
use crate::error::{EchoError, EchoResult};
use crate::filter::EchoFilter;
use crate::link::link_action;
use crate::queue::{EchoQueue, EchoThunk};
use crate::registry::{Selector, Translator, TranslatorRegistry};
use crate::store::Store;

#[derive(Clone)]
pub struct Echos {
    inner: Arc<EchosInner>,
}

struct EchosInner {
    queue: EchoQueue,
    registry: TranslatorRegistry,
    store: RwLock<Option<Weak<dyn Store>>>,
    thunk_mode: AtomicBool,
}

impl Echos {
    pub fn new(config: EchoConfig) -> Self {
        let thunk_mode = config.resolved_thunk_mode();
        info!(
            thunk_mode,
            flush_policy = ?config.flush_policy,
            "echos: thunk mode is {}",
            if thunk_mode { "enabled" } else { "disabled" }
        );

        Self {
            inner: Arc::new(EchosInner {
                queue: EchoQueue::new(config.flush_policy),
                registry: TranslatorRegistry::new(),
                store: RwLock::new(None),
                thunk_mode: AtomicBool::new(thunk_mode),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Host binding
    // -----------------------------------------------------------------------

    /// Bind `store` as the host and return the pipeline filter for it.
    pub fn install<S: Store + 'static>(&self, store: &Arc<S>) -> EchoFilter {
        let weak: Weak<S> = Arc::downgrade(store);
        let weak: Weak<dyn Store> = weak;
        *self
            .inner
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(weak);
        EchoFilter::new(self.clone())
    }

    /// The bound store, if one is installed and still alive.
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Dispatch through the bound store.
    pub fn dispatch(&self, item: impl Into<Item>) -> EchoResult<()> {
        let store = self.store().ok_or(EchoError::NotInstalled)?;
        store.dispatch(item.into());
        Ok(())
    }

    /// A dispatcher that forwards to whatever store is bound when it is called.
    pub fn host_dispatch(&self) -> Dispatch {
        let echos = Arc::downgrade(&self.inner);
        Dispatch::new(move |item: Item| {
            let Some(inner) = echos.upgrade() else {
                warn!("echo context dropped; item discarded");
                return;
            };
            if let Err(e) = (Echos { inner }).dispatch(item) {
                warn!(error = %e, "item discarded");
            }
        })
    }

    /// Full state of the bound store, or `Null` when none is installed.
    pub fn state(&self) -> Value {
        self.store().map(|store| store.state()).unwrap_or(Value::Null)
    }

    pub fn queue(&self) -> &EchoQueue {
        &self.inner.queue
    }

    pub fn registry(&self) -> &TranslatorRegistry {
        &self.inner.registry
    }

    // -----------------------------------------------------------------------
    // Action creators
    // -----------------------------------------------------------------------

    /// A producer that echoes `action` and resolves with it once dispatched.
    pub fn thunk(&self, action: ActionRef) -> Producer {
        Producer::new(EchoThunk {
            queue: self.inner.queue.clone(),
            action,
        })
    }

    /// The wrapped-action form of an echo.
    pub fn squeak(&self, action: ActionRef) -> Item {
        Item::Squeak(Squeak {
            action,
            source: None,
        })
    }

    /// `thunk` or `squeak`, depending on the current mode.
    pub fn echo(&self, action: ActionRef) -> Item {
        if self.thunk_enabled() {
            Item::Producer(self.thunk(action))
        } else {
            self.squeak(action)
        }
    }

    /// Dispatch an echo of `action` now and hand the action back.
    pub fn emit(&self, action: ActionRef) -> EchoResult<ActionRef> {
        self.dispatch(self.echo(action.clone()))?;
        Ok(action)
    }

    /// Open a chain rooted at `root`. A plain action root is echoed.
    pub fn chain(&self, root: impl Into<Item>) -> Connector {
        let root = match root.into() {
            Item::Producer(producer) => producer,
            Item::Action(action) => self.thunk(action),
            Item::Squeak(squeak) => {
                link_action(&squeak.action, squeak.source.as_ref());
                self.thunk(squeak.action)
            }
        };
        Connector::open(self.clone(), root)
    }

    /// Actions waiting for the next flush, or `None` when idle.
    pub fn pending(&self) -> Option<Vec<ActionRef>> {
        self.inner.queue.peek()
    }

    // -----------------------------------------------------------------------
    // Translators
    // -----------------------------------------------------------------------

    pub fn register(
        &self,
        action_type: impl Into<String>,
        translators: impl IntoIterator<Item = Translator>,
        selector: Option<Selector>,
    ) {
        self.inner.registry.register(action_type, translators, selector)
    }

    pub fn unregister(&self, translators: &[Translator], action_type: Option<&str>) -> usize {
        self.inner.registry.unregister(translators, action_type)
    }

    pub fn lookup(&self, action_type: &str) -> Vec<Translator> {
        self.inner.registry.lookup(action_type)
    }

    pub fn translators(&self) -> HashMap<String, Vec<Translator>> {
        self.inner.registry.translators()
    }

    // -----------------------------------------------------------------------
    // Mode
    // -----------------------------------------------------------------------

    pub fn thunk_enabled(&self) -> bool {
        self.inner.thunk_mode.load(Ordering::SeqCst)
    }

    /// Switch to producers. Warns, but still switches, when nothing here can
    /// run them.
    pub fn enable_thunk(&self) -> bool {
        if !runtime_available() {
            warn!("echos: no Tokio runtime is available; producers will not resolve");
        }
        if let Some(store) = self.store() {
            if !store.runs_producers() {
                warn!("echos: the installed store does not run producers");
            }
        }
        self.inner.thunk_mode.store(true, Ordering::SeqCst);
        info!("echos: thunk mode is enabled");
        true
    }

    pub fn disable_thunk(&self) -> bool {
        self.inner.thunk_mode.store(false, Ordering::SeqCst);
        info!("echos: thunk mode is disabled");
        false
    }
}

impl Default for Echos {
    fn default() -> Self {
        Self::new(EchoConfig::default())
    }
}
