//! Actions, producers and the items that flow through a dispatch pipeline.
//!
//! An [`Action`] is shared by reference ([`ActionRef`]) so causal metadata
//! stamped anywhere in the pipeline is visible to every holder. A
//! [`Producer`] is an async thunk with an explicit identity; wrapping a
//! producer keeps the identity of the one it wraps.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type reported by squeak-wrapped echoes.
pub const SQUEAK_ACTION_TYPE: &str = "echos/SQUEAK";

pub type ActionRef = Arc<Action>;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A dispatched fact. `source` and `owning_thunk` are set at most once.
pub struct Action {
    pub id: Uuid,
    pub action_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    source: OnceLock<ActionRef>,
    owning_thunk: OnceLock<ProducerId>,
}

impl Action {
    pub fn new(action_type: impl Into<String>, payload: serde_json::Value) -> ActionRef {
        Arc::new(Self {
            id: Uuid::new_v4(),
            action_type: action_type.into(),
            payload,
            created_at: Utc::now(),
            source: OnceLock::new(),
            owning_thunk: OnceLock::new(),
        })
    }

    /// An action with a null payload.
    pub fn named(action_type: impl Into<String>) -> ActionRef {
        Self::new(action_type, serde_json::Value::Null)
    }

    /// The action whose resolution causally precedes this one.
    pub fn source(&self) -> Option<&ActionRef> {
        self.source.get()
    }

    /// Identity of the producer that ultimately produced this action.
    pub fn owning_thunk(&self) -> Option<ProducerId> {
        self.owning_thunk.get().copied()
    }

    /// Same action, compared by id.
    pub fn is(&self, other: &Action) -> bool {
        self.id == other.id
    }

    /// True if `source` is set and is `other`.
    pub fn caused_by(&self, other: &Action) -> bool {
        self.source().is_some_and(|source| source.is(other))
    }

    /// Returns false if a source was already set or `source` is this action.
    pub(crate) fn stamp_source(&self, source: &ActionRef) -> bool {
        if source.is(self) {
            return false;
        }
        self.source.set(Arc::clone(source)).is_ok()
    }

    pub(crate) fn stamp_owner(&self, owner: ProducerId) -> bool {
        self.owning_thunk.set(owner).is_ok()
    }

    /// Walk the `source` links, nearest predecessor first.
    pub fn ancestry(&self) -> Vec<ActionRef> {
        let mut seen = HashSet::from([self.id]);
        let mut chain = Vec::new();
        let mut cursor = self.source().cloned();
        while let Some(action) = cursor {
            if !seen.insert(action.id) {
                break;
            }
            cursor = action.source().cloned();
            chain.push(action);
        }
        chain
    }

    /// Flat JSON view for logs and admin output. Sources appear by id.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "type": self.action_type,
            "payload": self.payload,
            "created_at": self.created_at,
            "source": self.source().map(|s| s.id),
            "owning_thunk": self.owning_thunk(),
        })
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("action_type", &self.action_type)
            .field("payload", &self.payload)
            .field("source", &self.source().map(|s| s.id))
            .field("owning_thunk", &self.owning_thunk())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A dispatch callback. Cheap to clone.
#[derive(Clone)]
pub struct Dispatch(Arc<dyn Fn(Item) + Send + Sync>);

impl Dispatch {
    pub fn new(f: impl Fn(Item) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// A dispatcher that drops everything.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn call(&self, item: impl Into<Item>) {
        (self.0)(item.into())
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dispatch(..)")
    }
}

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerId(Uuid);

impl ProducerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Async action producer. Dispatches through the callback it is given and
/// resolves to its terminal action.
#[async_trait]
pub trait Thunk: Send + Sync {
    async fn run(&self, dispatch: Dispatch) -> Result<ActionRef>;
}

struct FnThunk<F>(F);

#[async_trait]
impl<F, Fut> Thunk for FnThunk<F>
where
    F: Fn(Dispatch) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionRef>> + Send + 'static,
{
    async fn run(&self, dispatch: Dispatch) -> Result<ActionRef> {
        (self.0)(dispatch).await
    }
}

/// A thunk together with its identity.
///
/// `id` names this particular value; `identity` names the original producer
/// and survives any number of wrappers.
#[derive(Clone)]
pub struct Producer {
    id: ProducerId,
    identity: ProducerId,
    thunk: Arc<dyn Thunk>,
}

impl Producer {
    pub fn new(thunk: impl Thunk + 'static) -> Self {
        let id = ProducerId::new();
        Self {
            id,
            identity: id,
            thunk: Arc::new(thunk),
        }
    }

    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Dispatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionRef>> + Send + 'static,
    {
        Self::new(FnThunk(f))
    }

    /// A new producer standing in for `inner`, sharing its identity.
    pub(crate) fn wrapping(inner: &Producer, thunk: impl Thunk + 'static) -> Self {
        Self {
            id: ProducerId::new(),
            identity: inner.identity,
            thunk: Arc::new(thunk),
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn identity(&self) -> ProducerId {
        self.identity
    }

    pub fn is_wrapped(&self) -> bool {
        self.id != self.identity
    }

    /// Identity comparison that sees through wrapping.
    pub fn is(&self, other: &Producer) -> bool {
        self.identity == other.identity
    }

    pub async fn run(&self, dispatch: Dispatch) -> Result<ActionRef> {
        self.thunk.run(dispatch).await
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// The wrapped-action form of an echo, used when producers are disabled.
#[derive(Debug, Clone)]
pub struct Squeak {
    pub action: ActionRef,
    pub source: Option<ActionRef>,
}

/// Anything a store can be asked to dispatch.
#[derive(Debug, Clone)]
pub enum Item {
    Action(ActionRef),
    Producer(Producer),
    Squeak(Squeak),
}

impl Item {
    /// The type key seen by the pipeline. Producers have none.
    pub fn action_type(&self) -> Option<&str> {
        match self {
            Item::Action(action) => Some(&action.action_type),
            Item::Squeak(_) => Some(SQUEAK_ACTION_TYPE),
            Item::Producer(_) => None,
        }
    }

    /// The concrete action carried by this item, unwrapping squeaks.
    pub fn concrete_action(&self) -> Option<&ActionRef> {
        match self {
            Item::Action(action) => Some(action),
            Item::Squeak(squeak) => Some(&squeak.action),
            Item::Producer(_) => None,
        }
    }

    pub fn as_producer(&self) -> Option<&Producer> {
        match self {
            Item::Producer(producer) => Some(producer),
            _ => None,
        }
    }

    pub fn is_producer(&self) -> bool {
        matches!(self, Item::Producer(_))
    }
}

impl From<ActionRef> for Item {
    fn from(action: ActionRef) -> Self {
        Item::Action(action)
    }
}

impl From<&ActionRef> for Item {
    fn from(action: &ActionRef) -> Self {
        Item::Action(Arc::clone(action))
    }
}

impl From<Producer> for Item {
    fn from(producer: Producer) -> Self {
        Item::Producer(producer)
    }
}

impl From<&Producer> for Item {
    fn from(producer: &Producer) -> Self {
        Item::Producer(producer.clone())
    }
}

impl From<Squeak> for Item {
    fn from(squeak: Squeak) -> Self {
        Item::Squeak(squeak)
    }
}
