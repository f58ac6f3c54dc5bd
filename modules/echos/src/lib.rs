//! Deferred dispatch and causal chaining for an action pipeline.
//!
//! - Echoes: actions queued now and dispatched together on a later turn of
//!   the runtime, one flush per batch.
//! - Chains: ordered sequences of actions and producers where each item waits
//!   for its predecessor and is stamped with it as `source`.
//! - Translators: pure functions, keyed by action type, that turn a
//!   dispatched action into zero, one or many echoes.
//!
//! Everything hangs off an [`Echos`] context, installed into a host
//! [`Store`] as a pass-through filter.

pub mod action;
pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod link;
pub mod queue;
pub mod registry;
pub mod store;

pub use action::{
    Action, ActionRef, Dispatch, Item, Producer, ProducerId, Squeak, Thunk, SQUEAK_ACTION_TYPE,
};
pub use chain::Connector;
pub use config::{load_config, EchoConfig, FlushPolicy};
pub use context::Echos;
pub use error::{EchoError, EchoResult};
pub use filter::EchoFilter;
pub use link::{link, link_action, link_producer};
pub use queue::{Echo, EchoQueue};
pub use registry::{Selector, Translation, Translator, TranslatorRegistry};
pub use store::{MemoryStore, Reducer, Store};
