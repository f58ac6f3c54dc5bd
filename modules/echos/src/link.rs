//! Source linking: stamping causal metadata on actions and producers.
//!
//! Stamping never overwrites. A plain action is stamped in place; a producer
//! is wrapped so that every concrete action it dispatches is stamped on the
//! way out, with `owning_thunk` set to the original producer's identity.

use anyhow::Result;
use async_trait::async_trait;

use crate::action::{ActionRef, Dispatch, Item, Producer, Thunk};

/// Link `item` to its causal predecessor.
pub fn link(item: Item, source: Option<&ActionRef>) -> Item {
    match item {
        Item::Producer(producer) => Item::Producer(link_producer(producer, source.cloned())),
        other => {
            if let Some(action) = other.concrete_action() {
                link_action(action, source);
            }
            other
        }
    }
}

/// Stamp `source` on `action` unless one is already set.
pub fn link_action(action: &ActionRef, source: Option<&ActionRef>) {
    if let Some(source) = source {
        action.stamp_source(source);
    }
}

/// Wrap `producer` so its dispatched actions carry `source` and its identity.
pub fn link_producer(producer: Producer, source: Option<ActionRef>) -> Producer {
    Producer::wrapping(
        &producer,
        Linked {
            inner: producer.clone(),
            source,
        },
    )
}

struct Linked {
    inner: Producer,
    source: Option<ActionRef>,
}

#[async_trait]
impl Thunk for Linked {
    async fn run(&self, dispatch: Dispatch) -> Result<ActionRef> {
        let owner = self.inner.identity();
        let source = self.source.clone();
        let stamped = Dispatch::new(move |item: Item| {
            if let Some(action) = item.concrete_action() {
                action.stamp_owner(owner);
                link_action(action, source.as_ref());
            }
            dispatch.call(item);
        });
        self.inner.run(stamped).await
    }
}
