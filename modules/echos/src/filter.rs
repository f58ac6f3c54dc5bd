//! The pipeline filter installed in front of the host store's reducers.
//!
//! Squeaks are unwrapped and queued, never forwarded. Every other action is
//! run through its translators, whose output is queued with the action as
//! source, and is then forwarded unchanged.

use tracing::debug;

use crate::action::{ActionRef, Dispatch, Item};
use crate::context::Echos;
use crate::registry::Translation;

#[derive(Clone)]
pub struct EchoFilter {
    echos: Echos,
}

impl EchoFilter {
    pub(crate) fn new(echos: Echos) -> Self {
        Self { echos }
    }

    /// Build the `(next) -> (item)` handler for this filter.
    pub fn wrap(&self, next: Dispatch) -> Dispatch {
        let filter = self.clone();
        Dispatch::new(move |item: Item| filter.handle(item, &next))
    }

    pub fn handle(&self, item: Item, next: &Dispatch) {
        match item {
            Item::Squeak(squeak) => {
                self.echos.queue().enqueue(
                    &self.echos.host_dispatch(),
                    squeak.action,
                    squeak.source.as_ref(),
                    None,
                );
            }
            Item::Action(action) => {
                self.translate(&action);
                next.call(Item::Action(action));
            }
            producer @ Item::Producer(_) => next.call(producer),
        }
    }

    fn translate(&self, action: &ActionRef) {
        let translators = self.echos.lookup(&action.action_type);
        if translators.is_empty() {
            return;
        }

        let state = self.echos.state();
        let host = self.echos.host_dispatch();
        let queue = self.echos.queue();

        for translator in &translators {
            match translator.translate(action, &state) {
                Translation::Nothing => {}
                Translation::One(echo) => queue.enqueue(&host, echo, Some(action), None),
                Translation::Many(echoes) => queue.enqueue_all(&host, echoes, Some(action)),
            }
        }

        debug!(
            action_type = %action.action_type,
            translators = translators.len(),
            "action translated"
        );
    }
}
