//! Chains: ordered, causally linked sequences of actions and producers.
//!
//! A chain is a tree of frames held in one arena and addressed by index.
//! Frame 0 belongs to the root producer. Appending a producer opens a child
//! frame, and the connector moves into it, so everything appended afterwards
//! waits for that producer. A frame closes exactly once, when its producer
//! dispatches a terminal action; at that point the first chained item is
//! linked to the terminal action and the frame's items are dispatched in
//! order straight to the host store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::action::{ActionRef, Dispatch, Item, Producer, Thunk};
use crate::context::Echos;
use crate::error::{EchoError, EchoResult};
use crate::link::{link, link_action, link_producer};

enum Chained {
    Action(ActionRef),
    Nested { frame: usize, producer: Producer },
}

impl Chained {
    fn action(&self) -> Option<&ActionRef> {
        match self {
            Chained::Action(action) => Some(action),
            Chained::Nested { .. } => None,
        }
    }

    fn link_to(&mut self, source: &ActionRef) {
        match self {
            Chained::Action(action) => link_action(action, Some(source)),
            Chained::Nested { producer, .. } => {
                *producer = link_producer(producer.clone(), Some(Arc::clone(source)));
            }
        }
    }

    fn to_item(&self) -> Item {
        match self {
            Chained::Action(action) => Item::Action(Arc::clone(action)),
            Chained::Nested { producer, .. } => Item::Producer(producer.clone()),
        }
    }
}

/// `items` is `None` once the frame has closed. `root` is the producer the
/// frame waits on, as it was appended.
struct Frame {
    root: Producer,
    items: Option<Vec<Chained>>,
}

impl Frame {
    fn open(root: Producer) -> Self {
        Self {
            root,
            items: Some(Vec::new()),
        }
    }
}

struct Reactor {
    echos: Echos,
    frames: Mutex<Vec<Frame>>,
}

impl Reactor {
    fn frames(&self) -> MutexGuard<'_, Vec<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self, frame: usize) -> bool {
        self.frames()[frame].items.is_none()
    }

    fn close(&self, frame: usize) -> Option<Vec<Chained>> {
        self.frames()[frame].items.take()
    }

    /// The action an item appended to `frame` would follow, if any.
    fn prior_action(&self, frame: usize) -> EchoResult<Option<ActionRef>> {
        let frames = self.frames();
        let items = frames[frame].items.as_ref().ok_or(EchoError::ChainClosed)?;
        Ok(items.last().and_then(Chained::action).cloned())
    }

    /// Wrap `inner` so its dispatches drive `frame`.
    fn extend(self: &Arc<Self>, frame: usize, inner: Producer) -> Producer {
        Producer::wrapping(
            &inner,
            FrameThunk {
                reactor: Arc::clone(self),
                frame,
                inner: inner.clone(),
            },
        )
    }

    fn materialize(self: &Arc<Self>, chained: Chained) -> Item {
        match chained {
            Chained::Action(action) => Item::Action(action),
            Chained::Nested { frame, producer } => Item::Producer(self.extend(frame, producer)),
        }
    }

    fn deliver(self: &Arc<Self>, frame: usize, item: Item, forward: &Dispatch) {
        let terminal = match &item {
            Item::Producer(producer) => {
                // Resolved to another producer: its terminal action closes this frame.
                let continued = if self.is_closed(frame) {
                    producer.clone()
                } else {
                    self.extend(frame, producer.clone())
                };
                forward.call(continued);
                return;
            }
            Item::Action(action) => Arc::clone(action),
            Item::Squeak(squeak) => Arc::clone(&squeak.action),
        };

        let Some(mut chained) = self.close(frame) else {
            forward.call(item);
            return;
        };

        if let Item::Squeak(squeak) = &item {
            link_action(&squeak.action, squeak.source.as_ref());
        }
        if let Some(first) = chained.first_mut() {
            first.link_to(&terminal);
        }

        debug!(
            frame,
            action_type = %terminal.action_type,
            chained = chained.len(),
            "chain frame closed"
        );

        forward.call(terminal);
        for next in chained {
            if let Err(e) = self.echos.dispatch(self.materialize(next)) {
                warn!(error = %e, frame, "chained item dropped");
            }
        }
    }
}

struct FrameThunk {
    reactor: Arc<Reactor>,
    frame: usize,
    inner: Producer,
}

#[async_trait]
impl Thunk for FrameThunk {
    async fn run(&self, dispatch: Dispatch) -> Result<ActionRef> {
        let reactor = Arc::clone(&self.reactor);
        let frame = self.frame;
        let intercept = Dispatch::new(move |item: Item| reactor.deliver(frame, item, &dispatch));
        self.inner.run(intercept).await
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Appends to a chain. Each append consumes the connector and returns the
/// one to use next.
///
/// A connector whose frame has closed is a terminator: appends are rejected
/// with a warning and return another terminator.
pub struct Connector {
    reactor: Arc<Reactor>,
    frame: Option<usize>,
}

impl Connector {
    pub(crate) fn open(echos: Echos, root: Producer) -> Self {
        let reactor = Arc::new(Reactor {
            echos,
            frames: Mutex::new(Vec::new()),
        });
        let root = reactor.extend(0, root);
        reactor.frames().push(Frame::open(root));
        Self {
            reactor,
            frame: Some(0),
        }
    }

    /// The wrapped root producer. Dispatch this to start the chain.
    pub fn root(&self) -> Producer {
        self.reactor.frames()[0].root.clone()
    }

    /// Dispatch the root producer through the bound store.
    pub fn dispatch(&self) -> EchoResult<()> {
        self.reactor.echos.dispatch(self.root())
    }

    pub fn is_closed(&self) -> bool {
        self.frame.map_or(true, |frame| self.reactor.is_closed(frame))
    }

    /// Append `item`, warning instead of failing on a closed chain.
    pub fn connect(self, item: impl Into<Item>) -> Connector {
        let reactor = Arc::clone(&self.reactor);
        match self.try_connect(item) {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "late chain append rejected");
                Connector {
                    reactor,
                    frame: None,
                }
            }
        }
    }

    pub fn try_connect(self, item: impl Into<Item>) -> EchoResult<Connector> {
        let frame = self.frame.ok_or(EchoError::ChainClosed)?;
        let item = match item.into() {
            Item::Squeak(squeak) => {
                link_action(&squeak.action, squeak.source.as_ref());
                Item::Action(squeak.action)
            }
            other => other,
        };
        let prior = self.reactor.prior_action(frame)?;
        match link(item, prior.as_ref()) {
            Item::Producer(producer) => self.append_producer(frame, producer),
            Item::Action(action) => self.append_action(frame, action),
            Item::Squeak(squeak) => self.append_action(frame, squeak.action),
        }
    }

    /// Stop appending. Returns the last item appended to the current frame,
    /// or that frame's root producer when nothing was appended to it. A
    /// terminator ends at the chain's root.
    pub fn end(self) -> Item {
        let frames = self.reactor.frames();
        let frame = &frames[self.frame.unwrap_or(0)];
        let ended = match frame.items.as_ref().and_then(|items| items.last()) {
            Some(last) if self.frame.is_some() => last.to_item(),
            _ => Item::Producer(frame.root.clone()),
        };
        ended
    }

    fn append_action(self, frame: usize, action: ActionRef) -> EchoResult<Connector> {
        {
            let mut frames = self.reactor.frames();
            let items = frames[frame].items.as_mut().ok_or(EchoError::ChainClosed)?;
            debug!(frame, action_type = %action.action_type, "action chained");
            items.push(Chained::Action(action));
        }
        Ok(self)
    }

    fn append_producer(self, frame: usize, producer: Producer) -> EchoResult<Connector> {
        let nested = {
            let mut frames = self.reactor.frames();
            let nested = frames.len();
            let items = frames[frame].items.as_mut().ok_or(EchoError::ChainClosed)?;
            debug!(frame, nested, producer = %producer.identity(), "producer chained");
            items.push(Chained::Nested {
                frame: nested,
                producer: producer.clone(),
            });
            frames.push(Frame::open(producer));
            nested
        };
        Ok(Connector {
            frame: Some(nested),
            ..self
        })
    }
}
