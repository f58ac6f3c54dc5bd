//! Translators keyed by action type.
//!
//! A translator maps an incoming action (and the store state, optionally
//! narrowed by a selector) to zero, one or many follow-up actions. Lists are
//! append-only on register and compacted in place on unregister.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use uuid::Uuid;

use crate::action::ActionRef;

pub type Selector = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

type TranslateFn = Arc<dyn Fn(&ActionRef, &Value) -> Translation + Send + Sync>;

/// Output of a translator.
#[derive(Debug, Default)]
pub enum Translation {
    #[default]
    Nothing,
    One(ActionRef),
    Many(Vec<ActionRef>),
}

impl From<ActionRef> for Translation {
    fn from(action: ActionRef) -> Self {
        Translation::One(action)
    }
}

impl From<Option<ActionRef>> for Translation {
    fn from(action: Option<ActionRef>) -> Self {
        action.map_or(Translation::Nothing, Translation::One)
    }
}

impl From<Vec<ActionRef>> for Translation {
    fn from(actions: Vec<ActionRef>) -> Self {
        Translation::Many(actions)
    }
}

impl From<()> for Translation {
    fn from(_: ()) -> Self {
        Translation::Nothing
    }
}

/// A pure translation function with an identity and an optional selector.
#[derive(Clone)]
pub struct Translator {
    id: Uuid,
    translate: TranslateFn,
    selector: Option<Selector>,
}

impl Translator {
    pub fn new<F, T>(f: F) -> Self
    where
        F: Fn(&ActionRef, &Value) -> T + Send + Sync + 'static,
        T: Into<Translation>,
    {
        let translate: TranslateFn =
            Arc::new(move |action: &ActionRef, state: &Value| f(action, state).into());
        Self {
            id: Uuid::new_v4(),
            translate,
            selector: None,
        }
    }

    pub fn with_selector(
        mut self,
        selector: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn has_selector(&self) -> bool {
        self.selector.is_some()
    }

    /// Same translator, regardless of selector.
    pub fn is(&self, other: &Translator) -> bool {
        self.id == other.id
    }

    /// Run against the full store state, narrowing it first if a selector is set.
    pub fn translate(&self, action: &ActionRef, state: &Value) -> Translation {
        match &self.selector {
            Some(select) => (self.translate)(action, &select(state)),
            None => (self.translate)(action, state),
        }
    }
}

impl fmt::Debug for Translator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translator")
            .field("id", &self.id)
            .field("has_selector", &self.has_selector())
            .finish()
    }
}

#[derive(Default)]
pub struct TranslatorRegistry {
    map: RwLock<HashMap<String, Vec<Translator>>>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Translator>>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Translator>>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append translators under `action_type`. A selector, if given, is
    /// attached to every translator registered by this call.
    pub fn register(
        &self,
        action_type: impl Into<String>,
        translators: impl IntoIterator<Item = Translator>,
        selector: Option<Selector>,
    ) {
        let mut map = self.write();
        let list = map.entry(action_type.into()).or_default();
        for mut translator in translators {
            if let Some(selector) = &selector {
                translator.selector = Some(Arc::clone(selector));
            }
            list.push(translator);
        }
    }

    /// Remove translators by identity from one type's list, or from every
    /// list when `action_type` is `None`. Returns how many entries went.
    pub fn unregister(&self, translators: &[Translator], action_type: Option<&str>) -> usize {
        let mut map = self.write();
        let mut removed = 0;
        let mut compact = |list: &mut Vec<Translator>| {
            let before = list.len();
            list.retain(|entry| !translators.iter().any(|target| target.is(entry)));
            removed += before - list.len();
        };

        match action_type {
            Some(action_type) => {
                if let Some(list) = map.get_mut(action_type) {
                    compact(list);
                }
            }
            None => map.values_mut().for_each(compact),
        }
        removed
    }

    /// Translators for `action_type`, in registration order.
    pub fn lookup(&self, action_type: &str) -> Vec<Translator> {
        self.read().get(action_type).cloned().unwrap_or_default()
    }

    /// Snapshot of the whole map.
    pub fn translators(&self) -> HashMap<String, Vec<Translator>> {
        self.read().clone()
    }
}
