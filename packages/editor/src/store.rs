//! # Store
//!
//! Owns one immutable state snapshot and mutates it only through command
//! dispatch. Every successful dispatch produces exactly one combined
//! forward + inverse patch batch, derived by diffing the serialized state
//! before and after the draft was mutated.
//!
//! Dispatch is serialized by construction: it takes `&mut self`, so no
//! command can ever observe a half-applied draft from another dispatch, and
//! listeners (which only receive shared references) cannot re-enter it.

use serde_json::Value;

use easel_model::patch::{self, Patch, PatchPair, PathSegment};
use easel_model::CanvasState;

use crate::command::Command;
use crate::errors::StoreError;

/// Where a dispatched change originated. Downstream routing keys off this:
/// user edits are recorded for undo and forwarded to the server; undo/redo
/// replays are forwarded but not re-recorded; server-originated changes are
/// neither recorded nor forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    User,
    Undo,
    Redo,
    Server,
}

/// Options for one dispatch call.
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub source: Source,
}

impl DispatchOptions {
    pub fn user() -> Self {
        Self {
            source: Source::User,
        }
    }

    pub fn undo() -> Self {
        Self {
            source: Source::Undo,
        }
    }

    pub fn redo() -> Self {
        Self {
            source: Source::Redo,
        }
    }

    pub fn server() -> Self {
        Self {
            source: Source::Server,
        }
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::user()
    }
}

/// One committed state change: the forward batch that produced it and the
/// inverse batch that reverts it.
#[derive(Debug, Clone)]
pub struct Change {
    pub source: Source,
    pub forward: Vec<Patch>,
    pub inverse: Vec<Patch>,
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&CanvasState, &Change)>;

struct Subscription {
    id: SubscriptionId,
    /// When set, the listener only fires for changes touching this path
    /// (the path itself, an ancestor, or a descendant of it).
    scope: Option<Vec<PathSegment>>,
    hook: Listener,
}

/// The dispatch seam: implemented by [`Store`] directly and by wrappers
/// that route changes onward (undo recording, server forwarding). Narrowed
/// views are generic over it, so components can hold whichever end of the
/// pipeline they are given.
pub trait Dispatch {
    type Error;

    fn dispatch(
        &mut self,
        commands: Vec<Command>,
        options: DispatchOptions,
    ) -> Result<Option<Change>, Self::Error>;
}

/// The document store.
pub struct Store {
    state: CanvasState,
    /// Serialized mirror of `state`, kept in lockstep; diffing against it
    /// yields each dispatch's patch batch.
    shadow: Value,
    listeners: Vec<Subscription>,
    next_subscription: u64,
}

impl Store {
    pub fn new(initial: CanvasState) -> Result<Self, StoreError> {
        let shadow = serde_json::to_value(&initial)?;
        Ok(Self {
            state: initial,
            shadow,
            listeners: Vec::new(),
            next_subscription: 0,
        })
    }

    /// Current snapshot. Read-only; only dispatch produces a new one.
    pub fn state(&self) -> &CanvasState {
        &self.state
    }

    /// Read the serialized tree at a path (the whole tree for an empty
    /// path).
    pub fn value_at(&self, path: &[PathSegment]) -> Option<&Value> {
        patch::resolve(&self.shadow, path)
    }

    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&CanvasState, &Change) + 'static,
    ) -> SubscriptionId {
        self.push_subscription(None, Box::new(listener))
    }

    /// Subscribe to changes touching one subtree only.
    pub fn subscribe_path(
        &mut self,
        path: Vec<PathSegment>,
        listener: impl FnMut(&CanvasState, &Change) + 'static,
    ) -> SubscriptionId {
        self.push_subscription(Some(path), Box::new(listener))
    }

    fn push_subscription(
        &mut self,
        scope: Option<Vec<PathSegment>>,
        hook: Listener,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push(Subscription { id, scope, hook });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|s| s.id != id);
        self.listeners.len() != before
    }
}

/// Whether a change's patches touch a scoped path: the path itself, an
/// ancestor of it, or anything beneath it.
fn touches(scope: &[PathSegment], change: &Change) -> bool {
    change
        .forward
        .iter()
        .any(|p| patch::is_prefix_of(scope, &p.path) || patch::is_prefix_of(&p.path, scope))
}

impl Dispatch for Store {
    type Error = StoreError;

    /// Apply all commands against a single draft and commit the result as
    /// one patch batch.
    ///
    /// A command that fails aborts the whole call: the draft is discarded,
    /// no patches are emitted, no listener runs, and the error propagates.
    /// A dispatch with zero effective patches is a no-op (`Ok(None)`).
    fn dispatch(
        &mut self,
        commands: Vec<Command>,
        options: DispatchOptions,
    ) -> Result<Option<Change>, StoreError> {
        let mut draft = self.state.clone();
        for command in &commands {
            command.apply(&mut draft)?;
        }

        let new_shadow = serde_json::to_value(&draft)?;
        // A lone snapshot swap is reported as one root replace; positional
        // patches cannot meaningfully describe a whole-tree replacement.
        let pair = if matches!(commands.as_slice(), [Command::ReplaceState(_)]) {
            if self.shadow == new_shadow {
                PatchPair::default()
            } else {
                PatchPair {
                    forward: vec![Patch::replace(Vec::new(), new_shadow.clone())],
                    inverse: vec![Patch::replace(Vec::new(), self.shadow.clone())],
                }
            }
        } else {
            patch::diff(&self.shadow, &new_shadow)
        };
        if pair.is_empty() {
            return Ok(None);
        }

        self.state = draft;
        self.shadow = new_shadow;

        let change = Change {
            source: options.source,
            forward: pair.forward,
            inverse: pair.inverse,
        };
        for subscription in &mut self.listeners {
            let in_scope = subscription
                .scope
                .as_deref()
                .map_or(true, |scope| touches(scope, &change));
            if in_scope {
                (subscription.hook)(&self.state, &change);
            }
        }
        Ok(Some(change))
    }
}
