//! # Undo/Redo History
//!
//! Tracks inverse patch batches and replays them against the store.
//!
//! ## Design
//!
//! - Every user-originated change is sanitized down to its persisted,
//!   in-scope patches and pushed as one undo entry
//! - Edits landing within the batching window merge into the most recent
//!   entry instead of pushing a new one
//! - Server-originated changes are never undoable
//! - An entry whose entities no longer exist (a remote collaborator
//!   deleted them) is discarded and the search continues downward
//! - Two instances exist, one per editing mode; only the active mode's
//!   instance records, and switching modes resets both

use std::time::{Duration, Instant};

use serde_json::Value;

use easel_model::patch::{self, Patch, PatchOp, PathSegment};
use easel_model::CanvasState;

use crate::command::Command;
use crate::errors::{CommandError, StoreError};
use crate::store::{Change, Dispatch, DispatchOptions, Source, Store};

/// Tuning for one history instance.
#[derive(Debug, Clone, Copy)]
pub struct HistoryOptions {
    /// Maximum entries per stack; the oldest entry is evicted on overflow.
    pub max_depth: usize,
    /// Edits closer together than this merge into one undo entry.
    pub batch_window: Duration,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            max_depth: 100,
            batch_window: Duration::from_millis(500),
        }
    }
}

/// Which slice of the document a history instance cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryScope {
    /// Canvas editing: elements, connectors, groups, document fields.
    Design,
    /// Presentation editing: steps, document fields.
    Flow,
}

impl HistoryScope {
    fn heads(&self) -> &'static [&'static str] {
        match self {
            HistoryScope::Design => &["elements", "connectors", "groups", "document"],
            HistoryScope::Flow => &["steps", "document"],
        }
    }

    /// Reduce a patch to its undoable core: drop anything out of scope or
    /// addressing transient fields, and scrub transient siblings out of
    /// whole-entity values.
    fn sanitize(&self, patch: &Patch) -> Option<Patch> {
        let head = patch.path.first()?.as_str()?;
        if !self.heads().contains(&head) {
            return None;
        }
        if head == "document" {
            let under_data = patch.path.get(1)?.as_str()? == "data";
            return under_data.then(|| patch.clone());
        }
        match patch.path.len() {
            0 | 1 => None,
            2 => {
                let mut scrubbed = patch.clone();
                if let Some(value) = scrubbed.value.as_mut() {
                    scrub_transient(head, value);
                }
                Some(scrubbed)
            }
            _ => {
                let under_data = patch.path[2].as_str() == Some("data");
                under_data.then(|| patch.clone())
            }
        }
    }
}

fn scrub_transient(head: &str, value: &mut Value) {
    let Some(map) = value.as_object_mut() else {
        return;
    };
    match head {
        "elements" => {
            map.insert("drag".to_string(), Value::Null);
            map.insert("resize".to_string(), Value::Null);
        }
        "connectors" => {
            map.insert("preview".to_string(), Value::Null);
        }
        _ => {}
    }
}

/// Observable stack state, refreshed after every push/pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryStatus {
    pub can_undo: bool,
    pub can_redo: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    patches: Vec<Patch>,
    pushed_at: Instant,
}

/// One undo/redo stack pair for one editing mode.
pub struct History {
    scope: HistoryScope,
    options: HistoryOptions,
    undo_stack: Vec<Entry>,
    redo_stack: Vec<Entry>,
}

impl History {
    pub fn new(scope: HistoryScope, options: HistoryOptions) -> Self {
        Self {
            scope,
            options,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
        }
    }

    pub fn design(options: HistoryOptions) -> Self {
        Self::new(HistoryScope::Design, options)
    }

    pub fn flow(options: HistoryOptions) -> Self {
        Self::new(HistoryScope::Flow, options)
    }

    pub fn scope(&self) -> HistoryScope {
        self.scope
    }

    pub fn status(&self) -> HistoryStatus {
        HistoryStatus {
            can_undo: !self.undo_stack.is_empty(),
            can_redo: !self.redo_stack.is_empty(),
        }
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Clear both stacks (called on document-mode switch).
    pub fn reset(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    /// Observe a store change.
    ///
    /// Only `user` changes are recorded; `server` changes are not undoable,
    /// and `undo`/`redo` replays do their own bookkeeping in [`Self::undo`]
    /// and [`Self::redo`].
    pub fn record(&mut self, change: &Change) {
        if change.source != Source::User {
            return;
        }
        let sanitized: Vec<Patch> = change
            .inverse
            .iter()
            .filter_map(|p| self.scope.sanitize(p))
            .collect();
        if sanitized.is_empty() {
            return;
        }

        // A new action invalidates the redo future.
        self.redo_stack.clear();

        let now = Instant::now();
        if let Some(last) = self.undo_stack.last_mut() {
            if now.duration_since(last.pushed_at) < self.options.batch_window {
                // Merge into the previous entry. The newer action's inverse
                // patches apply first during undo; any of them wholly
                // overwritten by an entry patch on the same or a containing
                // path is redundant and dropped.
                let mut merged: Vec<Patch> = sanitized
                    .into_iter()
                    .filter(|newer| {
                        !last
                            .patches
                            .iter()
                            .any(|older| patch::is_prefix_of(&older.path, &newer.path))
                    })
                    .collect();
                merged.append(&mut last.patches);
                last.patches = merged;
                last.pushed_at = now;
                return;
            }
        }

        self.undo_stack.push(Entry {
            patches: sanitized,
            pushed_at: now,
        });
        if self.undo_stack.len() > self.options.max_depth {
            self.undo_stack.remove(0);
        }
    }

    /// Revert the most recent applicable undo entry.
    ///
    /// Entries referencing entities that no longer exist are discarded and
    /// the next entry down is tried. Returns the committed change, if any,
    /// so the caller can persist it.
    pub fn undo(&mut self, store: &mut Store) -> Result<Option<Change>, StoreError> {
        while let Some(entry) = self.undo_stack.pop() {
            if !batch_applies(store.state(), &entry.patches) {
                tracing::debug!(patches = entry.patches.len(), "discarding stale undo entry");
                continue;
            }
            match store.dispatch(
                vec![Command::ApplyPatches(entry.patches)],
                DispatchOptions::undo(),
            ) {
                Ok(Some(change)) => {
                    self.redo_stack.push(Entry {
                        patches: change.inverse.clone(),
                        pushed_at: Instant::now(),
                    });
                    if self.redo_stack.len() > self.options.max_depth {
                        self.redo_stack.remove(0);
                    }
                    return Ok(Some(change));
                }
                Ok(None) => return Ok(None),
                Err(StoreError::Command(CommandError::Patch(e))) => {
                    tracing::warn!(error = %e, "undo entry no longer applies, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Re-apply the most recent applicable redo entry.
    pub fn redo(&mut self, store: &mut Store) -> Result<Option<Change>, StoreError> {
        while let Some(entry) = self.redo_stack.pop() {
            if !batch_applies(store.state(), &entry.patches) {
                tracing::debug!(patches = entry.patches.len(), "discarding stale redo entry");
                continue;
            }
            match store.dispatch(
                vec![Command::ApplyPatches(entry.patches)],
                DispatchOptions::redo(),
            ) {
                Ok(Some(change)) => {
                    self.undo_stack.push(Entry {
                        patches: change.inverse.clone(),
                        pushed_at: Instant::now(),
                    });
                    if self.undo_stack.len() > self.options.max_depth {
                        self.undo_stack.remove(0);
                    }
                    return Ok(Some(change));
                }
                Ok(None) => return Ok(None),
                Err(StoreError::Command(CommandError::Patch(e))) => {
                    tracing::warn!(error = %e, "redo entry no longer applies, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// Whether every entity a batch touches still exists in the model.
///
/// A whole-entity `add` (recreation) is checked by the foreign ids inside
/// its value instead: a step's item/group, a connector's endpoints, an
/// element's group, a group's members.
fn batch_applies(state: &CanvasState, patches: &[Patch]) -> bool {
    patches.iter().all(|p| patch_applies(state, p))
}

fn patch_applies(state: &CanvasState, patch: &Patch) -> bool {
    let Some(head) = patch.path.first().and_then(PathSegment::as_str) else {
        return true;
    };
    if !matches!(head, "elements" | "connectors" | "groups" | "steps") {
        return true;
    }
    let Some(id) = patch.path.get(1).map(PathSegment::as_key) else {
        return true;
    };

    let whole_entity = patch.path.len() == 2;
    if whole_entity && patch.op == PatchOp::Add {
        value_refs_exist(state, head, patch.value.as_ref())
    } else {
        entity_exists(state, head, &id)
    }
}

fn entity_exists(state: &CanvasState, kind: &str, id: &str) -> bool {
    match kind {
        "elements" => state.elements.contains_key(id),
        "connectors" => state.connectors.contains_key(id),
        "groups" => state.groups.contains_key(id),
        "steps" => state.steps.contains_key(id),
        _ => true,
    }
}

fn value_refs_exist(state: &CanvasState, kind: &str, value: Option<&Value>) -> bool {
    let Some(data) = value.and_then(|v| v.get("data")) else {
        return true;
    };
    let str_ref = |field: &str| data.get(field).and_then(Value::as_str).map(str::to_string);
    match kind {
        "elements" => str_ref("group").map_or(true, |g| state.groups.contains_key(&g)),
        "connectors" => {
            str_ref("from").map_or(true, |e| state.elements.contains_key(&e))
                && str_ref("to").map_or(true, |e| state.elements.contains_key(&e))
        }
        "groups" => data
            .get("members")
            .and_then(Value::as_array)
            .map_or(true, |members| {
                members
                    .iter()
                    .all(|m| m.as_str().map_or(true, |m| state.elements.contains_key(m)))
            }),
        "steps" => {
            str_ref("item").map_or(true, |e| state.elements.contains_key(&e))
                && str_ref("group").map_or(true, |g| state.groups.contains_key(&g))
        }
        _ => true,
    }
}
