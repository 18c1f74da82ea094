//! # Commands
//!
//! High-level semantic operations on the canvas document.
//!
//! ## Design Principles
//!
//! 1. **Intent-preserving**: each command represents a semantic operation
//! 2. **Validated**: every command checks structural constraints before
//!    mutating its draft
//! 3. **Atomic**: a command that fails aborts the whole dispatch; the
//!    draft is discarded and no patches are emitted
//! 4. **Cross-cutting cleanup**: deleting an entity also repairs every id
//!    that referenced it (connectors, group membership, step targets,
//!    selection), so the state never holds a dangling reference
//!
//! ## Mutation Semantics
//!
//! ### Merge
//! - A pre-built data object merged into the matching entity's DTO
//! - Atomic replacement per field (not character diff), last write wins
//! - The id field is immutable; a merge that tries to change it fails
//!
//! ### Delete
//! - Removes the entity and detaches every reference to it
//! - Concurrent edits of deleted entities fail and are dropped upstream

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use easel_model::patch::{self, Patch};
use easel_model::{
    Bounds, CanvasState, Collaborator, Connector, DragPreview, EditMode, Element, Group, Point,
    Selection, Step, Viewport,
};

use crate::errors::CommandError;

/// Semantic commands over [`CanvasState`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // Elements
    CreateElement(Element),
    /// Merge a data object into the element's DTO.
    MergeElement { id: String, data: Value },
    DeleteElements(Vec<String>),
    SetElementBounds { id: String, bounds: Bounds },
    BeginDrag { id: String, at: Point },
    UpdateDrag { id: String, at: Point },
    EndDrag { id: String },
    SetResizePreview { id: String, bounds: Option<Bounds> },

    // Connectors
    CreateConnector(Connector),
    MergeConnector { id: String, data: Value },
    DeleteConnectors(Vec<String>),
    SetConnectorPreview { id: String, points: Option<Vec<Point>> },

    // Groups
    CreateGroup(Group),
    MergeGroup { id: String, data: Value },
    /// Dissolve a group: members survive with their back-reference cleared.
    DeleteGroup { id: String },

    // Steps
    CreateStep(Step),
    MergeStep { id: String, data: Value },
    DeleteSteps(Vec<String>),
    MoveStep { id: String, order: u32 },

    // Document
    MergeDocument { data: Value },
    SetTitle(String),
    SetTheme(String),
    SetBackground(String),
    SetSelection(Selection),
    SetViewport(Viewport),
    SetMode(EditMode),
    AdjustPendingPushes(i32),

    // Collaborators (ephemeral)
    UpsertCollaborator(Collaborator),
    SetCollaboratorCursor { id: String, cursor: Point },
    RemoveCollaborator(String),

    // Tree-level
    /// Swap in a whole new snapshot (initial load, refresh reconcile).
    ReplaceState(Box<CanvasState>),
    /// Apply a raw patch batch (undo/redo replay, field-level remote edits).
    ApplyPatches(Vec<Patch>),
}

impl Command {
    /// Short command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateElement(_) => "create_element",
            Command::MergeElement { .. } => "merge_element",
            Command::DeleteElements(_) => "delete_elements",
            Command::SetElementBounds { .. } => "set_element_bounds",
            Command::BeginDrag { .. } => "begin_drag",
            Command::UpdateDrag { .. } => "update_drag",
            Command::EndDrag { .. } => "end_drag",
            Command::SetResizePreview { .. } => "set_resize_preview",
            Command::CreateConnector(_) => "create_connector",
            Command::MergeConnector { .. } => "merge_connector",
            Command::DeleteConnectors(_) => "delete_connectors",
            Command::SetConnectorPreview { .. } => "set_connector_preview",
            Command::CreateGroup(_) => "create_group",
            Command::MergeGroup { .. } => "merge_group",
            Command::DeleteGroup { .. } => "delete_group",
            Command::CreateStep(_) => "create_step",
            Command::MergeStep { .. } => "merge_step",
            Command::DeleteSteps(_) => "delete_steps",
            Command::MoveStep { .. } => "move_step",
            Command::MergeDocument { .. } => "merge_document",
            Command::SetTitle(_) => "set_title",
            Command::SetTheme(_) => "set_theme",
            Command::SetBackground(_) => "set_background",
            Command::SetSelection(_) => "set_selection",
            Command::SetViewport(_) => "set_viewport",
            Command::SetMode(_) => "set_mode",
            Command::AdjustPendingPushes(_) => "adjust_pending_pushes",
            Command::UpsertCollaborator(_) => "upsert_collaborator",
            Command::SetCollaboratorCursor { .. } => "set_collaborator_cursor",
            Command::RemoveCollaborator(_) => "remove_collaborator",
            Command::ReplaceState(_) => "replace_state",
            Command::ApplyPatches(_) => "apply_patches",
        }
    }

    /// Apply the command to a draft of the state tree.
    pub fn apply(&self, draft: &mut CanvasState) -> Result<(), CommandError> {
        match self {
            Command::CreateElement(element) => create_element(draft, element),
            Command::MergeElement { id, data } => merge_element(draft, id, data),
            Command::DeleteElements(ids) => delete_elements(draft, ids),
            Command::SetElementBounds { id, bounds } => {
                let el = draft
                    .elements
                    .get_mut(id)
                    .ok_or_else(|| CommandError::ElementNotFound(id.clone()))?;
                el.data.bounds = *bounds;
                Ok(())
            }
            Command::BeginDrag { id, at } => {
                let el = draft
                    .elements
                    .get_mut(id)
                    .ok_or_else(|| CommandError::ElementNotFound(id.clone()))?;
                el.drag = Some(DragPreview {
                    start: *at,
                    current: *at,
                });
                Ok(())
            }
            Command::UpdateDrag { id, at } => {
                let el = draft
                    .elements
                    .get_mut(id)
                    .ok_or_else(|| CommandError::ElementNotFound(id.clone()))?;
                let drag = el
                    .drag
                    .as_mut()
                    .ok_or_else(|| CommandError::NoActiveDrag(id.clone()))?;
                drag.current = *at;
                Ok(())
            }
            Command::EndDrag { id } => {
                let el = draft
                    .elements
                    .get_mut(id)
                    .ok_or_else(|| CommandError::ElementNotFound(id.clone()))?;
                el.drag = None;
                Ok(())
            }
            Command::SetResizePreview { id, bounds } => {
                let el = draft
                    .elements
                    .get_mut(id)
                    .ok_or_else(|| CommandError::ElementNotFound(id.clone()))?;
                el.resize = *bounds;
                Ok(())
            }
            Command::CreateConnector(connector) => create_connector(draft, connector),
            Command::MergeConnector { id, data } => merge_connector(draft, id, data),
            Command::DeleteConnectors(ids) => delete_connectors(draft, ids),
            Command::SetConnectorPreview { id, points } => {
                let c = draft
                    .connectors
                    .get_mut(id)
                    .ok_or_else(|| CommandError::ConnectorNotFound(id.clone()))?;
                c.preview = points.clone();
                Ok(())
            }
            Command::CreateGroup(group) => create_group(draft, group),
            Command::MergeGroup { id, data } => merge_group(draft, id, data),
            Command::DeleteGroup { id } => delete_group(draft, id),
            Command::CreateStep(step) => create_step(draft, step),
            Command::MergeStep { id, data } => merge_step(draft, id, data),
            Command::DeleteSteps(ids) => delete_steps(draft, ids),
            Command::MoveStep { id, order } => move_step(draft, id, *order),
            Command::MergeDocument { data } => {
                let current = draft.document.data.clone();
                draft.document.data = merge_dto(&current, data, &current.id)?;
                Ok(())
            }
            Command::SetTitle(title) => {
                draft.document.data.title = title.clone();
                Ok(())
            }
            Command::SetTheme(theme) => {
                draft.document.data.theme = theme.clone();
                Ok(())
            }
            Command::SetBackground(background) => {
                draft.document.data.background = background.clone();
                Ok(())
            }
            Command::SetSelection(selection) => set_selection(draft, selection),
            Command::SetViewport(viewport) => {
                draft.document.viewport = viewport.clone();
                Ok(())
            }
            Command::SetMode(mode) => {
                draft.document.mode = *mode;
                Ok(())
            }
            Command::AdjustPendingPushes(delta) => {
                let pending = &mut draft.document.pending_pushes;
                *pending = if *delta >= 0 {
                    pending.saturating_add(*delta as u32)
                } else {
                    pending.saturating_sub(delta.unsigned_abs())
                };
                Ok(())
            }
            Command::UpsertCollaborator(collaborator) => {
                draft
                    .document
                    .collaborators
                    .insert(collaborator.id.clone(), collaborator.clone());
                Ok(())
            }
            // A cursor for a departed collaborator is stale, not an error.
            Command::SetCollaboratorCursor { id, cursor } => {
                if let Some(c) = draft.document.collaborators.get_mut(id) {
                    c.cursor = *cursor;
                }
                Ok(())
            }
            Command::RemoveCollaborator(id) => {
                draft.document.collaborators.remove(id);
                Ok(())
            }
            Command::ReplaceState(state) => {
                *draft = (**state).clone();
                Ok(())
            }
            Command::ApplyPatches(patches) => apply_patches(draft, patches),
        }
    }
}

fn create_element(draft: &mut CanvasState, element: &Element) -> Result<(), CommandError> {
    if draft.elements.contains_key(&element.id) {
        return Err(CommandError::DuplicateId {
            kind: "element",
            id: element.id.clone(),
        });
    }
    if let Some(gid) = &element.group {
        if !draft.groups.contains_key(gid) {
            return Err(CommandError::GroupNotFound(gid.clone()));
        }
    }
    draft
        .elements
        .insert(element.id.clone(), element.clone().into());
    // Keep group membership bidirectional.
    if let Some(gid) = &element.group {
        if let Some(g) = draft.groups.get_mut(gid) {
            if !g.data.members.iter().any(|m| m == &element.id) {
                g.data.members.push(element.id.clone());
            }
        }
    }
    Ok(())
}

fn merge_element(draft: &mut CanvasState, id: &str, overlay: &Value) -> Result<(), CommandError> {
    let current = draft
        .elements
        .get(id)
        .ok_or_else(|| CommandError::ElementNotFound(id.to_string()))?
        .data
        .clone();
    let merged: Element = merge_dto(&current, overlay, id)?;

    if merged.group != current.group {
        if let Some(new_gid) = &merged.group {
            if !draft.groups.contains_key(new_gid) {
                return Err(CommandError::GroupNotFound(new_gid.clone()));
            }
        }
        if let Some(old_gid) = &current.group {
            if let Some(g) = draft.groups.get_mut(old_gid) {
                g.data.members.retain(|m| m != id);
            }
        }
        if let Some(new_gid) = &merged.group {
            if let Some(g) = draft.groups.get_mut(new_gid) {
                if !g.data.members.iter().any(|m| m == id) {
                    g.data.members.push(id.to_string());
                }
            }
        }
    }

    if let Some(el) = draft.elements.get_mut(id) {
        el.data = merged;
    }
    Ok(())
}

fn delete_elements(draft: &mut CanvasState, ids: &[String]) -> Result<(), CommandError> {
    for id in ids {
        if !draft.elements.contains_key(id) {
            return Err(CommandError::ElementNotFound(id.clone()));
        }
    }
    for id in ids {
        draft.elements.remove(id);
    }

    // Connectors with a deleted endpoint go with it.
    let doomed: Vec<String> = draft
        .connectors
        .iter()
        .filter(|(_, c)| ids.contains(&c.data.from) || ids.contains(&c.data.to))
        .map(|(cid, _)| cid.clone())
        .collect();
    for cid in &doomed {
        draft.connectors.remove(cid);
    }

    // Group membership and step targets lose the reference but survive.
    for g in draft.groups.values_mut() {
        g.data.members.retain(|m| !ids.contains(m));
    }
    for s in draft.steps.values_mut() {
        if s.data.item.as_ref().is_some_and(|item| ids.contains(item)) {
            s.data.item = None;
        }
    }

    let selection = &mut draft.document.selection;
    selection.elements.retain(|e| !ids.contains(e));
    selection.connectors.retain(|c| !doomed.contains(c));
    Ok(())
}

fn create_connector(draft: &mut CanvasState, connector: &Connector) -> Result<(), CommandError> {
    if draft.connectors.contains_key(&connector.id) {
        return Err(CommandError::DuplicateId {
            kind: "connector",
            id: connector.id.clone(),
        });
    }
    for end in [&connector.from, &connector.to] {
        if !draft.elements.contains_key(end) {
            return Err(CommandError::MissingEndpoint {
                connector: connector.id.clone(),
                element: end.clone(),
            });
        }
    }
    draft
        .connectors
        .insert(connector.id.clone(), connector.clone().into());
    Ok(())
}

fn merge_connector(draft: &mut CanvasState, id: &str, overlay: &Value) -> Result<(), CommandError> {
    let current = draft
        .connectors
        .get(id)
        .ok_or_else(|| CommandError::ConnectorNotFound(id.to_string()))?
        .data
        .clone();
    let merged: Connector = merge_dto(&current, overlay, id)?;
    for end in [&merged.from, &merged.to] {
        if !draft.elements.contains_key(end) {
            return Err(CommandError::MissingEndpoint {
                connector: id.to_string(),
                element: end.clone(),
            });
        }
    }
    if let Some(c) = draft.connectors.get_mut(id) {
        c.data = merged;
    }
    Ok(())
}

fn delete_connectors(draft: &mut CanvasState, ids: &[String]) -> Result<(), CommandError> {
    for id in ids {
        if !draft.connectors.contains_key(id) {
            return Err(CommandError::ConnectorNotFound(id.clone()));
        }
    }
    for id in ids {
        draft.connectors.remove(id);
    }
    draft
        .document
        .selection
        .connectors
        .retain(|c| !ids.contains(c));
    Ok(())
}

fn create_group(draft: &mut CanvasState, group: &Group) -> Result<(), CommandError> {
    if draft.groups.contains_key(&group.id) {
        return Err(CommandError::DuplicateId {
            kind: "group",
            id: group.id.clone(),
        });
    }
    for member in &group.members {
        let el = draft
            .elements
            .get(member)
            .ok_or_else(|| CommandError::ElementNotFound(member.clone()))?;
        if let Some(existing) = &el.data.group {
            return Err(CommandError::AlreadyGrouped {
                element: member.clone(),
                group: existing.clone(),
            });
        }
    }
    // Stamp the back-reference on every member.
    for member in &group.members {
        if let Some(el) = draft.elements.get_mut(member) {
            el.data.group = Some(group.id.clone());
        }
    }
    draft.groups.insert(group.id.clone(), group.clone().into());
    Ok(())
}

fn merge_group(draft: &mut CanvasState, id: &str, overlay: &Value) -> Result<(), CommandError> {
    let current = draft
        .groups
        .get(id)
        .ok_or_else(|| CommandError::GroupNotFound(id.to_string()))?
        .data
        .clone();
    let merged: Group = merge_dto(&current, overlay, id)?;

    for member in &merged.members {
        if !current.members.contains(member) {
            let el = draft
                .elements
                .get(member)
                .ok_or_else(|| CommandError::ElementNotFound(member.clone()))?;
            if let Some(existing) = &el.data.group {
                if existing != id {
                    return Err(CommandError::AlreadyGrouped {
                        element: member.clone(),
                        group: existing.clone(),
                    });
                }
            }
        }
    }
    for member in &current.members {
        if !merged.members.contains(member) {
            if let Some(el) = draft.elements.get_mut(member) {
                el.data.group = None;
            }
        }
    }
    for member in &merged.members {
        if let Some(el) = draft.elements.get_mut(member) {
            el.data.group = Some(id.to_string());
        }
    }

    if let Some(g) = draft.groups.get_mut(id) {
        g.data = merged;
    }
    Ok(())
}

fn delete_group(draft: &mut CanvasState, id: &str) -> Result<(), CommandError> {
    let group = draft
        .groups
        .remove(id)
        .ok_or_else(|| CommandError::GroupNotFound(id.to_string()))?;
    // Clear every member element's back-reference.
    for member in &group.data.members {
        if let Some(el) = draft.elements.get_mut(member) {
            el.data.group = None;
        }
    }
    for s in draft.steps.values_mut() {
        if s.data.group.as_deref() == Some(id) {
            s.data.group = None;
        }
    }
    if draft.document.selection.group.as_deref() == Some(id) {
        draft.document.selection.group = None;
    }
    Ok(())
}

fn create_step(draft: &mut CanvasState, step: &Step) -> Result<(), CommandError> {
    if draft.steps.contains_key(&step.id) {
        return Err(CommandError::DuplicateId {
            kind: "step",
            id: step.id.clone(),
        });
    }
    check_step_refs(draft, step)?;

    let order = step.order.min(draft.steps.len() as u32);
    for s in draft.steps.values_mut() {
        if s.data.order >= order {
            s.data.order += 1;
        }
    }
    let mut step = step.clone();
    step.order = order;
    draft.steps.insert(step.id.clone(), step.into());
    Ok(())
}

fn merge_step(draft: &mut CanvasState, id: &str, overlay: &Value) -> Result<(), CommandError> {
    let current = draft
        .steps
        .get(id)
        .ok_or_else(|| CommandError::StepNotFound(id.to_string()))?
        .data
        .clone();
    let merged: Step = merge_dto(&current, overlay, id)?;
    check_step_refs(draft, &merged)?;
    if let Some(s) = draft.steps.get_mut(id) {
        s.data = merged;
    }
    Ok(())
}

fn delete_steps(draft: &mut CanvasState, ids: &[String]) -> Result<(), CommandError> {
    for id in ids {
        if !draft.steps.contains_key(id) {
            return Err(CommandError::StepNotFound(id.clone()));
        }
    }
    for id in ids {
        draft.steps.remove(id);
    }
    renumber_steps(draft);
    Ok(())
}

fn move_step(draft: &mut CanvasState, id: &str, order: u32) -> Result<(), CommandError> {
    if !draft.steps.contains_key(id) {
        return Err(CommandError::StepNotFound(id.to_string()));
    }
    let mut rest: Vec<(u32, String)> = draft
        .steps
        .values()
        .filter(|s| s.data.id != id)
        .map(|s| (s.data.order, s.data.id.clone()))
        .collect();
    rest.sort();

    let mut ordered: Vec<String> = rest.into_iter().map(|(_, sid)| sid).collect();
    let at = (order as usize).min(ordered.len());
    ordered.insert(at, id.to_string());
    for (i, sid) in ordered.iter().enumerate() {
        if let Some(s) = draft.steps.get_mut(sid) {
            s.data.order = i as u32;
        }
    }
    Ok(())
}

fn check_step_refs(draft: &CanvasState, step: &Step) -> Result<(), CommandError> {
    if let Some(item) = &step.item {
        if !draft.elements.contains_key(item) {
            return Err(CommandError::ElementNotFound(item.clone()));
        }
    }
    if let Some(gid) = &step.group {
        if !draft.groups.contains_key(gid) {
            return Err(CommandError::GroupNotFound(gid.clone()));
        }
    }
    Ok(())
}

/// Reassign dense 0-based orders after a removal.
fn renumber_steps(draft: &mut CanvasState) {
    let mut ordered: Vec<(u32, String)> = draft
        .steps
        .values()
        .map(|s| (s.data.order, s.data.id.clone()))
        .collect();
    ordered.sort();
    for (i, (_, id)) in ordered.into_iter().enumerate() {
        if let Some(s) = draft.steps.get_mut(&id) {
            s.data.order = i as u32;
        }
    }
}

fn set_selection(draft: &mut CanvasState, selection: &Selection) -> Result<(), CommandError> {
    for id in &selection.elements {
        if !draft.elements.contains_key(id) {
            return Err(CommandError::ElementNotFound(id.clone()));
        }
    }
    for id in &selection.connectors {
        if !draft.connectors.contains_key(id) {
            return Err(CommandError::ConnectorNotFound(id.clone()));
        }
    }
    if let Some(gid) = &selection.group {
        if !draft.groups.contains_key(gid) {
            return Err(CommandError::GroupNotFound(gid.clone()));
        }
    }
    draft.document.selection = selection.clone();
    Ok(())
}

fn apply_patches(draft: &mut CanvasState, patches: &[Patch]) -> Result<(), CommandError> {
    let mut value =
        serde_json::to_value(&*draft).map_err(|e| CommandError::Codec(e.to_string()))?;
    patch::apply(&mut value, patches)?;
    *draft = serde_json::from_value(value).map_err(|e| CommandError::Codec(e.to_string()))?;
    Ok(())
}

/// Merge a data object into a DTO. The id field is immutable.
fn merge_dto<T>(current: &T, overlay: &Value, expected_id: &str) -> Result<T, CommandError>
where
    T: Serialize + DeserializeOwned,
{
    if let Some(found) = overlay.get("id").and_then(Value::as_str) {
        if found != expected_id {
            return Err(CommandError::IdMismatch {
                expected: expected_id.to_string(),
                found: found.to_string(),
            });
        }
    }
    let mut value =
        serde_json::to_value(current).map_err(|e| CommandError::Codec(e.to_string()))?;
    patch::merge(&mut value, overlay);
    serde_json::from_value(value).map_err(|e| CommandError::Codec(e.to_string()))
}
