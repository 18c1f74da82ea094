//! The full document view-model.
//!
//! `CanvasState` is the single state snapshot owned by the store. Every
//! resource entry nests its persisted DTO under the `data` key; sibling
//! fields are transient UI state that never reaches the server and never
//! enters the undo history. The sync layer relies on this shape to map
//! store paths (`elements/<id>/data/...`) to flat repository paths
//! (`elements/<id>/...`) and to drop transient-only patches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{Bounds, Point};
use crate::resources::{Connector, DocumentMeta, Element, Group, Step};

/// The two mutually exclusive editing modes.
///
/// `Design` edits the canvas itself (elements, connectors, groups);
/// `Flow` edits the presentation step sequence. Each mode has its own
/// undo history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditMode {
    #[default]
    Design,
    Flow,
}

/// Current selection, by id. Transient.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Selection {
    pub elements: Vec<String>,
    pub connectors: Vec<String>,
    pub group: Option<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.connectors.is_empty() && self.group.is_none()
    }
}

/// Pan/zoom state of the canvas view. Transient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub offset: Point,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            offset: Point::default(),
            zoom: 1.0,
        }
    }
}

/// A remote collaborator's ephemeral presence entry.
///
/// Keyed by peer connection id; created when the peer channel opens,
/// destroyed when it closes. Never persisted, never undoable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collaborator {
    pub id: String,
    pub name: String,
    /// Cursor color, from the fixed presence palette.
    pub color: String,
    pub cursor: Point,
}

/// In-progress drag preview for an element. Transient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DragPreview {
    pub start: Point,
    pub current: Point,
}

/// View-model entry for one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    pub data: Element,
    pub drag: Option<DragPreview>,
    pub resize: Option<Bounds>,
}

impl From<Element> for ElementState {
    fn from(data: Element) -> Self {
        Self {
            data,
            drag: None,
            resize: None,
        }
    }
}

/// View-model entry for one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorState {
    pub data: Connector,
    /// Routing preview while the connector is being dragged. Transient.
    pub preview: Option<Vec<Point>>,
}

impl From<Connector> for ConnectorState {
    fn from(data: Connector) -> Self {
        Self {
            data,
            preview: None,
        }
    }
}

/// View-model entry for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub data: Group,
}

impl From<Group> for GroupState {
    fn from(data: Group) -> Self {
        Self { data }
    }
}

/// View-model entry for one presentation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub data: Step,
}

impl From<Step> for StepState {
    fn from(data: Step) -> Self {
        Self { data }
    }
}

/// Top-level document state: persisted meta plus transient session fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentState {
    pub data: DocumentMeta,
    pub selection: Selection,
    pub viewport: Viewport,
    pub mode: EditMode,
    /// Number of patch batches queued or in flight toward the server.
    /// Feedback for "saving..." UI only, not concurrency control.
    pub pending_pushes: u32,
    pub collaborators: BTreeMap<String, Collaborator>,
}

/// The full document view-model: one map per resource kind plus the
/// document-level fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanvasState {
    pub document: DocumentState,
    pub elements: BTreeMap<String, ElementState>,
    pub connectors: BTreeMap<String, ConnectorState>,
    pub groups: BTreeMap<String, GroupState>,
    pub steps: BTreeMap<String, StepState>,
}

/// A broken internal reference found by [`CanvasState::check_references`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("selection references missing element: {0}")]
    SelectionElement(String),

    #[error("selection references missing connector: {0}")]
    SelectionConnector(String),

    #[error("selection references missing group: {0}")]
    SelectionGroup(String),

    #[error("connector {connector} references missing element: {element}")]
    ConnectorEndpoint { connector: String, element: String },

    #[error("group {group} references missing element: {element}")]
    GroupMember { group: String, element: String },

    #[error("element {element} references missing group: {group}")]
    ElementGroup { element: String, group: String },

    #[error("step {step} references missing element: {element}")]
    StepItem { step: String, element: String },

    #[error("step {step} references missing group: {group}")]
    StepGroup { step: String, group: String },
}

impl CanvasState {
    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id).map(|e| &e.data)
    }

    pub fn connector(&self, id: &str) -> Option<&Connector> {
        self.connectors.get(id).map(|c| &c.data)
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id).map(|g| &g.data)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id).map(|s| &s.data)
    }

    /// Steps sorted by presentation order.
    pub fn ordered_steps(&self) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self.steps.values().map(|s| &s.data).collect();
        steps.sort_by_key(|s| (s.order, s.id.clone()));
        steps
    }

    /// Verify that every cross-reference resolves. A dangling reference is
    /// a bug in a command's cleanup logic.
    pub fn check_references(&self) -> Result<(), Vec<StateError>> {
        let mut errors = Vec::new();

        for id in &self.document.selection.elements {
            if !self.elements.contains_key(id) {
                errors.push(StateError::SelectionElement(id.clone()));
            }
        }
        for id in &self.document.selection.connectors {
            if !self.connectors.contains_key(id) {
                errors.push(StateError::SelectionConnector(id.clone()));
            }
        }
        if let Some(id) = &self.document.selection.group {
            if !self.groups.contains_key(id) {
                errors.push(StateError::SelectionGroup(id.clone()));
            }
        }

        for (cid, c) in &self.connectors {
            for end in [&c.data.from, &c.data.to] {
                if !self.elements.contains_key(end) {
                    errors.push(StateError::ConnectorEndpoint {
                        connector: cid.clone(),
                        element: end.clone(),
                    });
                }
            }
        }

        for (gid, g) in &self.groups {
            for member in &g.data.members {
                if !self.elements.contains_key(member) {
                    errors.push(StateError::GroupMember {
                        group: gid.clone(),
                        element: member.clone(),
                    });
                }
            }
        }

        for (eid, e) in &self.elements {
            if let Some(gid) = &e.data.group {
                if !self.groups.contains_key(gid) {
                    errors.push(StateError::ElementGroup {
                        element: eid.clone(),
                        group: gid.clone(),
                    });
                }
            }
        }

        for (sid, s) in &self.steps {
            if let Some(item) = &s.data.item {
                if !self.elements.contains_key(item) {
                    errors.push(StateError::StepItem {
                        step: sid.clone(),
                        element: item.clone(),
                    });
                }
            }
            if let Some(gid) = &s.data.group {
                if !self.groups.contains_key(gid) {
                    errors.push(StateError::StepGroup {
                        step: sid.clone(),
                        group: gid.clone(),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
