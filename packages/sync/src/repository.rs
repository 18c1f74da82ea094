//! The canonical resource mirror and its push queue.
//!
//! `RepositoryState` holds the server-synchronized copy of every persisted
//! resource: DTOs only, no transient view-model fields. It stays in
//! lockstep with the store except during the window between an optimistic
//! local mutation and its server confirmation.
//!
//! Pushes are serialized through one FIFO queue per document, so batches
//! reach the server in the order they were committed.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use easel_model::patch::{self, Patch, PatchOp, PathSegment};
use easel_model::{CanvasState, Connector, DocumentMeta, Element, Group, Step};

use crate::client::{ClientError, DocumentBundle, ResourceClient};
use crate::errors::SyncError;

/// The closed set of persisted resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Elements,
    Connectors,
    Groups,
    Steps,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Document,
        ResourceKind::Elements,
        ResourceKind::Connectors,
        ResourceKind::Groups,
        ResourceKind::Steps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Document => "document",
            ResourceKind::Elements => "elements",
            ResourceKind::Connectors => "connectors",
            ResourceKind::Groups => "groups",
            ResourceKind::Steps => "steps",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = WirePatchError;

    fn from_str(s: &str) -> Result<Self, WirePatchError> {
        match s {
            "document" => Ok(ResourceKind::Document),
            "elements" => Ok(ResourceKind::Elements),
            "connectors" => Ok(ResourceKind::Connectors),
            "groups" => Ok(ResourceKind::Groups),
            "steps" => Ok(ResourceKind::Steps),
            other => Err(WirePatchError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WirePatchError {
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    #[error("patch path is empty")]
    EmptyPath,

    #[error("{0} patch is missing an id segment")]
    MissingId(&'static str),
}

/// One patch addressed to a resource collection.
///
/// For `Document` the path addresses a field of the document meta; for the
/// id-keyed kinds the first segment is the entity id.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoPatch {
    pub kind: ResourceKind,
    pub op: PatchOp,
    pub path: Vec<PathSegment>,
    pub value: Option<Value>,
}

impl RepoPatch {
    /// The entity id this patch addresses, for id-keyed kinds.
    pub fn entity_id(&self) -> Option<String> {
        match self.kind {
            ResourceKind::Document => None,
            _ => self.path.first().map(PathSegment::as_key),
        }
    }

    /// Flatten to the wire shape: the kind becomes the path head.
    pub fn to_wire(&self) -> Patch {
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.push(PathSegment::key(self.kind.as_str()));
        path.extend(self.path.iter().cloned());
        Patch {
            op: self.op,
            path,
            value: self.value.clone(),
        }
    }

    /// Parse a wire patch back into its addressed collection.
    pub fn from_wire(patch: &Patch) -> Result<Self, WirePatchError> {
        let head = patch.path.first().ok_or(WirePatchError::EmptyPath)?;
        let kind: ResourceKind = head.as_key().parse()?;
        let path = patch.path[1..].to_vec();
        if kind != ResourceKind::Document && path.is_empty() {
            return Err(WirePatchError::MissingId(kind.as_str()));
        }
        Ok(Self {
            kind,
            op: patch.op,
            path,
            value: patch.value.clone(),
        })
    }
}

impl fmt::Display for RepoPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// Per-kind id-maps of persisted DTOs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryState {
    pub document: DocumentMeta,
    pub elements: BTreeMap<String, Element>,
    pub connectors: BTreeMap<String, Connector>,
    pub groups: BTreeMap<String, Group>,
    pub steps: BTreeMap<String, Step>,
}

impl RepositoryState {
    pub fn from_bundle(bundle: &DocumentBundle) -> Self {
        Self {
            document: bundle.document.clone(),
            elements: bundle
                .elements
                .iter()
                .map(|e| (e.id.clone(), e.clone()))
                .collect(),
            connectors: bundle
                .connectors
                .iter()
                .map(|c| (c.id.clone(), c.clone()))
                .collect(),
            groups: bundle
                .groups
                .iter()
                .map(|g| (g.id.clone(), g.clone()))
                .collect(),
            steps: bundle
                .steps
                .iter()
                .map(|s| (s.id.clone(), s.clone()))
                .collect(),
        }
    }

    /// Project the persisted half of a view-model snapshot.
    pub fn from_canvas(state: &CanvasState) -> Self {
        Self {
            document: state.document.data.clone(),
            elements: state
                .elements
                .iter()
                .map(|(id, e)| (id.clone(), e.data.clone()))
                .collect(),
            connectors: state
                .connectors
                .iter()
                .map(|(id, c)| (id.clone(), c.data.clone()))
                .collect(),
            groups: state
                .groups
                .iter()
                .map(|(id, g)| (id.clone(), g.data.clone()))
                .collect(),
            steps: state
                .steps
                .iter()
                .map(|(id, s)| (id.clone(), s.data.clone()))
                .collect(),
        }
    }

    /// Expand into a fresh view-model snapshot (transient fields default).
    pub fn to_canvas(&self) -> CanvasState {
        let mut state = CanvasState::default();
        state.document.data = self.document.clone();
        state.elements = self
            .elements
            .iter()
            .map(|(id, e)| (id.clone(), e.clone().into()))
            .collect();
        state.connectors = self
            .connectors
            .iter()
            .map(|(id, c)| (id.clone(), c.clone().into()))
            .collect();
        state.groups = self
            .groups
            .iter()
            .map(|(id, g)| (id.clone(), g.clone().into()))
            .collect();
        state.steps = self
            .steps
            .iter()
            .map(|(id, s)| (id.clone(), s.clone().into()))
            .collect();
        state
    }

    /// Apply one patch to the addressed collection.
    pub fn apply(&mut self, patch: &RepoPatch) -> Result<(), SyncError> {
        match patch.kind {
            ResourceKind::Document => {
                self.document = apply_to(&self.document, patch)?;
            }
            ResourceKind::Elements => {
                self.elements = apply_to(&self.elements, patch)?;
            }
            ResourceKind::Connectors => {
                self.connectors = apply_to(&self.connectors, patch)?;
            }
            ResourceKind::Groups => {
                self.groups = apply_to(&self.groups, patch)?;
            }
            ResourceKind::Steps => {
                self.steps = apply_to(&self.steps, patch)?;
            }
        }
        Ok(())
    }
}

fn apply_to<T>(target: &T, repo_patch: &RepoPatch) -> Result<T, SyncError>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(target)?;
    patch::apply(
        &mut value,
        &[Patch {
            op: repo_patch.op,
            path: repo_patch.path.clone(),
            value: repo_patch.value.clone(),
        }],
    )?;
    Ok(serde_json::from_value(value)?)
}

/// One queued push.
#[derive(Debug, Clone)]
pub struct PushBatch {
    pub patches: Vec<RepoPatch>,
    pub queued_at: DateTime<Utc>,
}

/// The canonical, server-synchronized mirror plus its outbound queue.
pub struct Repository {
    doc_id: String,
    client: Arc<dyn ResourceClient>,
    state: RepositoryState,
    queue: VecDeque<PushBatch>,
}

impl Repository {
    pub fn new(doc_id: impl Into<String>, client: Arc<dyn ResourceClient>) -> Self {
        Self {
            doc_id: doc_id.into(),
            client,
            state: RepositoryState::default(),
            queue: VecDeque::new(),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn state(&self) -> &RepositoryState {
        &self.state
    }

    pub fn pending_batches(&self) -> usize {
        self.queue.len()
    }

    /// Pull all resource collections for the document. Aborting the signal
    /// discards the in-flight request without touching state.
    pub async fn pull(&mut self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let fetch = self.client.fetch_document(&self.doc_id);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Aborted),
            bundle = fetch => {
                self.state = RepositoryState::from_bundle(&bundle?);
                Ok(())
            }
        }
    }

    /// Optimistically apply a local batch and queue it for push.
    pub fn commit(&mut self, patches: Vec<RepoPatch>) -> Result<(), SyncError> {
        let mut next = self.state.clone();
        for patch in &patches {
            next.apply(patch)?;
        }
        self.state = next;
        self.queue.push_back(PushBatch {
            patches,
            queued_at: Utc::now(),
        });
        Ok(())
    }

    /// Apply a remote (already-confirmed) patch to the mirror only.
    pub fn apply_remote(&mut self, patch: &RepoPatch) -> Result<(), SyncError> {
        let mut next = self.state.clone();
        next.apply(patch)?;
        self.state = next;
        Ok(())
    }

    pub fn next_batch(&mut self) -> Option<PushBatch> {
        self.queue.pop_front()
    }

    /// Put a failed batch back at the head of the queue; it is retried by
    /// the next flush, ahead of anything committed after it.
    pub fn requeue(&mut self, batch: PushBatch) {
        self.queue.push_front(batch);
    }

    pub async fn push(&self, batch: &PushBatch) -> Result<(), ClientError> {
        let wire: Vec<Patch> = batch.patches.iter().map(RepoPatch::to_wire).collect();
        self.client.push_patches(&self.doc_id, wire).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_model::{Bounds, ElementKind};
    use serde_json::json;

    fn element(id: &str) -> Element {
        Element::new(id, ElementKind::Box, Bounds::new(0.0, 0.0, 10.0, 10.0))
    }

    #[test]
    fn test_wire_roundtrip_keeps_kind_in_path() {
        let repo_patch = RepoPatch {
            kind: ResourceKind::Elements,
            op: PatchOp::Replace,
            path: vec!["e1".into(), "bounds".into(), "x".into()],
            value: Some(json!(4.0)),
        };

        let wire = repo_patch.to_wire();
        assert_eq!(
            serde_json::to_value(&wire).unwrap(),
            json!({"op": "replace", "path": ["elements", "e1", "bounds", "x"], "value": 4.0})
        );
        assert_eq!(RepoPatch::from_wire(&wire).unwrap(), repo_patch);
    }

    #[test]
    fn test_from_wire_rejects_unknown_kind() {
        let wire = Patch::remove(vec!["widgets".into(), "w1".into()]);
        assert_eq!(
            RepoPatch::from_wire(&wire).unwrap_err(),
            WirePatchError::UnknownKind("widgets".to_string())
        );
    }

    #[test]
    fn test_from_wire_requires_entity_id() {
        let wire = Patch::remove(vec!["elements".into()]);
        assert!(matches!(
            RepoPatch::from_wire(&wire).unwrap_err(),
            WirePatchError::MissingId("elements")
        ));
    }

    #[test]
    fn test_state_apply_add_and_remove() {
        let mut state = RepositoryState::default();
        state
            .apply(&RepoPatch {
                kind: ResourceKind::Elements,
                op: PatchOp::Add,
                path: vec!["e1".into()],
                value: Some(serde_json::to_value(element("e1")).unwrap()),
            })
            .unwrap();
        assert!(state.elements.contains_key("e1"));

        state
            .apply(&RepoPatch {
                kind: ResourceKind::Elements,
                op: PatchOp::Remove,
                path: vec!["e1".into()],
                value: None,
            })
            .unwrap();
        assert!(state.elements.is_empty());
    }

    #[test]
    fn test_canvas_projection_roundtrip() {
        let mut state = RepositoryState::default();
        state.document.title = "doc".to_string();
        state.elements.insert("e1".to_string(), element("e1"));

        let canvas = state.to_canvas();
        assert_eq!(canvas.element("e1"), Some(&element("e1")));
        assert_eq!(RepositoryState::from_canvas(&canvas), state);
    }
}
