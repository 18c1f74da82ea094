//! The data synchronization coordinator.
//!
//! Owns the store, both mode histories, the resource repository and the
//! presence channel, and is the only writer wiring them together:
//!
//! - user dispatches are recorded by the active history and forwarded to
//!   the repository (store paths mapped to flat resource paths, transient
//!   patches dropped)
//! - repository-originated replays are dispatched with the `server`
//!   source, which the forwarding path ignores, so a mirrored patch can
//!   never loop back into the repository
//! - undo/redo delegate to the active history and persist the result
//! - newly created media elements backed by a local blob are uploaded
//!   asynchronously and patched to their persisted URL (or removed on
//!   upload failure)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use easel_editor::{
    Change, Command, CommandError, Dispatch, DispatchOptions, History, HistoryStatus, Source,
    Store, StoreError, SubscriptionId,
};
use easel_model::patch::{self, Patch, PatchOp, PathSegment};
use easel_model::{CanvasState, Connector, EditMode, Element, Group, Point, Step};

use crate::client::{AssetClient, ResourceClient};
use crate::errors::SyncError;
use crate::presence::{PeerMessage, PeerTransport, PresenceChannel};
use crate::repository::{RepoPatch, Repository, RepositoryState, ResourceKind};
use crate::SyncOptions;

/// Pauses periodic background refresh while a manual refresh is in flight.
#[derive(Clone, Default)]
pub struct RefreshGate {
    manual: Arc<AtomicBool>,
}

impl RefreshGate {
    /// Mark a manual refresh in flight; background refresh resumes when
    /// the returned guard drops.
    pub fn manual(&self) -> ManualRefresh {
        self.manual.store(true, Ordering::SeqCst);
        ManualRefresh {
            flag: self.manual.clone(),
        }
    }

    pub fn background_allowed(&self) -> bool {
        !self.manual.load(Ordering::SeqCst)
    }
}

pub struct ManualRefresh {
    flag: Arc<AtomicBool>,
}

impl Drop for ManualRefresh {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct PendingUpload {
    element_id: String,
    asset_key: String,
}

type PushFailedHook = Box<dyn FnMut(&SyncError)>;

/// Wires store, histories, repository and presence together for one
/// document session.
pub struct Coordinator {
    store: Store,
    design_history: History,
    flow_history: History,
    repository: Repository,
    presence: PresenceChannel,
    assets: Arc<dyn AssetClient>,
    uploads: VecDeque<PendingUpload>,
    refresh_gate: RefreshGate,
    on_push_failed: Option<PushFailedHook>,
}

impl Coordinator {
    pub fn new(
        doc_id: impl Into<String>,
        client: Arc<dyn ResourceClient>,
        assets: Arc<dyn AssetClient>,
        transport: Arc<dyn PeerTransport>,
        local_name: impl Into<String>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            store: Store::new(CanvasState::default())?,
            design_history: History::design(options.history),
            flow_history: History::flow(options.history),
            repository: Repository::new(doc_id, client),
            presence: PresenceChannel::new(local_name, transport, options.presence),
            assets,
            uploads: VecDeque::new(),
            refresh_gate: RefreshGate::default(),
            on_push_failed: None,
        })
    }

    /// Non-blocking notification for transient push failures.
    pub fn on_push_failed(&mut self, hook: impl FnMut(&SyncError) + 'static) {
        self.on_push_failed = Some(Box::new(hook));
    }

    pub fn state(&self) -> &CanvasState {
        self.store.state()
    }

    pub fn repository_state(&self) -> &RepositoryState {
        self.repository.state()
    }

    pub fn pending_batches(&self) -> usize {
        self.repository.pending_batches()
    }

    pub fn refresh_gate(&self) -> RefreshGate {
        self.refresh_gate.clone()
    }

    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&CanvasState, &Change) + 'static,
    ) -> SubscriptionId {
        self.store.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Undo/redo availability for the active editing mode.
    pub fn history_status(&self) -> HistoryStatus {
        match self.store.state().document.mode {
            EditMode::Design => self.design_history.status(),
            EditMode::Flow => self.flow_history.status(),
        }
    }

    /// Pull repository state and build the initial snapshot.
    pub async fn init(&mut self, cancel: &CancellationToken) -> Result<(), SyncError> {
        self.repository.pull(cancel).await?;
        let snapshot = self.repository.state().to_canvas();
        self.store.dispatch(
            vec![Command::ReplaceState(Box::new(snapshot))],
            DispatchOptions::server(),
        )?;
        Ok(())
    }

    /// Manual re-pull and reconcile. Background refresh is gated off while
    /// this runs. The reconciled snapshot is server-authoritative and is
    /// not pushed back.
    pub async fn refresh(&mut self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let _guard = self.refresh_gate.manual();
        self.repository.pull(cancel).await?;

        let mut snapshot = self.repository.state().to_canvas();
        carry_over_transient(&mut snapshot, self.store.state());
        self.store.dispatch(
            vec![Command::ReplaceState(Box::new(snapshot))],
            DispatchOptions::server(),
        )?;
        Ok(())
    }

    /// Undo in the active mode, persisting the reverted change.
    pub fn undo(&mut self) -> Result<Option<Change>, SyncError> {
        let history = match self.store.state().document.mode {
            EditMode::Design => &mut self.design_history,
            EditMode::Flow => &mut self.flow_history,
        };
        let change = history.undo(&mut self.store)?;
        if let Some(change) = &change {
            self.forward(change)?;
        }
        Ok(change)
    }

    /// Redo in the active mode, persisting the re-applied change.
    pub fn redo(&mut self) -> Result<Option<Change>, SyncError> {
        let history = match self.store.state().document.mode {
            EditMode::Design => &mut self.design_history,
            EditMode::Flow => &mut self.flow_history,
        };
        let change = history.redo(&mut self.store)?;
        if let Some(change) = &change {
            self.forward(change)?;
        }
        Ok(change)
    }

    /// Switch editing modes; both histories reset.
    pub fn set_mode(&mut self, mode: EditMode) -> Result<(), SyncError> {
        self.store
            .dispatch(vec![Command::SetMode(mode)], DispatchOptions::user())?;
        self.design_history.reset();
        self.flow_history.reset();
        Ok(())
    }

    /// Drain the push queue strictly in commit order, one batch in flight
    /// at a time.
    ///
    /// A failed push keeps the optimistic state: the batch is requeued at
    /// the head and retried by the next flush, the pending counter is
    /// corrected, and a non-blocking notification fires. No retry loop.
    pub async fn flush(&mut self) -> Result<(), SyncError> {
        while let Some(batch) = self.repository.next_batch() {
            let result = self.repository.push(&batch).await;
            self.store.dispatch(
                vec![Command::AdjustPendingPushes(-1)],
                DispatchOptions::server(),
            )?;
            if let Err(e) = result {
                tracing::warn!(
                    error = %e,
                    patches = batch.patches.len(),
                    "push failed; keeping optimistic state"
                );
                self.store.dispatch(
                    vec![Command::AdjustPendingPushes(1)],
                    DispatchOptions::server(),
                )?;
                self.repository.requeue(batch);
                let e = SyncError::Client(e);
                if let Some(hook) = self.on_push_failed.as_mut() {
                    hook(&e);
                }
                break;
            }
        }
        Ok(())
    }

    /// Upload every detected local media blob and commit the follow-up
    /// patch (replace the source on success, remove the element on
    /// failure).
    pub async fn process_uploads(&mut self) -> Result<(), SyncError> {
        while let Some(upload) = self.uploads.pop_front() {
            match self.assets.upload(&upload.asset_key).await {
                Ok(url) => self.finish_upload(&upload.element_id, url)?,
                Err(e) => {
                    tracing::warn!(
                        element = %upload.element_id,
                        error = %e,
                        "asset upload failed; removing element"
                    );
                    self.abandon_upload(&upload.element_id)?;
                }
            }
        }
        Ok(())
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Replay patches that arrived from the server (another collaborator's
    /// change relayed through the signaling channel, or a server-side
    /// mutation).
    ///
    /// A malformed or inapplicable patch is dropped with a log line; it
    /// never aborts the rest of the batch.
    pub fn apply_remote(&mut self, patches: &[Patch]) -> Result<(), SyncError> {
        for wire in patches {
            let repo_patch = match RepoPatch::from_wire(wire) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(patch = %wire, error = %e, "dropping malformed remote patch");
                    continue;
                }
            };
            if let Err(e) = self.repository.apply_remote(&repo_patch) {
                tracing::warn!(
                    patch = %repo_patch,
                    error = %e,
                    "remote patch does not apply to the repository mirror"
                );
                continue;
            }
            let Some(commands) = self.translate_remote(&repo_patch) else {
                tracing::warn!(patch = %repo_patch, "remote patch has no command translation");
                continue;
            };
            match self.store.dispatch(commands, DispatchOptions::server()) {
                Ok(_) => {}
                Err(StoreError::Command(e)) => {
                    tracing::debug!(
                        patch = %repo_patch,
                        error = %e,
                        "remote patch no longer applies to the store"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ----- presence ------------------------------------------------------

    /// A peer channel opened: track it and announce our identity.
    pub fn peer_opened(&mut self, peer_id: &str) {
        self.presence.peer_opened(peer_id);
    }

    /// A peer channel closed: its collaborator entry is deleted.
    pub fn peer_closed(&mut self, peer_id: &str) -> Result<(), SyncError> {
        self.presence.peer_closed(peer_id);
        self.store.dispatch(
            vec![Command::RemoveCollaborator(peer_id.to_string())],
            DispatchOptions::server(),
        )?;
        Ok(())
    }

    /// An incoming peer message: identity announcements create the
    /// collaborator entry, cursor updates move it.
    pub fn peer_message(&mut self, peer_id: &str, message: PeerMessage) -> Result<(), SyncError> {
        if let Some(command) = self
            .presence
            .handle_message(peer_id, message, self.store.state())
        {
            self.store
                .dispatch(vec![command], DispatchOptions::server())?;
        }
        Ok(())
    }

    /// Broadcast the local cursor position, throttled.
    pub fn cursor_moved(&mut self, at: Point) {
        self.presence.broadcast_cursor(at);
    }

    // ----- internal routing ----------------------------------------------

    fn route(&mut self, change: &Change) -> Result<(), SyncError> {
        match change.source {
            Source::User => {
                let history = match self.store.state().document.mode {
                    EditMode::Design => &mut self.design_history,
                    EditMode::Flow => &mut self.flow_history,
                };
                history.record(change);
                self.forward(change)
            }
            Source::Undo | Source::Redo => self.forward(change),
            // Repository-originated; forwarding would feed the patch back.
            Source::Server => Ok(()),
        }
    }

    /// Map a store change to repository patches and commit them.
    fn forward(&mut self, change: &Change) -> Result<(), SyncError> {
        let repo_patches = self.map_change(change)?;
        if repo_patches.is_empty() {
            return Ok(());
        }
        self.detect_uploads(&repo_patches);

        // Counter up before the commit, down after each push completes.
        self.store.dispatch(
            vec![Command::AdjustPendingPushes(1)],
            DispatchOptions::server(),
        )?;
        self.repository.commit(repo_patches)?;
        Ok(())
    }

    fn map_change(&self, change: &Change) -> Result<Vec<RepoPatch>, SyncError> {
        // A whole-tree replace carries no positional information, so diff
        // the new tree against the repository per top-level resource.
        if let [only] = change.forward.as_slice() {
            if only.path.is_empty() && only.op == PatchOp::Replace {
                return self.diff_against_repository();
            }
        }
        Ok(change.forward.iter().filter_map(map_store_patch).collect())
    }

    fn diff_against_repository(&self) -> Result<Vec<RepoPatch>, SyncError> {
        let mirror = serde_json::to_value(self.repository.state())?;
        let projection = serde_json::to_value(RepositoryState::from_canvas(self.store.state()))?;
        patch::diff(&mirror, &projection)
            .forward
            .iter()
            .map(|p| RepoPatch::from_wire(p).map_err(SyncError::from))
            .collect()
    }

    fn detect_uploads(&mut self, patches: &[RepoPatch]) {
        for patch in patches {
            if patch.kind != ResourceKind::Elements
                || patch.op != PatchOp::Add
                || patch.path.len() != 1
            {
                continue;
            }
            let Some(source) = patch.value.as_ref().and_then(|v| v.get("source")) else {
                continue;
            };
            if source.get("kind").and_then(Value::as_str) != Some("local") {
                continue;
            }
            let Some(asset_key) = source.get("asset_key").and_then(Value::as_str) else {
                continue;
            };
            let Some(element_id) = patch.entity_id() else {
                continue;
            };
            self.uploads.push_back(PendingUpload {
                element_id,
                asset_key: asset_key.to_string(),
            });
        }
    }

    fn finish_upload(&mut self, element_id: &str, url: String) -> Result<(), SyncError> {
        let source = serde_json::json!({"kind": "remote", "url": url});
        match self.store.dispatch(
            vec![Command::MergeElement {
                id: element_id.to_string(),
                data: serde_json::json!({ "source": source.clone() }),
            }],
            DispatchOptions::server(),
        ) {
            Ok(_) => {}
            Err(StoreError::Command(CommandError::ElementNotFound(_))) => {
                tracing::debug!(element = %element_id, "element deleted before upload finished");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.store.dispatch(
            vec![Command::AdjustPendingPushes(1)],
            DispatchOptions::server(),
        )?;
        self.repository.commit(vec![RepoPatch {
            kind: ResourceKind::Elements,
            op: PatchOp::Replace,
            path: vec![element_id.into(), "source".into()],
            value: Some(source),
        }])?;
        Ok(())
    }

    fn abandon_upload(&mut self, element_id: &str) -> Result<(), SyncError> {
        match self.store.dispatch(
            vec![Command::DeleteElements(vec![element_id.to_string()])],
            DispatchOptions::server(),
        ) {
            Ok(_) => {}
            Err(StoreError::Command(CommandError::ElementNotFound(_))) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if self.repository.state().elements.contains_key(element_id) {
            self.store.dispatch(
                vec![Command::AdjustPendingPushes(1)],
                DispatchOptions::server(),
            )?;
            self.repository.commit(vec![RepoPatch {
                kind: ResourceKind::Elements,
                op: PatchOp::Remove,
                path: vec![element_id.into()],
                value: None,
            }])?;
        }
        Ok(())
    }

    /// Per-kind translation of a confirmed remote patch into commands.
    fn translate_remote(&self, patch: &RepoPatch) -> Option<Vec<Command>> {
        match patch.kind {
            ResourceKind::Document => match (patch.op, patch.path.is_empty()) {
                (PatchOp::Add | PatchOp::Replace, true) => Some(vec![Command::MergeDocument {
                    data: patch.value.clone()?,
                }]),
                // Field-level document edits replay as raw patches.
                (_, false) => Some(vec![Command::ApplyPatches(vec![store_patch(patch)])]),
                (PatchOp::Remove, true) => None,
            },
            ResourceKind::Elements => {
                let id = patch.entity_id()?;
                if patch.path.len() > 1 {
                    return Some(vec![Command::ApplyPatches(vec![store_patch(patch)])]);
                }
                match patch.op {
                    PatchOp::Add => {
                        let value = patch.value.clone()?;
                        if self.store.state().elements.contains_key(&id) {
                            Some(vec![Command::MergeElement { id, data: value }])
                        } else {
                            let element: Element = serde_json::from_value(value).ok()?;
                            Some(vec![Command::CreateElement(element)])
                        }
                    }
                    PatchOp::Replace => Some(vec![Command::MergeElement {
                        id,
                        data: patch.value.clone()?,
                    }]),
                    PatchOp::Remove => Some(vec![Command::DeleteElements(vec![id])]),
                }
            }
            ResourceKind::Connectors => {
                let id = patch.entity_id()?;
                if patch.path.len() > 1 {
                    return Some(vec![Command::ApplyPatches(vec![store_patch(patch)])]);
                }
                match patch.op {
                    PatchOp::Add => {
                        let value = patch.value.clone()?;
                        if self.store.state().connectors.contains_key(&id) {
                            Some(vec![Command::MergeConnector { id, data: value }])
                        } else {
                            let connector: Connector = serde_json::from_value(value).ok()?;
                            Some(vec![Command::CreateConnector(connector)])
                        }
                    }
                    PatchOp::Replace => Some(vec![Command::MergeConnector {
                        id,
                        data: patch.value.clone()?,
                    }]),
                    PatchOp::Remove => Some(vec![Command::DeleteConnectors(vec![id])]),
                }
            }
            ResourceKind::Groups => {
                let id = patch.entity_id()?;
                if patch.path.len() > 1 {
                    return Some(vec![Command::ApplyPatches(vec![store_patch(patch)])]);
                }
                match patch.op {
                    PatchOp::Add => {
                        let value = patch.value.clone()?;
                        if self.store.state().groups.contains_key(&id) {
                            Some(vec![Command::MergeGroup { id, data: value }])
                        } else {
                            let group: Group = serde_json::from_value(value).ok()?;
                            Some(vec![Command::CreateGroup(group)])
                        }
                    }
                    PatchOp::Replace => Some(vec![Command::MergeGroup {
                        id,
                        data: patch.value.clone()?,
                    }]),
                    PatchOp::Remove => Some(vec![Command::DeleteGroup { id }]),
                }
            }
            ResourceKind::Steps => {
                let id = patch.entity_id()?;
                if patch.path.len() > 1 {
                    return Some(vec![Command::ApplyPatches(vec![store_patch(patch)])]);
                }
                match patch.op {
                    PatchOp::Add => {
                        let value = patch.value.clone()?;
                        if self.store.state().steps.contains_key(&id) {
                            Some(vec![Command::MergeStep { id, data: value }])
                        } else {
                            let step: Step = serde_json::from_value(value).ok()?;
                            Some(vec![Command::CreateStep(step)])
                        }
                    }
                    PatchOp::Replace => Some(vec![Command::MergeStep {
                        id,
                        data: patch.value.clone()?,
                    }]),
                    PatchOp::Remove => Some(vec![Command::DeleteSteps(vec![id])]),
                }
            }
        }
    }
}

impl Dispatch for Coordinator {
    type Error = SyncError;

    /// User-facing dispatch: commit to the store, then record and forward
    /// according to the change's source.
    fn dispatch(
        &mut self,
        commands: Vec<Command>,
        options: DispatchOptions,
    ) -> Result<Option<Change>, SyncError> {
        let change = self.store.dispatch(commands, options)?;
        if let Some(change) = &change {
            self.route(change)?;
        }
        Ok(change)
    }
}

/// Map one store patch to its repository counterpart: unwrap the `data`
/// sub-key, drop anything transient.
fn map_store_patch(patch: &Patch) -> Option<RepoPatch> {
    let head = patch.path.first()?.as_str()?;
    match head {
        "document" => {
            if patch.path.get(1)?.as_str()? != "data" {
                return None;
            }
            if patch.path.len() == 2 {
                // Whole meta replace.
                return Some(RepoPatch {
                    kind: ResourceKind::Document,
                    op: patch.op,
                    path: Vec::new(),
                    value: patch.value.clone(),
                });
            }
            Some(RepoPatch {
                kind: ResourceKind::Document,
                op: patch.op,
                path: patch.path[2..].to_vec(),
                value: patch.value.clone(),
            })
        }
        "elements" | "connectors" | "groups" | "steps" => {
            let kind: ResourceKind = head.parse().ok()?;
            let id = patch.path.get(1)?.clone();
            match patch.path.len() {
                2 => match patch.op {
                    PatchOp::Remove => Some(RepoPatch {
                        kind,
                        op: PatchOp::Remove,
                        path: vec![id],
                        value: None,
                    }),
                    PatchOp::Add | PatchOp::Replace => {
                        // The view-model wrapper nests the DTO under `data`;
                        // the repository holds the DTO flat.
                        let dto = patch.value.as_ref()?.get("data")?.clone();
                        Some(RepoPatch {
                            kind,
                            op: patch.op,
                            path: vec![id],
                            value: Some(dto),
                        })
                    }
                },
                len if len > 2 => {
                    if patch.path[2].as_str()? != "data" {
                        return None;
                    }
                    let mut path = vec![id];
                    path.extend(patch.path[3..].iter().cloned());
                    Some(RepoPatch {
                        kind,
                        op: patch.op,
                        path,
                        value: patch.value.clone(),
                    })
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Build a store-shaped patch from a repository patch (the reverse of
/// [`map_store_patch`] for field-level edits).
fn store_patch(patch: &RepoPatch) -> Patch {
    let mut path = vec![PathSegment::key(patch.kind.as_str())];
    match patch.kind {
        ResourceKind::Document => {
            path.push(PathSegment::key("data"));
            path.extend(patch.path.iter().cloned());
        }
        _ => {
            path.push(patch.path[0].clone());
            path.push(PathSegment::key("data"));
            path.extend(patch.path[1..].iter().cloned());
        }
    }
    Patch {
        op: patch.op,
        path,
        value: patch.value.clone(),
    }
}

/// Keep session-local fields across a reconcile, pruning selection ids
/// that did not survive the reload.
fn carry_over_transient(next: &mut CanvasState, current: &CanvasState) {
    next.document.viewport = current.document.viewport.clone();
    next.document.mode = current.document.mode;
    next.document.pending_pushes = current.document.pending_pushes;
    next.document.collaborators = current.document.collaborators.clone();

    let mut selection = current.document.selection.clone();
    selection.elements.retain(|id| next.elements.contains_key(id));
    selection
        .connectors
        .retain(|id| next.connectors.contains_key(id));
    if selection
        .group
        .as_ref()
        .map_or(false, |g| !next.groups.contains_key(g))
    {
        selection.group = None;
    }
    next.document.selection = selection;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_store_patch_unwraps_data_key() {
        let store_side = Patch::replace(
            vec![
                "elements".into(),
                "e1".into(),
                "data".into(),
                "bounds".into(),
                "x".into(),
            ],
            json!(4.0),
        );
        let mapped = map_store_patch(&store_side).unwrap();
        assert_eq!(mapped.kind, ResourceKind::Elements);
        assert_eq!(
            mapped.path,
            vec![
                PathSegment::key("e1"),
                PathSegment::key("bounds"),
                PathSegment::key("x")
            ]
        );
    }

    #[test]
    fn test_map_store_patch_drops_transient_paths() {
        let drag = Patch::replace(
            vec!["elements".into(), "e1".into(), "drag".into()],
            json!({"start": {"x": 0.0, "y": 0.0}, "current": {"x": 2.0, "y": 2.0}}),
        );
        assert!(map_store_patch(&drag).is_none());

        let selection = Patch::replace(
            vec!["document".into(), "selection".into(), "elements".into()],
            json!(["e1"]),
        );
        assert!(map_store_patch(&selection).is_none());
    }

    #[test]
    fn test_map_store_patch_extracts_dto_for_whole_entity() {
        let add = Patch::add(
            vec!["elements".into(), "e1".into()],
            json!({"data": {"id": "e1"}, "drag": null, "resize": null}),
        );
        let mapped = map_store_patch(&add).unwrap();
        assert_eq!(mapped.value, Some(json!({"id": "e1"})));
    }

    #[test]
    fn test_store_patch_reinserts_data_key() {
        let repo_side = RepoPatch {
            kind: ResourceKind::Steps,
            op: PatchOp::Replace,
            path: vec!["s1".into(), "note".into()],
            value: Some(json!("updated")),
        };
        let store_side = store_patch(&repo_side);
        assert_eq!(
            store_side.path,
            vec![
                PathSegment::key("steps"),
                PathSegment::key("s1"),
                PathSegment::key("data"),
                PathSegment::key("note")
            ]
        );
    }
}
