//! # Easel Model
//!
//! The document view-model and patch engine for Easel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ resources: persisted DTOs (Element, ...)    │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ state: CanvasState view-model               │
//! │  - persisted DTO under the `data` key       │
//! │  - transient UI fields as siblings          │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ patch: diff / apply / invert                │
//! │  - {op, path, value} batches, forward +     │
//! │    inverse pairs                            │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Ids over references**: cross-references (selection, group
//!    membership, step targets, connector endpoints) are stable string ids
//!    resolved through lookup maps, so deletion invalidation is a simple
//!    existence check.
//! 2. **One snapshot**: `CanvasState` is the full document state; it is
//!    only mutated by the store's dispatch cycle.
//! 3. **Patches are derived**: a mutation is described by diffing the
//!    serialized state before and after; the wire shape of a patch is
//!    stable across client versions sharing a document.

mod geometry;
mod resources;
mod state;

pub mod patch;

pub use geometry::{Bounds, Point};
pub use patch::{diff, Patch, PatchError, PatchOp, PatchPair, PathSegment};
pub use resources::{
    Connector, DocumentMeta, Element, ElementKind, Group, MediaSource, Step,
};
pub use state::{
    CanvasState, Collaborator, ConnectorState, DocumentState, DragPreview, EditMode,
    ElementState, GroupState, Selection, StateError, StepState, Viewport,
};
