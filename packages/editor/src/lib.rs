//! # Easel Editor
//!
//! The document store and undo engine for Easel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ command: semantic operations                │
//! │  - create/update/delete per resource        │
//! │  - cross-cutting reference cleanup          │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ store: snapshot + dispatch + subscribe      │
//! │  - one draft per dispatch, one patch batch  │
//! │  - forward/inverse pair per change          │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ history: per-mode undo/redo stacks          │
//! │  - sanitized inverse batches                │
//! │  - stale entries skipped, never resurrected │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Snapshot is source of truth**: readers get immutable references;
//!    only a command executing inside dispatch produces a new snapshot
//! 2. **Atomic dispatch**: all commands in one call apply against a single
//!    draft and yield exactly one combined patch batch, or nothing
//! 3. **Undo survives collaboration**: remote changes are not undoable, and
//!    entries invalidated by remote deletions are skipped instead of
//!    resurrecting dead entities

mod command;
mod errors;
mod history;
mod store;
mod views;

pub use command::Command;
pub use errors::{CommandError, StoreError};
pub use history::{History, HistoryOptions, HistoryScope, HistoryStatus};
pub use store::{Change, Dispatch, DispatchOptions, Source, Store, SubscriptionId};
pub use views::{
    ConnectorsView, DocumentView, ElementsView, GroupsView, StepsView, Views,
};
