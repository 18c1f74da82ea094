//! # Easel Sync
//!
//! Server synchronization and peer presence for Easel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ client: ResourceClient / AssetClient traits │
//! │  - the out-of-scope REST surface            │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ repository: canonical mirror + push queue   │
//! │  - optimistic commits, ordered pushes       │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ coordinator: store ↔ repository wiring      │
//! │  - path mapping, remote replay,             │
//! │    feedback-loop prevention, media uploads  │
//! └─────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────┐
//! │ presence: peer channel (ephemeral only)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Server authority**: remote patches replay with the `server`
//!    source and are never recorded for undo or pushed back
//! 2. **Optimistic locally**: local commits apply before confirmation and
//!    are kept on push failure; reconciliation is an explicit refresh
//! 3. **Ordered pushes**: one FIFO queue per document, one batch in
//!    flight at a time
//! 4. **Presence stays ephemeral**: cursor traffic never touches the
//!    patch/undo pipeline

mod client;
mod coordinator;
mod errors;
mod presence;
mod repository;

use easel_editor::HistoryOptions;

pub use client::{AssetClient, ClientError, DocumentBundle, MemoryClient, ResourceClient};
pub use coordinator::{Coordinator, ManualRefresh, RefreshGate};
pub use errors::SyncError;
pub use presence::{
    PeerMessage, PeerTransport, PresenceChannel, PresenceOptions, RecordingTransport,
    PRESENCE_PALETTE,
};
pub use repository::{
    PushBatch, RepoPatch, Repository, RepositoryState, ResourceKind, WirePatchError,
};

/// Construction-time tuning for a [`Coordinator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub history: HistoryOptions,
    pub presence: PresenceOptions,
}
