//! Error types for the sync layer.

use thiserror::Error;

use easel_editor::StoreError;
use easel_model::PatchError;

use crate::client::ClientError;
use crate::repository::WirePatchError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("client request failed: {0}")]
    Client(#[from] ClientError),

    #[error("store rejected a change: {0}")]
    Store(#[from] StoreError),

    #[error("repository patch failed: {0}")]
    Patch(#[from] PatchError),

    #[error("malformed wire patch: {0}")]
    Wire(#[from] WirePatchError),

    #[error("serialization failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// An aborted request is a clean no-op, never surfaced to the user.
    #[error("operation aborted")]
    Aborted,
}
