//! Error types for the editor.

use easel_model::PatchError;
use thiserror::Error;

/// A command's validation or application failed. The dispatch that carried
/// the command is aborted as a whole; the draft is discarded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("connector not found: {0}")]
    ConnectorNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("{kind} already exists: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("connector {connector} endpoint does not exist: {element}")]
    MissingEndpoint { connector: String, element: String },

    #[error("element {element} already belongs to group {group}")]
    AlreadyGrouped { element: String, group: String },

    #[error("merge must not change the id (expected {expected}, found {found})")]
    IdMismatch { expected: String, found: String },

    #[error("no drag in progress for element {0}")]
    NoActiveDrag(String),

    #[error("patch application failed: {0}")]
    Patch(#[from] PatchError),

    #[error("malformed merge data: {0}")]
    Codec(String),
}

/// Store-level failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("command failed: {0}")]
    Command(#[from] CommandError),

    #[error("state serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
}
