//! CRDT primitive consumed by the engine.
//!
//! The engine never merges fields itself. It reads and writes whole
//! [`FileMetadata`] records through [`WorkspaceCrdt`] and ships opaque update
//! bytes around; the field-level merge rule belongs to the implementation.
//! [`YrsWorkspace`] and [`BodyDocs`] are the yrs-backed implementations.

mod body;
mod sync;
mod workspace;

pub use body::{BodyDocs, BodyOutcome, BodyUpdate};
pub use sync::{
    apply_update, encode_diff, full_state, is_empty_update, state_vector, DocMessage,
    EMPTY_UPDATE_V1,
};
pub use workspace::YrsWorkspace;

use thiserror::Error;

use crate::types::FileMetadata;

#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("malformed CRDT payload: {0}")]
    Decode(String),

    #[error("failed to apply update: {0}")]
    Apply(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("failed to persist CRDT state: {0}")]
    Persist(String),
}

impl From<serde_json::Error> for CrdtError {
    fn from(e: serde_json::Error) -> Self {
        CrdtError::Serialization(e.to_string())
    }
}

/// Per-file metadata CRDT for one workspace.
///
/// Implementations are internally synchronized; the engine adds per-path
/// ordering on top (see `HierarchyBridge`).
pub trait WorkspaceCrdt: Send + Sync {
    fn get_file(&self, path: &str) -> Option<FileMetadata>;

    /// Overwrite the record at `path`, returning the encoded local update.
    fn set_file(&self, path: &str, metadata: &FileMetadata) -> Result<Vec<u8>, CrdtError>;

    /// All records, tombstones included when `include_deleted` is set.
    fn list_files(&self, include_deleted: bool) -> Vec<(String, FileMetadata)>;

    /// Full document state encoded as a single update.
    fn get_full_state(&self) -> Vec<u8>;

    /// Merge a remote update, returning the paths whose record changed.
    fn apply_remote_update(&self, update: &[u8]) -> Result<Vec<String>, CrdtError>;

    /// Durably persist the current state, if the implementation has storage.
    fn save_crdt_state(&self) -> Result<(), CrdtError>;

    /// Encoded [`DocMessage::SyncStep1`] describing what this replica has.
    fn create_sync_step1(&self) -> Vec<u8>;

    /// Update containing everything the holder of `state_vector` is missing.
    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError>;
}
