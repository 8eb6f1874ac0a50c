use thiserror::Error;

use crate::crdt::CrdtError;
use crate::frontmatter::FrontmatterError;
use crate::fs::FsError;

/// Errors surfaced by the workspace engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A mutation reached the engine before `init_workspace` or after
    /// `teardown`. Caller-ordering bug, never retried.
    #[error("workspace engine is not initialized")]
    NotInitialized,

    #[error("CRDT error: {0}")]
    Crdt(#[from] CrdtError),

    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("frontmatter error: {0}")]
    Frontmatter(#[from] FrontmatterError),

    #[error("no metadata for {0}")]
    MissingFile(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
