//! Local-first sync engine for a markdown journal workspace.
//!
//! ```text
//!   SyncEngine (one per open workspace)
//!     │
//!     ├─ SyncFileSystem ── events ──► EventBus
//!     │     │  suppression brackets, safe-write swap
//!     │     ▼
//!     ├─ HierarchyBridge ── per-path locks, parent/child bookkeeping
//!     │     │
//!     │     ▼
//!     ├─ MetadataStore ──► WorkspaceCrdt (yrs)
//!     │
//!     └─ BodyDocs (one yrs text doc per note)
//! ```
//!
//! Network transport lives in `quire-collab`; this crate only produces and
//! consumes opaque update bytes.

pub mod bridge;
pub mod crdt;
pub mod engine;
pub mod error;
pub mod events;
pub mod frontmatter;
pub mod fs;
pub mod lock;
pub mod path;
pub mod store;
pub mod types;

pub use bridge::{HierarchyBridge, HierarchyIssue};
pub use crdt::{BodyDocs, CrdtError, DocMessage, WorkspaceCrdt, YrsWorkspace};
pub use engine::{SyncEngine, WorkspaceOptions};
pub use error::{CoreError, Result};
pub use events::{EventBus, EventSubscription, FileEvent};
pub use fs::{DiskFs, FileSystem, FsError, MemoryFs, SyncFileSystem};
pub use path::normalize_path;
pub use store::MetadataStore;
pub use types::{BinaryRef, FileMetadata, MetadataPatch};
