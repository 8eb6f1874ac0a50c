//! # quire-collab: Network sync for quire workspaces
//!
//! One WebSocket per workspace carries the metadata document and every open
//! note body, each frame tagged with its path.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   framed binary    ┌─────────────┐
//! │ SyncSession  │ ◄────────────────► │ RelayServer │
//! │ (per device) │   + JSON control   │ (rooms)     │
//! └──────┬───────┘                    └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────────────┐            ┌────────────────┐
//! │ MultiplexedBodySync  │            │ yrs Doc per key│
//! │ queue, focus, resync │            │ BroadcastGroup │
//! └──────────────────────┘            └───────┬────────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │ SnapshotStore │
//!                                     │ (RocksDB)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Frame codec, control and share messages, join codes
//! - [`queue`]: Offline send queue
//! - [`body_sync`]: Multiplexed connection with reconnect and subscriptions
//! - [`transfer`]: Chunked, hash-checked binary attachments
//! - [`session`]: Binds a workspace engine to a connection
//! - [`share`]: Live host/guest sessions
//! - [`broadcast`]: Per-room fan-out
//! - [`server`]: The relay
//! - [`storage`]: Relay snapshots

pub mod body_sync;
pub mod broadcast;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod share;
pub mod storage;
pub mod transfer;

// Re-exports for convenience
pub use body_sync::{
    BodySyncConfig, ConnectionState, MessageHandler, MultiplexedBodySync, SubscriptionStatus,
    SyncStepSource, SyncedHandler,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerInfo, RelayFrame, RelayPayload};
pub use protocol::{
    frame_message, unframe_message, validate_join_code, ControlMessage, ProtocolError,
    ShareMessage, BLOB_PREFIX, WORKSPACE_KEY,
};
pub use queue::{QueuedMessage, SendQueue};
pub use server::{generate_join_code, RelayServer, ServerConfig, ServerStats};
pub use session::{ReceivedBlob, SessionRole, SyncSession};
pub use share::{SessionInfo, ShareConfig, ShareError, ShareEvent, ShareSession, ShareState};
pub use storage::{SnapshotMetadata, SnapshotStore, StoreConfig, StoreError};
pub use transfer::{chunk_blob, ChunkHeader, TransferAssembler, DEFAULT_CHUNK_SIZE};
