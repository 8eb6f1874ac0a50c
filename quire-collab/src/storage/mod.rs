//! Relay persistence.
//!
//! ```text
//! ┌─────────────┐  room closes   ┌───────────────┐
//! │ RelayServer │ ─────────────► │ SnapshotStore │
//! │ (in-memory) │                │ (RocksDB)     │
//! └──────┬──────┘                └──────┬────────┘
//!        │ first peer joins             │ column families
//!        ▼                              ▼
//! ┌─────────────┐     ┌──────────────────────────────────┐
//! │ yrs Doc per │     │ CF "documents": LZ4 snapshots     │
//! │ frame key   │     │ CF "metadata":  bincode records   │
//! └─────────────┘     └──────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{SnapshotMetadata, SnapshotStore, StoreConfig, StoreError};
