//! yrs-backed workspace metadata document.
//!
//! One root map `files` keyed by normalized path. Each record is a nested
//! map with one entry per [`FileMetadata`] field, holding that field's JSON
//! encoding. Writes only touch fields whose value changed, so concurrent
//! edits to different fields of one file both survive; edits to the same
//! field resolve last-writer-wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, Transact, WriteTxn};

use super::sync::{self, DocMessage};
use super::{CrdtError, WorkspaceCrdt};
use crate::types::FileMetadata;

const FILES_MAP: &str = "files";

pub struct YrsWorkspace {
    doc: Doc,
    /// Where `save_crdt_state` writes the LZ4-compressed state (None = memory only).
    snapshot_path: Option<PathBuf>,
}

impl YrsWorkspace {
    /// In-memory workspace document.
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            snapshot_path: None,
        }
    }

    /// Workspace document persisted at `path`, loading prior state if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CrdtError> {
        let path = path.into();
        let workspace = Self {
            doc: Doc::new(),
            snapshot_path: Some(path.clone()),
        };

        if path.exists() {
            let compressed =
                std::fs::read(&path).map_err(|e| CrdtError::Persist(e.to_string()))?;
            let state = lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| CrdtError::Persist(e.to_string()))?;
            sync::apply_update(&workspace.doc, &state)?;
            log::info!(
                "Loaded workspace CRDT state from {} ({} bytes)",
                path.display(),
                state.len()
            );
        }

        Ok(workspace)
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Raw field entries per path, used to detect which paths a remote
    /// update touched.
    fn raw_entries(&self) -> BTreeMap<String, RawRecord> {
        let txn = self.doc.transact();
        let mut entries = BTreeMap::new();
        if let Some(files) = txn.get_map(FILES_MAP) {
            for (key, value) in files.iter(&txn) {
                if let Some(record) = raw_record(&txn, value) {
                    entries.insert(key.to_string(), record);
                }
            }
        }
        entries
    }

    fn decode_record(path: &str, record: RawRecord) -> Option<FileMetadata> {
        let mut fields = serde_json::Map::new();
        for (field, json) in record {
            match serde_json::from_str::<Value>(&json) {
                Ok(value) => {
                    fields.insert(field, value);
                }
                Err(e) => log::warn!("Ignoring undecodable field {field} of {path}: {e}"),
            }
        }
        match serde_json::from_value(Value::Object(fields)) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!("Ignoring undecodable metadata record for {path}: {e}");
                None
            }
        }
    }
}

/// Field name to JSON-encoded value.
type RawRecord = BTreeMap<String, String>;

fn raw_record<T: ReadTxn>(txn: &T, value: Out) -> Option<RawRecord> {
    let Out::YMap(record) = value else {
        return None;
    };
    Some(
        record
            .iter(txn)
            .filter_map(|(field, value)| match value {
                Out::Any(Any::String(json)) => Some((field.to_string(), json.to_string())),
                _ => None,
            })
            .collect(),
    )
}

/// Split a record into `(field, json)` pairs.
fn encode_fields(metadata: &FileMetadata) -> Result<Vec<(String, String)>, CrdtError> {
    match serde_json::to_value(metadata)? {
        Value::Object(fields) => Ok(fields
            .into_iter()
            .map(|(field, value)| (field, value.to_string()))
            .collect()),
        other => Err(CrdtError::Serialization(format!(
            "metadata encoded as {other}, expected an object"
        ))),
    }
}

impl Default for YrsWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceCrdt for YrsWorkspace {
    fn get_file(&self, path: &str) -> Option<FileMetadata> {
        let record = {
            let txn = self.doc.transact();
            let files = txn.get_map(FILES_MAP)?;
            raw_record(&txn, files.get(&txn, path)?)?
        };
        Self::decode_record(path, record)
    }

    fn set_file(&self, path: &str, metadata: &FileMetadata) -> Result<Vec<u8>, CrdtError> {
        let fields = encode_fields(metadata)?;
        let mut txn = self.doc.transact_mut();
        let files = txn.get_or_insert_map(FILES_MAP);
        let record: MapRef = files.get_or_init(&mut txn, path);

        let stale: Vec<String> = record
            .keys(&txn)
            .filter(|key| !fields.iter().any(|(field, _)| field.as_str() == *key))
            .map(str::to_string)
            .collect();
        for key in stale {
            record.remove(&mut txn, &key);
        }
        // Unchanged fields are left alone so a concurrent edit to them wins.
        for (field, json) in fields {
            record.try_update(&mut txn, field, json);
        }
        Ok(txn.encode_update_v1())
    }

    fn list_files(&self, include_deleted: bool) -> Vec<(String, FileMetadata)> {
        self.raw_entries()
            .into_iter()
            .filter_map(|(path, record)| {
                let meta = Self::decode_record(&path, record)?;
                (include_deleted || !meta.deleted).then_some((path, meta))
            })
            .collect()
    }

    fn get_full_state(&self) -> Vec<u8> {
        sync::full_state(&self.doc)
    }

    fn apply_remote_update(&self, update: &[u8]) -> Result<Vec<String>, CrdtError> {
        let before = self.raw_entries();
        sync::apply_update(&self.doc, update)?;
        let after = self.raw_entries();

        Ok(after
            .into_iter()
            .filter(|(path, record)| before.get(path) != Some(record))
            .map(|(path, _)| path)
            .collect())
    }

    fn save_crdt_state(&self) -> Result<(), CrdtError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let state = self.get_full_state();
        let compressed = lz4_flex::compress_prepend_size(&state);

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| CrdtError::Persist(e.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &compressed).map_err(|e| CrdtError::Persist(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| CrdtError::Persist(e.to_string()))?;

        log::debug!(
            "Saved workspace CRDT state to {} ({} -> {} bytes)",
            path.display(),
            state.len(),
            compressed.len()
        );
        Ok(())
    }

    fn create_sync_step1(&self) -> Vec<u8> {
        DocMessage::SyncStep1(sync::state_vector(&self.doc)).encode()
    }

    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        sync::encode_diff(&self.doc, state_vector)
    }
}
