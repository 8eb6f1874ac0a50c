//! Body documents: one yrs text document per note.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, WriteTxn};

use super::sync::{self, DocMessage};
use super::CrdtError;
use crate::path::normalize_path;

const BODY_TEXT: &str = "body";

/// A local edit to a body document, ready to be sent to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyUpdate {
    pub path: String,
    pub update: Vec<u8>,
}

/// Result of handling an incoming body sync message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BodyOutcome {
    /// Encoded reply to send back on the same path.
    pub reply: Option<Vec<u8>>,
    /// Whether the body text changed.
    pub changed: bool,
}

pub struct BodyDocs {
    docs: Mutex<HashMap<String, Doc>>,
    updates: broadcast::Sender<BodyUpdate>,
}

impl BodyDocs {
    pub fn new(update_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            docs: Mutex::new(HashMap::new()),
            updates,
        }
    }

    /// Local edits made through [`BodyDocs::set_body`].
    pub fn subscribe_updates(&self) -> broadcast::Receiver<BodyUpdate> {
        self.updates.subscribe()
    }

    fn with_doc<R>(&self, path: &str, f: impl FnOnce(&Doc) -> R) -> R {
        let key = normalize_path(path);
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let doc = docs.entry(key).or_insert_with(Doc::new);
        f(doc)
    }

    /// Current body text; empty for a path with no document yet.
    pub fn body(&self, path: &str) -> String {
        let key = normalize_path(path);
        let docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(doc) = docs.get(&key) else {
            return String::new();
        };
        let txn = doc.transact();
        txn.get_text(BODY_TEXT)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Replace the body text, returning the update when anything changed.
    ///
    /// Only the differing middle section is rewritten so concurrent edits at
    /// the start or end of the note survive the merge.
    pub fn set_body(&self, path: &str, body: &str) -> Option<Vec<u8>> {
        let update = self.with_doc(path, |doc| {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(BODY_TEXT);
            let current = text.get_string(&txn);
            if current == body {
                return None;
            }

            let (start, removed, inserted) = splice(&current, body);
            if removed > 0 {
                text.remove_range(&mut txn, start as u32, removed as u32);
            }
            if !inserted.is_empty() {
                text.insert(&mut txn, start as u32, inserted);
            }
            Some(txn.encode_update_v1())
        })?;

        let _ = self.updates.send(BodyUpdate {
            path: normalize_path(path),
            update: update.clone(),
        });
        Some(update)
    }

    pub fn create_sync_step1(&self, path: &str) -> Vec<u8> {
        self.with_doc(path, |doc| DocMessage::SyncStep1(sync::state_vector(doc)).encode())
    }

    /// Answer a SyncStep1, or merge a SyncStep2/Update.
    pub fn handle_message(&self, path: &str, payload: &[u8]) -> Result<BodyOutcome, CrdtError> {
        let message = DocMessage::decode(payload)?;
        self.with_doc(path, |doc| match message {
            DocMessage::SyncStep1(sv) => {
                let diff = sync::encode_diff(doc, &sv)?;
                Ok(BodyOutcome {
                    reply: Some(DocMessage::SyncStep2(diff).encode()),
                    changed: false,
                })
            }
            DocMessage::SyncStep2(update) | DocMessage::Update(update) => {
                let before = sync::state_vector(doc);
                sync::apply_update(doc, &update)?;
                Ok(BodyOutcome {
                    reply: None,
                    changed: sync::state_vector(doc) != before,
                })
            }
        })
    }

    /// Drop the in-memory document for a path.
    pub fn forget(&self, path: &str) -> bool {
        let key = normalize_path(path);
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.remove(&key).is_some()
    }

    pub fn paths(&self) -> Vec<String> {
        let docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<String> = docs.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn clear(&self) {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.clear();
    }
}

/// Byte range of `old` to replace and the text to put there, trimmed to
/// the common prefix and suffix on char boundaries.
fn splice<'a>(old: &str, new: &'a str) -> (usize, usize, &'a str) {
    let prefix = old
        .char_indices()
        .zip(new.chars())
        .take_while(|((_, a), b)| a == b)
        .last()
        .map(|((idx, c), _)| idx + c.len_utf8())
        .unwrap_or(0);

    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old[prefix..]
        .chars()
        .rev()
        .zip(new[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(c, _)| c.len_utf8())
        .scan(0usize, |acc, len| {
            *acc += len;
            Some(*acc)
        })
        .take_while(|total| *total <= max_suffix)
        .last()
        .unwrap_or(0);

    let removed = old.len() - prefix - suffix;
    (prefix, removed, &new[prefix..new.len() - suffix])
}
