use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Metadata record for one file, keyed by its normalized path.
///
/// `contents` and `part_of` are mutated independently; the hierarchy bridge
/// keeps them consistent by convention only. Files are never removed from
/// the CRDT, `deleted` is a tombstone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMetadata {
    pub title: Option<String>,
    /// Path of the parent index file.
    pub part_of: Option<String>,
    /// Ordered child paths.
    pub contents: Vec<String>,
    pub attachments: Vec<BinaryRef>,
    pub deleted: bool,
    pub audience: Vec<String>,
    pub description: Option<String>,
    /// Frontmatter keys the engine does not interpret.
    pub extra: BTreeMap<String, Value>,
    pub modified_at: u64,
}

impl FileMetadata {
    pub fn with_title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Same record with every field equal except `modified_at`.
    pub fn same_content_as(&self, other: &FileMetadata) -> bool {
        let mut a = self.clone();
        a.modified_at = other.modified_at;
        a == *other
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// Reference to attachment bytes stored outside the CRDT.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryRef {
    pub path: String,
    pub source: String,
    /// Lowercase hex SHA-256 of the bytes.
    pub hash: String,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_at: u64,
    pub deleted: bool,
}

impl BinaryRef {
    /// Build a reference for freshly uploaded bytes.
    pub fn for_bytes(
        path: impl Into<String>,
        source: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: &[u8],
    ) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            hash: hash_bytes(bytes),
            mime_type: mime_type.into(),
            size: bytes.len() as u64,
            uploaded_at: now_millis(),
            deleted: false,
        }
    }

    /// Whether `bytes` are the content this reference describes.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        self.size == bytes.len() as u64 && self.hash.eq_ignore_ascii_case(&hash_bytes(bytes))
    }
}

/// Lowercase hex SHA-256.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Partial update for [`FileMetadata`].
///
/// Present fields overwrite, `extra` merges key by key (a `Value::Null`
/// removes the key).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub title: Option<Option<String>>,
    pub part_of: Option<Option<String>>,
    pub contents: Option<Vec<String>>,
    pub attachments: Option<Vec<BinaryRef>>,
    pub deleted: Option<bool>,
    pub audience: Option<Vec<String>>,
    pub description: Option<Option<String>>,
    pub extra: BTreeMap<String, Value>,
    /// Replace `extra` wholesale instead of merging key by key.
    pub replace_extra: bool,
}

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(Some(title.into()));
        self
    }

    pub fn part_of(mut self, parent: Option<String>) -> Self {
        self.part_of = Some(parent);
        self
    }

    pub fn contents(mut self, contents: Vec<String>) -> Self {
        self.contents = Some(contents);
        self
    }

    pub fn attachments(mut self, attachments: Vec<BinaryRef>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = Some(deleted);
        self
    }

    pub fn audience(mut self, audience: Vec<String>) -> Self {
        self.audience = Some(audience);
        self
    }

    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Use `extra` as the complete set of open keys.
    pub fn replace_extra(mut self, extra: BTreeMap<String, Value>) -> Self {
        self.extra = extra;
        self.replace_extra = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge the patch over `base`. Does not touch `modified_at`.
    pub fn apply_to(self, base: &mut FileMetadata) {
        if let Some(title) = self.title {
            base.title = title;
        }
        if let Some(part_of) = self.part_of {
            base.part_of = part_of;
        }
        if let Some(contents) = self.contents {
            base.contents = contents;
        }
        if let Some(attachments) = self.attachments {
            base.attachments = attachments;
        }
        if let Some(deleted) = self.deleted {
            base.deleted = deleted;
        }
        if let Some(audience) = self.audience {
            base.audience = audience;
        }
        if let Some(description) = self.description {
            base.description = description;
        }
        if self.replace_extra {
            base.extra.clear();
        }
        for (key, value) in self.extra {
            if value.is_null() {
                base.extra.remove(&key);
            } else {
                base.extra.insert(key, value);
            }
        }
    }
}
