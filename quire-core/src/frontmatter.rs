//! Markdown frontmatter codec.
//!
//! Notes carry TOML frontmatter between `+++` fences:
//!
//! ```text
//! +++
//! title = "March"
//! part_of = "journal/index.md"
//! mood = "calm"          # unknown keys land in `extra`
//! +++
//! Body text...
//! ```
//!
//! This is the only place untyped frontmatter is turned into
//! [`Frontmatter`]; everything past this boundary uses the typed record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{BinaryRef, FileMetadata, MetadataPatch};

const FENCE: &str = "+++";

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("frontmatter opened with +++ but never closed")]
    Unterminated,

    #[error("invalid frontmatter TOML: {0}")]
    Toml(String),

    #[error("frontmatter field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("failed to render frontmatter: {0}")]
    Render(String),
}

/// Typed view of the frontmatter fields a note can carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontmatter {
    pub title: Option<String>,
    pub part_of: Option<String>,
    pub contents: Vec<String>,
    pub audience: Vec<String>,
    pub description: Option<String>,
    pub attachments: Vec<BinaryRef>,
    pub extra: BTreeMap<String, Value>,
}

impl Frontmatter {
    pub fn from_metadata(meta: &FileMetadata) -> Self {
        Self {
            title: meta.title.clone(),
            part_of: meta.part_of.clone(),
            contents: meta.contents.clone(),
            audience: meta.audience.clone(),
            description: meta.description.clone(),
            attachments: meta.attachments.clone(),
            extra: meta.extra.clone(),
        }
    }

    /// Patch that makes a record match this frontmatter exactly.
    ///
    /// Writing a note also revives a tombstoned record.
    pub fn into_patch(self) -> MetadataPatch {
        MetadataPatch {
            title: Some(self.title),
            part_of: Some(self.part_of),
            contents: Some(self.contents),
            attachments: Some(self.attachments),
            deleted: Some(false),
            audience: Some(self.audience),
            description: Some(self.description),
            ..MetadataPatch::default()
        }
        .replace_extra(self.extra)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub frontmatter: Frontmatter,
    pub body: String,
    /// Whether the content had a `+++` block at all.
    pub has_frontmatter: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AttachmentEntry {
    Path(String),
    Full(BinaryRef),
}

/// Split `content` into its frontmatter block and body.
fn split(content: &str) -> Result<Option<(&str, &str)>, FrontmatterError> {
    let Some(rest) = content.strip_prefix(FENCE) else {
        return Ok(None);
    };
    let Some(rest) = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
    else {
        // `+++text` on the first line is body, not a fence.
        return Ok(None);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == FENCE {
            return Ok(Some((&rest[..offset], &rest[offset + line.len()..])));
        }
        offset += line.len();
    }
    Err(FrontmatterError::Unterminated)
}

fn string_field(
    table: &mut toml::Table,
    field: &'static str,
) -> Result<Option<String>, FrontmatterError> {
    match table.remove(field) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(FrontmatterError::InvalidField {
            field,
            expected: "a string",
        }),
    }
}

/// Accepts a single string as a one-element list.
fn string_list_field(
    table: &mut toml::Table,
    field: &'static str,
) -> Result<Vec<String>, FrontmatterError> {
    let invalid = FrontmatterError::InvalidField {
        field,
        expected: "a string or an array of strings",
    };
    match table.remove(field) {
        None => Ok(Vec::new()),
        Some(toml::Value::String(s)) => Ok(vec![s]),
        Some(toml::Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                toml::Value::String(s) => Ok(s),
                _ => Err(FrontmatterError::InvalidField {
                    field,
                    expected: "an array of strings",
                }),
            })
            .collect(),
        Some(_) => Err(invalid),
    }
}

fn attachments_field(table: &mut toml::Table) -> Result<Vec<BinaryRef>, FrontmatterError> {
    let Some(value) = table.remove("attachments") else {
        return Ok(Vec::new());
    };
    let json = serde_json::to_value(&value).map_err(|e| FrontmatterError::Toml(e.to_string()))?;
    let entries: Vec<AttachmentEntry> =
        serde_json::from_value(json).map_err(|_| FrontmatterError::InvalidField {
            field: "attachments",
            expected: "an array of paths or attachment tables",
        })?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            AttachmentEntry::Path(path) => BinaryRef {
                path,
                ..BinaryRef::default()
            },
            AttachmentEntry::Full(reference) => reference,
        })
        .collect())
}

pub fn parse(content: &str) -> Result<ParsedFile, FrontmatterError> {
    let Some((block, body)) = split(content)? else {
        return Ok(ParsedFile {
            frontmatter: Frontmatter::default(),
            body: content.to_string(),
            has_frontmatter: false,
        });
    };

    let mut table: toml::Table =
        toml::from_str(block).map_err(|e| FrontmatterError::Toml(e.to_string()))?;

    let frontmatter = Frontmatter {
        title: string_field(&mut table, "title")?,
        part_of: string_field(&mut table, "part_of")?,
        contents: string_list_field(&mut table, "contents")?,
        audience: string_list_field(&mut table, "audience")?,
        description: string_field(&mut table, "description")?,
        attachments: attachments_field(&mut table)?,
        extra: table
            .into_iter()
            .map(|(key, value)| {
                serde_json::to_value(&value)
                    .map(|v| (key, v))
                    .map_err(|e| FrontmatterError::Toml(e.to_string()))
            })
            .collect::<Result<_, _>>()?,
    };

    Ok(ParsedFile {
        frontmatter,
        body: body.to_string(),
        has_frontmatter: true,
    })
}

/// Strip nulls recursively; TOML has no null.
fn without_nulls(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(without_nulls).collect(),
        )),
        Value::Object(map) => Some(Value::Object(
            map.iter()
                .filter_map(|(k, v)| without_nulls(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
        other => Some(other.clone()),
    }
}

fn to_toml<T: Serialize>(value: &T) -> Result<toml::Value, FrontmatterError> {
    let json = serde_json::to_value(value).map_err(|e| FrontmatterError::Render(e.to_string()))?;
    let json = without_nulls(&json).unwrap_or(Value::Null);
    toml::Value::deserialize(json).map_err(|e| FrontmatterError::Render(e.to_string()))
}

/// Render a note: frontmatter block (omitted when empty) followed by the body.
pub fn render(frontmatter: &Frontmatter, body: &str) -> Result<String, FrontmatterError> {
    let mut table = toml::Table::new();
    if let Some(title) = &frontmatter.title {
        table.insert("title".into(), toml::Value::String(title.clone()));
    }
    if let Some(description) = &frontmatter.description {
        table.insert("description".into(), toml::Value::String(description.clone()));
    }
    if let Some(part_of) = &frontmatter.part_of {
        table.insert("part_of".into(), toml::Value::String(part_of.clone()));
    }
    if !frontmatter.contents.is_empty() {
        table.insert("contents".into(), to_toml(&frontmatter.contents)?);
    }
    if !frontmatter.audience.is_empty() {
        table.insert("audience".into(), to_toml(&frontmatter.audience)?);
    }
    if !frontmatter.attachments.is_empty() {
        table.insert("attachments".into(), to_toml(&frontmatter.attachments)?);
    }
    for (key, value) in &frontmatter.extra {
        if value.is_null() {
            continue;
        }
        table.insert(key.clone(), to_toml(value)?);
    }

    if table.is_empty() {
        return Ok(body.to_string());
    }
    let block = toml::to_string(&table).map_err(|e| FrontmatterError::Render(e.to_string()))?;
    Ok(format!("{FENCE}\n{block}{FENCE}\n{body}"))
}

/// Render a note straight from its CRDT record.
pub fn render_metadata(meta: &FileMetadata, body: &str) -> Result<String, FrontmatterError> {
    render(&Frontmatter::from_metadata(meta), body)
}
