//! Workspace-relative path handling.
//!
//! A file's path is its identity in the CRDT, in the lock table and in the
//! sync-write suppression set, so every entry point funnels through
//! [`normalize_path`] before using a path as a key:
//!
//! ```text
//! "README.md"      ─┐
//! "./README.md"    ─┼──► "README.md"
//! "/README.md"     ─┘
//! "notes\\a//./b.md" ──► "notes/a/b.md"
//! ```

/// Suffixes produced by the safe-write swap. Never user content.
pub const TEMP_SUFFIXES: &[&str] = &[".tmp", ".bak", ".swap"];

/// Normalize a workspace path into its canonical key form.
///
/// Backslashes become `/`, empty and `.` segments are dropped, and the result
/// carries no leading or trailing separator. `..` segments pop the previous
/// segment; a `..` that would escape the workspace root is discarded.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();

    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    segments.join("/")
}

/// Directory part of a normalized path (`""` for files at the root).
pub fn parent_dir(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(idx) => normalized[..idx].to_string(),
        None => String::new(),
    }
}

/// Final segment of a path.
pub fn file_name(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(idx) => normalized[idx + 1..].to_string(),
        None => normalized,
    }
}

/// Join a directory and a relative path, normalizing the result.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        normalize_path(name)
    } else {
        normalize_path(&format!("{dir}/{name}"))
    }
}

/// Whether the path is an artifact of the safe-write swap (`.tmp`, `.bak`, `.swap`).
pub fn is_temp_artifact(path: &str) -> bool {
    TEMP_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// Whether the path names a markdown note.
pub fn is_markdown(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".md") || lower.ends_with(".markdown")
}
