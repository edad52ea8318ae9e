pub mod cursor;
pub mod messages;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::StorageConfig;

/// A message as stored in the archive log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat_id: i64,
    /// Channel posts carry no sender, so this may be null
    pub sender_id: Option<i64>,
    pub sender_name: String,
    pub text: String,
    /// Send time reported by Telegram, seconds since epoch
    pub timestamp: i64,
    /// When this run ingested the message (RFC 3339, UTC)
    pub processed_at: String,
}

/// File-backed store for the message log and the update cursor.
///
/// Reads fail soft: missing or corrupt files come back as an empty log or
/// an absent cursor. Writes replace the whole file through a rename, so a
/// later read never sees a half-written artifact.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    messages_path: PathBuf,
    cursor_path: PathBuf,
}

impl ArchiveStore {
    pub fn new(messages_path: impl Into<PathBuf>, cursor_path: impl Into<PathBuf>) -> Self {
        Self {
            messages_path: messages_path.into(),
            cursor_path: cursor_path.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.messages_path, &config.cursor_path)
    }

    pub fn messages_path(&self) -> &Path {
        &self.messages_path
    }

    pub fn cursor_path(&self) -> &Path {
        &self.cursor_path
    }
}

/// The dedup key space of a log
pub fn message_ids(messages: &[Message]) -> HashSet<i64> {
    messages.iter().map(|m| m.message_id).collect()
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&tmp_path, bytes)
        .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e).with_context(|| format!("Failed to replace {}", path.display()));
    }

    Ok(())
}
