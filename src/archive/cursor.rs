use anyhow::{Context, Result};
use tracing::warn;

use super::{write_atomic, ArchiveStore};

impl ArchiveStore {
    /// Load the next update offset to request.
    /// Returns None when unset, unreadable, or not a positive integer.
    pub fn load_cursor(&self) -> Option<i64> {
        let path = &self.cursor_path;
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read cursor {}: {}", path.display(), e);
                return None;
            }
        };

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return None;
        }

        match trimmed.parse::<i64>() {
            // Offset 0 asks for the start of the stream, same as no offset
            Ok(cursor) if cursor > 0 => Some(cursor),
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "Cursor file {} is corrupt ({:?}), ignoring: {}",
                    path.display(),
                    trimmed,
                    e
                );
                None
            }
        }
    }

    /// Replace the persisted cursor
    pub fn save_cursor(&self, cursor: i64) -> Result<()> {
        write_atomic(&self.cursor_path, cursor.to_string().as_bytes())
            .with_context(|| format!("Failed to save cursor: {}", self.cursor_path.display()))
    }
}
