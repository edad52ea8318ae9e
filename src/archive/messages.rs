use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::{write_atomic, ArchiveStore, Message};

impl ArchiveStore {
    /// Load the persisted message log.
    /// A missing, empty or corrupt file yields an empty log.
    pub fn load_log(&self) -> Vec<Message> {
        let path = &self.messages_path;
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No message log at {}, starting empty", path.display());
                return Vec::new();
            }
            Err(e) => {
                warn!("Failed to read message log {}: {}", path.display(), e);
                return Vec::new();
            }
        };

        if content.trim().is_empty() {
            return Vec::new();
        }

        match serde_json::from_str(&content) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(
                    "Message log {} is corrupt, treating as empty: {}",
                    path.display(),
                    e
                );
                Vec::new()
            }
        }
    }

    /// Replace the persisted message log with `messages`
    pub fn save_log(&self, messages: &[Message]) -> Result<()> {
        let json =
            serde_json::to_string_pretty(messages).context("Failed to serialize message log")?;
        write_atomic(&self.messages_path, json.as_bytes())
            .with_context(|| format!("Failed to save message log: {}", self.messages_path.display()))
    }
}
