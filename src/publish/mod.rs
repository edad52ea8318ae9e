pub mod github;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::archive::ArchiveStore;
use crate::config::Config;

/// A remote file store addressed by repository-relative paths
#[async_trait]
pub trait ContentApi {
    /// Version marker of the remote file, or None if it does not exist yet
    async fn file_sha(&self, path: &str) -> Result<Option<String>>;

    /// Create or replace a remote file. `sha` must be the current marker when
    /// replacing.
    async fn put_file(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
        sha: Option<&str>,
    ) -> Result<()>;
}

/// A local file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub commit_message: String,
}

impl PublishTarget {
    pub fn new(local_path: &Path, commit_message: &str) -> Self {
        Self {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path_for(local_path),
            commit_message: commit_message.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PublishReport {
    pub published: Vec<String>,
    /// Remote path and error for each file that could not be published
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Repository-relative path with forward slashes
fn remote_path_for(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let trimmed = raw.trim_start_matches("./").trim_start_matches('/');
    trimmed.to_string()
}

/// Files worth publishing: the log (only when it holds messages), the
/// cursor and the page, each only if it exists locally.
pub fn publish_targets(config: &Config) -> Vec<PublishTarget> {
    let store = ArchiveStore::from_config(&config.storage);
    let mut targets = Vec::new();

    if store.messages_path().exists() && !store.load_log().is_empty() {
        targets.push(PublishTarget::new(
            store.messages_path(),
            "Update Telegram messages",
        ));
    }

    if store.cursor_path().exists() {
        targets.push(PublishTarget::new(
            store.cursor_path(),
            "Update last update ID",
        ));
    }

    if config.site.output_path.exists() {
        targets.push(PublishTarget::new(
            &config.site.output_path,
            "Update message archive page",
        ));
    }

    targets
}

async fn publish_one<A: ContentApi + ?Sized>(api: &A, target: &PublishTarget) -> Result<()> {
    let content = std::fs::read(&target.local_path)
        .with_context(|| format!("Failed to read {}", target.local_path.display()))?;

    let sha = api
        .file_sha(&target.remote_path)
        .await
        .with_context(|| format!("Failed to look up {}", target.remote_path))?;

    api.put_file(
        &target.remote_path,
        &content,
        &target.commit_message,
        sha.as_deref(),
    )
    .await
    .with_context(|| format!("Failed to upload {}", target.remote_path))
}

/// Upload every target. A failure only affects its own file.
pub async fn publish_files<A: ContentApi + ?Sized>(
    api: &A,
    targets: &[PublishTarget],
) -> PublishReport {
    let mut report = PublishReport::default();

    if targets.is_empty() {
        info!("No files need publishing");
        return report;
    }

    for target in targets {
        match publish_one(api, target).await {
            Ok(()) => {
                info!("Published {}", target.remote_path);
                report.published.push(target.remote_path.clone());
            }
            Err(e) => {
                error!("Failed to publish {}: {:#}", target.remote_path, e);
                report
                    .failed
                    .push((target.remote_path.clone(), format!("{:#}", e)));
            }
        }
    }

    report
}
