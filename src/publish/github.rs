use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::ContentApi;
use crate::config::PublishConfig;

#[derive(Debug, Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
}

/// Writes files into a GitHub repository through the contents API
pub struct GithubContents {
    client: reqwest::Client,
    config: PublishConfig,
}

impl GithubContents {
    pub fn new(config: PublishConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(Self::headers(&config.token)?)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    fn headers(token: &str) -> Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_static("tgarchive"));
        h.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github.v3+json"),
        );
        let mut auth = HeaderValue::from_str(&format!("token {}", token))
            .context("Invalid GitHub token")?;
        auth.set_sensitive(true);
        h.insert(AUTHORIZATION, auth);
        Ok(h)
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path.trim_start_matches('/')
        )
    }
}

fn put_request<'a>(
    content: &[u8],
    message: &'a str,
    branch: &'a str,
    sha: Option<&'a str>,
) -> PutContentsRequest<'a> {
    PutContentsRequest {
        message,
        content: base64::engine::general_purpose::STANDARD.encode(content),
        branch,
        sha,
    }
}

#[async_trait]
impl ContentApi for GithubContents {
    async fn file_sha(&self, path: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.contents_url(path))
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .await
            .context("Failed to send request to GitHub")?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("{} does not exist remotely yet", path);
            return Ok(None);
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error ({}): {}", status, error_body);
        }

        let contents: ContentsResponse = response
            .json()
            .await
            .context("Failed to parse GitHub contents response")?;
        Ok(Some(contents.sha))
    }

    async fn put_file(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
        sha: Option<&str>,
    ) -> Result<()> {
        let request = put_request(content, message, &self.config.branch, sha);

        let response = self
            .client
            .put(self.contents_url(path))
            .json(&request)
            .send()
            .await
            .context("Failed to send request to GitHub")?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error ({}): {}", status, error_body);
        }

        Ok(())
    }
}
