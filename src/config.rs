use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Only archive messages from this chat when set
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// Server-side long-poll wait for getUpdates
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_messages_path")]
    pub messages_path: PathBuf,
    #[serde(default = "default_cursor_path")]
    pub cursor_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    #[serde(default = "default_site_title")]
    pub title: String,
    /// IANA timezone name used for displayed times (e.g. "Asia/Shanghai")
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_items_per_page")]
    pub items_per_page: usize,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PublishConfig {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
}

impl PublishConfig {
    /// Publishing needs an owner, a repo and a token
    pub fn is_complete(&self) -> bool {
        !self.owner.trim().is_empty()
            && !self.repo.trim().is_empty()
            && !self.token.trim().is_empty()
    }
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_messages_path() -> PathBuf {
    PathBuf::from("data/messages.json")
}

fn default_cursor_path() -> PathBuf {
    PathBuf::from("data/last_update_id.txt")
}

fn default_site_title() -> String {
    "Telegram Message Archive".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_items_per_page() -> usize {
    50
}

fn default_output_path() -> PathBuf {
    PathBuf::from("index.html")
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: None,
            api_base: default_telegram_api_base(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            messages_path: default_messages_path(),
            cursor_path: default_cursor_path(),
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            title: default_site_title(),
            timezone: default_timezone(),
            items_per_page: default_items_per_page(),
            output_path: default_output_path(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (optional), then overlay environment
    /// variables and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay values from the environment. `lookup` returns the raw value of
    /// a variable, if set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.telegram.bot_token = token.trim().to_string();
        }

        if let Some(chat_id) = lookup("CHAT_ID") {
            let chat_id = chat_id.trim();
            self.telegram.chat_id = if chat_id.is_empty() {
                None
            } else {
                Some(
                    chat_id
                        .parse()
                        .with_context(|| format!("CHAT_ID must be an integer, got {:?}", chat_id))?,
                )
            };
        }

        if let Some(items) = lookup("ITEMS_PER_PAGE").filter(|v| !v.trim().is_empty()) {
            self.site.items_per_page = items.trim().parse().with_context(|| {
                format!("ITEMS_PER_PAGE must be a positive integer, got {:?}", items)
            })?;
        }

        if let Some(title) = lookup("SITE_TITLE").filter(|v| !v.trim().is_empty()) {
            self.site.title = title;
        }

        if let Some(timezone) = lookup("TIMEZONE").filter(|v| !v.trim().is_empty()) {
            self.site.timezone = timezone.trim().to_string();
        }

        let owner = lookup("REPO_OWNER").filter(|v| !v.trim().is_empty());
        let repo = lookup("REPO_NAME").filter(|v| !v.trim().is_empty());
        let token = lookup("TOKEN").filter(|v| !v.trim().is_empty());
        if owner.is_some() || repo.is_some() || token.is_some() {
            let publish = self.publish.get_or_insert_with(|| PublishConfig {
                branch: default_branch(),
                api_base: default_github_api_base(),
                ..Default::default()
            });
            if let Some(owner) = owner {
                publish.owner = owner.trim().to_string();
            }
            if let Some(repo) = repo {
                publish.repo = repo.trim().to_string();
            }
            if let Some(token) = token {
                publish.token = token.trim().to_string();
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!(
                "TELEGRAM_BOT_TOKEN environment variable (or [telegram] bot_token) is required"
            );
        }
        if self.site.items_per_page == 0 {
            anyhow::bail!("items_per_page must be at least 1");
        }
        Ok(())
    }

    /// The publish settings, if publishing is fully configured
    pub fn publish_config(&self) -> Option<&PublishConfig> {
        self.publish.as_ref().filter(|p| p.is_complete())
    }
}
