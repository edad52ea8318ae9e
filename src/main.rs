mod archive;
mod config;
mod fetcher;
mod publish;
mod render;
mod telegram;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::archive::ArchiveStore;
use crate::config::Config;
use crate::fetcher::{Fetcher, RunResult};
use crate::publish::github::GithubContents;
use crate::telegram::TelegramClient;

const DEFAULT_CONFIG: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Fetch, then render and publish if anything changed
    Run,
    Fetch,
    Render,
    Publish,
}

impl Command {
    fn parse(arg: &str) -> Option<Self> {
        match arg {
            "run" => Some(Command::Run),
            "fetch" => Some(Command::Fetch),
            "render" => Some(Command::Render),
            "publish" => Some(Command::Publish),
            _ => None,
        }
    }
}

/// `tgarchive [COMMAND] [CONFIG]`; a lone argument that is not a command is
/// taken as the config path.
fn parse_args(args: &[String]) -> (Command, Option<PathBuf>) {
    match args {
        [] => (Command::Run, None),
        [first, rest @ ..] => match Command::parse(first) {
            Some(command) => (command, rest.first().map(PathBuf::from)),
            None => (Command::Run, Some(PathBuf::from(first))),
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tgarchive=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, config_path) = parse_args(&args);

    match run(command, config_path).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config_path: Option<PathBuf>) -> Result<bool> {
    let config_path = match config_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            path
        }
        None => PathBuf::from(DEFAULT_CONFIG),
    };

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Chat filter: {:?}", config.telegram.chat_id);
    info!("  Messages: {}", config.storage.messages_path.display());
    info!("  Cursor: {}", config.storage.cursor_path.display());
    info!("  Page: {}", config.site.output_path.display());
    info!(
        "  Publish: {}",
        config
            .publish_config()
            .map(|p| format!("{}/{}@{}", p.owner, p.repo, p.branch))
            .unwrap_or_else(|| "disabled".to_string())
    );

    match command {
        Command::Fetch => {
            run_fetch(&config).await?;
            Ok(true)
        }
        Command::Render => {
            run_render(&config)?;
            Ok(true)
        }
        Command::Publish => {
            if config.publish_config().is_none() {
                anyhow::bail!("Publishing is not configured (REPO_OWNER, REPO_NAME and TOKEN)");
            }
            run_publish(&config).await
        }
        Command::Run => {
            let result = run_fetch(&config).await?;
            if !result.changed() {
                info!("No changes detected, skipping render and publish");
                return Ok(true);
            }

            run_render(&config)?;

            if config.publish_config().is_none() {
                info!("Publishing not configured, skipping");
                return Ok(true);
            }
            run_publish(&config).await
        }
    }
}

async fn run_fetch(config: &Config) -> Result<RunResult> {
    let client = TelegramClient::new(config.telegram.clone())?;
    let store = ArchiveStore::from_config(&config.storage);
    let fetcher = Fetcher::new(client, store, config.telegram.chat_id);

    let result = fetcher.run().await?;
    info!(
        "Fetch complete: {} new messages, cursor {:?}",
        result.new_count, result.cursor
    );
    Ok(result)
}

fn run_render(config: &Config) -> Result<()> {
    let store = ArchiveStore::from_config(&config.storage);
    let messages = store.load_log();
    render::write_page(&messages, &config.site, Utc::now())
}

async fn run_publish(config: &Config) -> Result<bool> {
    let publish_config = config
        .publish_config()
        .context("Publishing is not configured")?
        .clone();
    let github = GithubContents::new(publish_config)?;

    let targets = publish::publish_targets(config);
    let report = publish::publish_files(&github, &targets).await;

    info!(
        "Publish complete: {} published, {} failed",
        report.published.len(),
        report.failed.len()
    );
    Ok(report.is_success())
}
