use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use genloc_cli::config::{Args, CommandConfig, Config};
use genloc_cli::{run_indexing, run_ranking, OpenAiChatClient};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_args(&args)?;

    let env_filter = EnvFilter::try_new(config.log_level.as_str())
        .or_else(|_| EnvFilter::try_new("info"))?;

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    match config.command {
        CommandConfig::Index(index) => {
            tracing::info!(project = %index.project.project, "Starting indexing");
            let summary = run_indexing(index).await?;
            if !summary.failed.is_empty() {
                tracing::warn!(failed = ?summary.failed, "Some bugs were not indexed");
            }
        }
        CommandConfig::Rank(rank) => {
            tracing::info!(project = %rank.project.project, "Starting ranking");
            let api_key = rank
                .project
                .api_key
                .clone()
                .context("ranking needs an API key")?;
            let client = Arc::new(OpenAiChatClient::new(
                &rank.project.api_base,
                &api_key,
                rank.project.retry.clone(),
            ));
            run_ranking(&rank, client).await?;
        }
    }

    Ok(())
}
