use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use git_watchbot::cache::UpdateCache;
use git_watchbot::config;

/// Inspect or clear the change-detection cache.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print counts and every stored marker
    Show,
    /// Remove markers; without flags everything is removed
    Clear {
        #[arg(long)]
        provider: Option<String>,
        /// Requires --provider
        #[arg(long, requires = "provider")]
        repo: Option<String>,
        /// Clear group repository sets instead of markers
        #[arg(long)]
        groups: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut cache = UpdateCache::load(cfg.app.cache_path()).await;

    match args.cmd {
        Cmd::Show => {
            let stats = cache.stats();
            println!("cache file: {}", cache.path().display());
            println!(
                "commits: {}, releases: {}, groups: {}",
                stats.commits, stats.releases, stats.groups
            );
            for (key, record) in cache.records() {
                let value = record.sha.as_deref().or(record.tag.as_deref()).unwrap_or("-");
                println!("  {key} -> {value}");
            }
        }
        Cmd::Clear {
            provider,
            repo,
            groups,
        } => {
            let removed = if groups {
                cache.clear_group_cache(provider.as_deref(), None).await?
            } else {
                match (provider.as_deref(), repo.as_deref()) {
                    (Some(p), Some(r)) => cache.clear_repo(p, r).await?,
                    (Some(p), None) => cache.clear_provider(p).await?,
                    _ => cache.clear_all().await?,
                }
            };
            println!("removed {removed} entries");
        }
    }
    Ok(())
}
