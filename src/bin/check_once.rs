use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::Bot;

use git_watchbot::cache::UpdateCache;
use git_watchbot::checker::Checker;
use git_watchbot::config;
use git_watchbot::notifier::{MessageSink, Notifier, StdoutSink, TelegramSink};
use git_watchbot::provider::{HttpFetcher, ProviderRegistry};

/// Expand groups, run a single check cycle and exit.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print notifications to stdout instead of sending them
    #[arg(long)]
    dry_run: bool,
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
    cfg.ensure_dirs()?;

    let fetcher = Arc::new(HttpFetcher::new().context("building HTTP client")?);
    let registry = Arc::new(ProviderRegistry::from_config(&cfg, fetcher)?);
    let cache = UpdateCache::load(cfg.app.cache_path()).await;

    let sink: Arc<dyn MessageSink> = if args.dry_run {
        Arc::new(StdoutSink)
    } else {
        Arc::new(TelegramSink::new(Bot::new(cfg.telegram.bot_token.clone())))
    };
    let (groups, users) = cfg.all_push_targets();
    let checker = Checker::new(&cfg, registry, cache, Notifier::new(sink, &groups, &users));

    checker.refresh_groups().await;
    let report = checker.check_and_push().await?;
    println!(
        "checked {} entries: {} updates, {} skipped, {} failed, {} messages sent",
        report.checked, report.updates, report.skipped, report.failed, report.delivery.sent
    );
    Ok(())
}
