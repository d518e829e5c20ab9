use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info};

use git_watchbot::cache::UpdateCache;
use git_watchbot::checker::Checker;
use git_watchbot::config;
use git_watchbot::handlers;
use git_watchbot::notifier::{Notifier, TelegramSink};
use git_watchbot::provider::{HttpFetcher, ProviderRegistry};
use git_watchbot::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let (groups, users) = cfg.all_push_targets();
    let notifier = Notifier::new(Arc::new(TelegramSink::new(bot.clone())), &groups, &users);
    let checker = Arc::new(Checker::new(&cfg, registry.clone(), cache, notifier));

    checker.refresh_groups().await;
    info!(
        providers = ?registry.kinds(),
        repos = checker.watch_repos().len(),
        expanded = checker.expanded_entries().await.len(),
        "git watchbot initialized"
    );

    let scheduler = cfg
        .auto_check
        .then(|| Scheduler::start(checker.clone(), Duration::from_secs(cfg.check_interval)));

    info!("starting telegram bot");
    let cfg = Arc::new(cfg);
    let handler_checker = checker.clone();
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let cfg = cfg.clone();
        let checker = handler_checker.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &cfg, &checker, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    Ok(())
}
