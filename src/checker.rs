//! One check cycle: fetch every watch entry, classify it against the cache,
//! then notify about whatever changed.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::cache::{CacheError, CacheStats, Observation, UpdateCache};
use crate::config::Config;
use crate::expander::expand_groups;
use crate::model::{GroupWatchEntry, RepoWatchEntry, Update, WatchKind};
use crate::notifier::{render, Delivery, Notifier};
use crate::provider::{FetchError, GitProvider, ProviderRegistry};

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("a check is already running")]
    AlreadyRunning,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub updates: usize,
    /// Entries whose provider is not enabled.
    pub skipped: usize,
    pub failed: usize,
    pub delivery: Delivery,
}

pub struct Checker {
    registry: Arc<ProviderRegistry>,
    cache: Mutex<UpdateCache>,
    notifier: Notifier,
    watch_repos: Vec<RepoWatchEntry>,
    watch_groups: Vec<GroupWatchEntry>,
    expanded: RwLock<BTreeMap<String, RepoWatchEntry>>,
    first_push: bool,
    cycle: Mutex<()>,
}

impl Checker {
    pub fn new(
        cfg: &Config,
        registry: Arc<ProviderRegistry>,
        cache: UpdateCache,
        notifier: Notifier,
    ) -> Self {
        Self {
            registry,
            cache: Mutex::new(cache),
            notifier,
            watch_repos: cfg.all_watch_repos(),
            watch_groups: cfg.all_watch_groups(),
            expanded: RwLock::new(BTreeMap::new()),
            first_push: cfg.first_push,
            cycle: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn watch_repos(&self) -> &[RepoWatchEntry] {
        &self.watch_repos
    }

    pub fn watch_groups(&self) -> &[GroupWatchEntry] {
        &self.watch_groups
    }

    pub async fn expanded_entries(&self) -> Vec<RepoWatchEntry> {
        self.expanded.read().await.values().cloned().collect()
    }

    /// Re-list every watched group and replace the expanded entries.
    /// Returns the number of expanded repositories.
    #[instrument(skip_all)]
    pub async fn refresh_groups(&self) -> usize {
        let expanded = expand_groups(&self.watch_groups, &self.registry, &self.cache).await;
        let count = expanded.len();
        *self.expanded.write().await = expanded;
        info!(count, "group watches expanded");
        count
    }

    /// Run one cycle. Entries are checked one at a time; notifications go
    /// out after every entry has been checked.
    #[instrument(skip_all)]
    pub async fn check_and_push(&self) -> Result<CycleReport, CheckError> {
        let _guard = self.cycle.try_lock().map_err(|_| CheckError::AlreadyRunning)?;

        let mut entries = self.watch_repos.clone();
        entries.extend(self.expanded.read().await.values().cloned());
        if entries.is_empty() {
            warn!("no repositories are being watched");
            return Ok(CycleReport::default());
        }

        let mut report = CycleReport::default();
        let mut pending = Vec::new();
        for entry in &entries {
            let Some(provider) = self.registry.get(&entry.provider) else {
                report.skipped += 1;
                continue;
            };
            report.checked += 1;
            match self.check_entry(provider.as_ref(), entry).await {
                Ok(Some(update)) => pending.push((update, entry.note.clone())),
                Ok(None) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(%err, provider = %entry.provider, repo = %entry.repo, "check failed");
                }
            }
        }

        report.updates = pending.len();
        for (update, note) in &pending {
            let delivery = self.notifier.broadcast(&render(update, note)).await;
            report.delivery.sent += delivery.sent;
            report.delivery.failed += delivery.failed;
        }
        info!(
            checked = report.checked,
            updates = report.updates,
            skipped = report.skipped,
            failed = report.failed,
            "check cycle finished"
        );
        Ok(report)
    }

    async fn check_entry(
        &self,
        provider: &dyn GitProvider,
        entry: &RepoWatchEntry,
    ) -> Result<Option<Update>, FetchError> {
        match entry.watch_kind {
            WatchKind::Commits => {
                let Some(commit) = provider.get_latest_commit(&entry.repo, &entry.branch).await?
                else {
                    return Ok(None);
                };
                let observation = self.cache.lock().await.observe_commit(&commit).await;
                if !self.should_notify(&observation) {
                    return Ok(None);
                }
                info!(
                    provider = %commit.provider,
                    repo = %commit.repo,
                    branch = %commit.branch,
                    sha = %commit.short_sha(),
                    "new commit"
                );
                Ok(Some(Update::Commit(commit)))
            }
            WatchKind::Releases => {
                let Some(release) = provider.get_latest_release(&entry.repo).await? else {
                    return Ok(None);
                };
                let observation = self.cache.lock().await.observe_release(&release).await;
                if !self.should_notify(&observation) {
                    return Ok(None);
                }
                info!(
                    provider = %release.provider,
                    repo = %release.repo,
                    tag = %release.tag,
                    "new release"
                );
                Ok(Some(Update::Release(release)))
            }
        }
    }

    fn should_notify(&self, observation: &Observation) -> bool {
        match observation {
            Observation::Unchanged => false,
            Observation::First if !self.first_push => {
                info!("first observation recorded without notification");
                false
            }
            Observation::First | Observation::Changed { .. } => true,
        }
    }

    /// Scoped cache clear: everything, one provider, or one repository.
    pub async fn clear_cache(
        &self,
        provider: Option<&str>,
        repo: Option<&str>,
    ) -> Result<usize, CacheError> {
        let mut cache = self.cache.lock().await;
        match (provider, repo) {
            (Some(p), Some(r)) => cache.clear_repo(p, r).await,
            (Some(p), None) => cache.clear_provider(p).await,
            _ => cache.clear_all().await,
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }
}
