//! Resolves group watches into concrete repository watches.

use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cache::UpdateCache;
use crate::model::{GroupWatchEntry, RepoWatchEntry};
use crate::provider::ProviderRegistry;

/// Expand `groups` in order. Later groups overwrite earlier entries with the
/// same key. A group whose listing fails contributes nothing.
pub async fn expand_groups(
    groups: &[GroupWatchEntry],
    registry: &ProviderRegistry,
    cache: &Mutex<UpdateCache>,
) -> BTreeMap<String, RepoWatchEntry> {
    let mut expanded = BTreeMap::new();
    for group in groups {
        let Some(provider) = registry.get(&group.provider) else {
            warn!(provider = %group.provider, group = %group.group, "provider not enabled for group");
            continue;
        };
        let repos = match provider.get_group_repos(&group.group).await {
            Ok(repos) => repos.unwrap_or_default(),
            Err(err) => {
                error!(%err, provider = %group.provider, group = %group.group, "group listing failed");
                continue;
            }
        };
        info!(
            provider = %group.provider,
            group = %group.group,
            count = repos.len(),
            "group repositories listed"
        );

        for repo in repos.iter().filter(|r| group.should_watch_repo(&r.name)) {
            let entry = group.entry_for(repo);
            expanded.insert(entry.key(), entry);
        }

        let names: BTreeSet<String> = repos.iter().map(|r| r.name.clone()).collect();
        let mut cache = cache.lock().await;
        if let Some(previous) = cache.group_cached_repos(&group.provider, &group.group) {
            let added: Vec<_> = names.difference(previous).cloned().collect();
            let removed: Vec<_> = previous.difference(&names).cloned().collect();
            if !added.is_empty() || !removed.is_empty() {
                info!(
                    provider = %group.provider,
                    group = %group.group,
                    ?added,
                    ?removed,
                    "group membership changed"
                );
            }
        }
        if let Err(err) = cache
            .set_group_cached_repos(&group.provider, &group.group, names)
            .await
        {
            warn!(%err, group = %group.group, "failed to persist group repos");
        }
    }
    expanded
}
