//! Change-detection cache: the last seen commit SHA per (provider, repo,
//! branch) and the last seen release tag per (provider, repo).
//!
//! The whole store is one JSON object, rewritten on every mutation:
//!
//! ```json
//! {
//!   "_group_repos": { "github:octo": ["app", "docs"] },
//!   "commit:github:octo/app:main": { "sha": "abc1234" },
//!   "release:github:octo/app": { "tag": "v1.2.0" }
//! }
//! ```
//!
//! A missing key means the entry was never observed, which is distinct from
//! "observed and unchanged".

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::model::{CommitInfo, ReleaseInfo};

/// Reserved key holding the group → repo-name sets.
pub const GROUP_REPOS_KEY: &str = "_group_repos";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Structured form of a persisted cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Commit {
        provider: String,
        repo: String,
        branch: String,
    },
    Release {
        provider: String,
        repo: String,
    },
}

impl CacheKey {
    pub fn commit(provider: &str, repo: &str, branch: &str) -> Self {
        CacheKey::Commit {
            provider: provider.to_ascii_lowercase(),
            repo: repo.to_string(),
            branch: branch.to_string(),
        }
    }

    pub fn release(provider: &str, repo: &str) -> Self {
        CacheKey::Release {
            provider: provider.to_ascii_lowercase(),
            repo: repo.to_string(),
        }
    }

    /// Inverse of `Display`. The branch is everything after the last `:`
    /// since git refs cannot contain one.
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, rest) = raw.split_once(':')?;
        let (provider, rest) = rest.split_once(':')?;
        if provider.is_empty() || rest.is_empty() {
            return None;
        }
        match kind {
            "commit" => {
                let (repo, branch) = rest.rsplit_once(':')?;
                Some(CacheKey::Commit {
                    provider: provider.to_string(),
                    repo: repo.to_string(),
                    branch: branch.to_string(),
                })
            }
            "release" => Some(CacheKey::Release {
                provider: provider.to_string(),
                repo: rest.to_string(),
            }),
            _ => None,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            CacheKey::Commit { provider, .. } | CacheKey::Release { provider, .. } => provider,
        }
    }

    pub fn repo(&self) -> &str {
        match self {
            CacheKey::Commit { repo, .. } | CacheKey::Release { repo, .. } => repo,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Commit {
                provider,
                repo,
                branch,
            } => write!(f, "commit:{}:{}:{}", provider, repo, branch),
            CacheKey::Release { provider, repo } => write!(f, "release:{}:{}", provider, repo),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(rename = "_group_repos", default)]
    group_repos: BTreeMap<String, BTreeSet<String>>,
    #[serde(flatten)]
    records: BTreeMap<String, CacheRecord>,
}

/// Outcome of comparing a fresh fetch against the stored marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Nothing was stored for this key yet.
    First,
    Unchanged,
    Changed { previous: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub commits: usize,
    pub releases: usize,
    pub groups: usize,
}

#[derive(Debug)]
pub struct UpdateCache {
    path: PathBuf,
    records: BTreeMap<String, CacheRecord>,
    group_repos: BTreeMap<String, BTreeSet<String>>,
}

fn group_key(provider: &str, group: &str) -> String {
    format!("{}:{}", provider.to_ascii_lowercase(), group)
}

impl UpdateCache {
    /// Load the store at `path`. A missing file starts empty; so does a
    /// corrupt one, which re-observation will repopulate.
    pub async fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(file) => file,
                Err(err) => {
                    warn!(%err, path = %path.display(), "cache file is corrupt; starting empty");
                    CacheFile::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CacheFile::default(),
            Err(err) => {
                warn!(%err, path = %path.display(), "failed to read cache file; starting empty");
                CacheFile::default()
            }
        };
        debug!(
            records = file.records.len(),
            groups = file.group_repos.len(),
            "loaded update cache"
        );
        Self {
            path,
            records: file.records,
            group_repos: file.group_repos,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, key: &CacheKey) -> Option<&CacheRecord> {
        self.records.get(&key.to_string())
    }

    pub fn get_cached_commit_sha(&self, provider: &str, repo: &str, branch: &str) -> Option<&str> {
        self.lookup(&CacheKey::commit(provider, repo, branch))
            .and_then(|r| r.sha.as_deref())
    }

    pub fn is_first_commit_check(&self, provider: &str, repo: &str, branch: &str) -> bool {
        self.lookup(&CacheKey::commit(provider, repo, branch)).is_none()
    }

    pub async fn set_cached_commit_sha(
        &mut self,
        provider: &str,
        repo: &str,
        branch: &str,
        sha: &str,
    ) -> Result<(), CacheError> {
        let key = CacheKey::commit(provider, repo, branch).to_string();
        self.records.entry(key).or_default().sha = Some(sha.to_string());
        self.persist().await
    }

    pub fn get_cached_release_tag(&self, provider: &str, repo: &str) -> Option<&str> {
        self.lookup(&CacheKey::release(provider, repo))
            .and_then(|r| r.tag.as_deref())
    }

    pub fn is_first_release_check(&self, provider: &str, repo: &str) -> bool {
        self.lookup(&CacheKey::release(provider, repo)).is_none()
    }

    pub async fn set_cached_release_tag(
        &mut self,
        provider: &str,
        repo: &str,
        tag: &str,
    ) -> Result<(), CacheError> {
        let key = CacheKey::release(provider, repo).to_string();
        self.records.entry(key).or_default().tag = Some(tag.to_string());
        self.persist().await
    }

    /// Classify `commit` against the stored SHA for its branch and store it
    /// when it differs. The write happens before any notification is sent.
    pub async fn observe_commit(&mut self, commit: &CommitInfo) -> Observation {
        let provider = commit.provider.as_str();
        let observation = match self.lookup(&CacheKey::commit(provider, &commit.repo, &commit.branch)) {
            None => Observation::First,
            Some(rec) if rec.sha.as_deref() == Some(commit.sha.as_str()) => {
                return Observation::Unchanged;
            }
            Some(rec) => Observation::Changed {
                previous: rec.sha.clone().unwrap_or_default(),
            },
        };
        if let Err(err) = self
            .set_cached_commit_sha(provider, &commit.repo, &commit.branch, &commit.sha)
            .await
        {
            warn!(%err, provider, repo = %commit.repo, "failed to persist commit marker");
        }
        observation
    }

    pub async fn observe_release(&mut self, release: &ReleaseInfo) -> Observation {
        let provider = release.provider.as_str();
        let observation = match self.lookup(&CacheKey::release(provider, &release.repo)) {
            None => Observation::First,
            Some(rec) if rec.tag.as_deref() == Some(release.tag.as_str()) => {
                return Observation::Unchanged;
            }
            Some(rec) => Observation::Changed {
                previous: rec.tag.clone().unwrap_or_default(),
            },
        };
        if let Err(err) = self
            .set_cached_release_tag(provider, &release.repo, &release.tag)
            .await
        {
            warn!(%err, provider, repo = %release.repo, "failed to persist release marker");
        }
        observation
    }

    pub fn group_cached_repos(&self, provider: &str, group: &str) -> Option<&BTreeSet<String>> {
        self.group_repos.get(&group_key(provider, group))
    }

    pub async fn set_group_cached_repos(
        &mut self,
        provider: &str,
        group: &str,
        repos: BTreeSet<String>,
    ) -> Result<(), CacheError> {
        self.group_repos.insert(group_key(provider, group), repos);
        self.persist().await
    }

    /// Drop every marker. `_`-prefixed metadata records survive; group sets do not.
    pub async fn clear_all(&mut self) -> Result<usize, CacheError> {
        let before = self.records.len() + self.group_repos.len();
        self.records.retain(|k, _| k.starts_with('_'));
        self.group_repos.clear();
        self.persist().await?;
        Ok(before - self.records.len())
    }

    /// Drop markers whose provider field is exactly `provider`.
    pub async fn clear_provider(&mut self, provider: &str) -> Result<usize, CacheError> {
        let provider = provider.to_ascii_lowercase();
        self.clear_matching(|key| key.provider() == provider).await
    }

    /// Drop every commit and release marker of one repository.
    pub async fn clear_repo(&mut self, provider: &str, repo: &str) -> Result<usize, CacheError> {
        let provider = provider.to_ascii_lowercase();
        self.clear_matching(|key| key.provider() == provider && key.repo() == repo)
            .await
    }

    async fn clear_matching<F>(&mut self, matches: F) -> Result<usize, CacheError>
    where
        F: Fn(&CacheKey) -> bool,
    {
        let before = self.records.len();
        self.records
            .retain(|raw, _| !CacheKey::parse(raw).map(|k| matches(&k)).unwrap_or(false));
        let removed = before - self.records.len();
        self.persist().await?;
        Ok(removed)
    }

    /// Drop group repo sets, scoped by provider and optionally group.
    pub async fn clear_group_cache(
        &mut self,
        provider: Option<&str>,
        group: Option<&str>,
    ) -> Result<usize, CacheError> {
        let before = self.group_repos.len();
        match (provider, group) {
            (Some(p), Some(g)) => {
                self.group_repos.remove(&group_key(p, g));
            }
            (Some(p), None) => {
                let p = p.to_ascii_lowercase();
                self.group_repos
                    .retain(|k, _| k.split_once(':').map(|(kp, _)| kp != p).unwrap_or(true));
            }
            _ => self.group_repos.clear(),
        }
        self.persist().await?;
        Ok(before - self.group_repos.len())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            groups: self.group_repos.len(),
            ..Default::default()
        };
        for key in self.records.keys().filter_map(|k| CacheKey::parse(k)) {
            match key {
                CacheKey::Commit { .. } => stats.commits += 1,
                CacheKey::Release { .. } => stats.releases += 1,
            }
        }
        stats
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &CacheRecord)> {
        self.records.iter()
    }

    /// Rewrite the whole store: write a sibling temp file, then rename over.
    async fn persist(&self) -> Result<(), CacheError> {
        let file = CacheFile {
            group_repos: self.group_repos.clone(),
            records: self.records.clone(),
        };
        let body = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body.as_bytes()).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
