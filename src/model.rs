use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::config::first_of;

/// Git hosting services the bot knows how to poll.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    GitHub,
    GitLab,
    Cnb,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::GitHub, ProviderKind::GitLab, ProviderKind::Cnb];

    /// Lowercase id used in configuration and cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GitHub => "github",
            ProviderKind::GitLab => "gitlab",
            ProviderKind::Cnb => "cnb",
        }
    }

    /// Name shown in notification text.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::GitHub => "GitHub",
            ProviderKind::GitLab => "GitLab",
            ProviderKind::Cnb => "CNB",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "github" => Some(ProviderKind::GitHub),
            "gitlab" => Some(ProviderKind::GitLab),
            "cnb" => Some(ProviderKind::Cnb),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum WatchKind {
    #[default]
    Commits,
    Releases,
}

impl WatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchKind::Commits => "commits",
            WatchKind::Releases => "releases",
        }
    }
}

impl From<String> for WatchKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "commits" | "commit" => WatchKind::Commits,
            "releases" | "release" => WatchKind::Releases,
            other => {
                warn!(value = other, "unknown watch_type; falling back to commits");
                WatchKind::Commits
            }
        }
    }
}

impl From<WatchKind> for String {
    fn from(value: WatchKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single tracked (provider, repository, branch, kind) tuple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "RawRepoWatch")]
pub struct RepoWatchEntry {
    pub provider: String,
    pub repo: String,
    /// Empty means the provider's default branch.
    pub branch: String,
    #[serde(rename = "watch_type")]
    pub watch_kind: WatchKind,
    pub note: String,
}

/// Accepted spellings of a repo watch; `watch_type` wins over `type`.
#[derive(Deserialize)]
struct RawRepoWatch {
    #[serde(default)]
    provider: String,
    #[serde(default)]
    repo: String,
    #[serde(default)]
    branch: String,
    watch_type: Option<WatchKind>,
    #[serde(rename = "type")]
    kind: Option<WatchKind>,
    #[serde(default)]
    note: String,
}

impl From<RawRepoWatch> for RepoWatchEntry {
    fn from(raw: RawRepoWatch) -> Self {
        Self {
            provider: raw.provider,
            repo: raw.repo,
            branch: raw.branch,
            watch_kind: raw.watch_type.or(raw.kind).unwrap_or_default(),
            note: raw.note,
        }
    }
}

impl RepoWatchEntry {
    /// Identity of the entry; two entries with the same key are the same watch.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.provider.to_ascii_lowercase(),
            self.repo,
            self.branch,
            self.watch_kind
        )
    }
}

/// An organization/group watch, expanded into repo watches at refresh time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "RawGroupWatch")]
pub struct GroupWatchEntry {
    pub provider: String,
    pub group: String,
    #[serde(rename = "watch_type")]
    pub watch_kind: WatchKind,
    pub include_repos: Vec<String>,
    pub exclude_repos: Vec<String>,
    /// Overrides each repo's default branch when non-empty.
    pub branch: String,
    pub note: String,
}

/// Accepted spellings of a group watch. When several are present the first
/// non-empty one wins: `group`, `org`, `organization`; `include_repos`,
/// `include`; `exclude_repos`, `exclude`; `watch_type`, `type`.
#[derive(Deserialize)]
struct RawGroupWatch {
    #[serde(default)]
    provider: String,
    group: Option<String>,
    org: Option<String>,
    organization: Option<String>,
    watch_type: Option<WatchKind>,
    #[serde(rename = "type")]
    kind: Option<WatchKind>,
    #[serde(default, deserialize_with = "crate::config::opt_list_or_json")]
    include_repos: Option<Vec<String>>,
    #[serde(default, deserialize_with = "crate::config::opt_list_or_json")]
    include: Option<Vec<String>>,
    #[serde(default, deserialize_with = "crate::config::opt_list_or_json")]
    exclude_repos: Option<Vec<String>>,
    #[serde(default, deserialize_with = "crate::config::opt_list_or_json")]
    exclude: Option<Vec<String>>,
    #[serde(default)]
    branch: String,
    #[serde(default)]
    note: String,
}

impl From<RawGroupWatch> for GroupWatchEntry {
    fn from(raw: RawGroupWatch) -> Self {
        Self {
            provider: raw.provider,
            group: first_of([raw.group, raw.org, raw.organization], String::is_empty)
                .unwrap_or_default(),
            watch_kind: raw.watch_type.or(raw.kind).unwrap_or_default(),
            include_repos: first_of([raw.include_repos, raw.include], Vec::is_empty)
                .unwrap_or_default(),
            exclude_repos: first_of([raw.exclude_repos, raw.exclude], Vec::is_empty)
                .unwrap_or_default(),
            branch: raw.branch,
            note: raw.note,
        }
    }
}

impl GroupWatchEntry {
    /// Exclusion is absolute; an empty include list admits everything else.
    pub fn should_watch_repo(&self, repo_name: &str) -> bool {
        if self.exclude_repos.iter().any(|r| r == repo_name) {
            return false;
        }
        if !self.include_repos.is_empty() && !self.include_repos.iter().any(|r| r == repo_name) {
            return false;
        }
        true
    }

    /// Builds the repo watch for one repository listed under this group.
    pub fn entry_for(&self, repo: &RepoInfo) -> RepoWatchEntry {
        let branch = if self.branch.is_empty() {
            repo.default_branch.clone()
        } else {
            self.branch.clone()
        };
        RepoWatchEntry {
            provider: self.provider.clone(),
            repo: repo.full_name.clone(),
            branch,
            watch_kind: self.watch_kind,
            note: self.note.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    /// First line of the commit message.
    pub message: String,
    pub author: String,
    pub date: String,
    pub branch: String,
    pub repo: String,
    pub provider: ProviderKind,
    pub url: Option<String>,
}

impl CommitInfo {
    pub fn short_sha(&self) -> &str {
        match self.sha.char_indices().nth(7) {
            Some((idx, _)) => &self.sha[..idx],
            None => &self.sha,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub tag: String,
    pub name: String,
    /// First line of the release notes, at most 200 chars.
    pub body: String,
    pub author: String,
    pub date: String,
    pub repo: String,
    pub provider: ProviderKind,
    pub url: Option<String>,
}

/// Repository metadata returned by group listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    /// `owner/name` (or the full namespace path on GitLab).
    pub full_name: String,
    pub name: String,
    pub default_branch: String,
    pub description: String,
    pub url: String,
}

/// Anything the check cycle can report as an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Commit(CommitInfo),
    Release(ReleaseInfo),
}
