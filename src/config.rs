//! Configuration loader and validator for the Git push bot.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::model::{GroupWatchEntry, ProviderKind, RepoWatchEntry};

pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 1800;
pub const CACHE_FILE_NAME: &str = "cache.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration. Global switches and watch lists sit at the top level;
/// several keys accept alternate spellings (see the `Raw*` wire structs and
/// `normalize`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    #[serde(default)]
    pub auto_check: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Notify on the first observation of a watch entry.
    #[serde(default)]
    pub first_push: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<ProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitlab: Option<ProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnb: Option<ProviderConfig>,

    #[serde(default, deserialize_with = "target_list")]
    pub push_groups: Vec<String>,
    #[serde(default, deserialize_with = "target_list")]
    pub push_users: Vec<String>,

    #[serde(default, deserialize_with = "list_or_json")]
    pub watch_repos: Vec<RepoWatchEntry>,
    #[serde(default, deserialize_with = "list_or_json")]
    pub watch_groups: Vec<GroupWatchEntry>,
    #[serde(default, deserialize_with = "list_or_json")]
    pub watch_targets: Vec<WatchTarget>,

    // Short spellings; the long key wins when both carry values.
    #[serde(default, rename = "groups", deserialize_with = "opt_target_list", skip_serializing)]
    groups_alias: Option<Vec<String>>,
    #[serde(default, rename = "users", deserialize_with = "opt_target_list", skip_serializing)]
    users_alias: Option<Vec<String>>,
    #[serde(default, rename = "repos", deserialize_with = "opt_list_or_json", skip_serializing)]
    repos_alias: Option<Vec<RepoWatchEntry>>,

    // Flat provider keys from older configs; folded into the sections above.
    #[serde(default, skip_serializing)]
    github_enabled: Option<bool>,
    #[serde(default, skip_serializing)]
    github_token: Option<String>,
    #[serde(default, skip_serializing)]
    gitlab_enabled: Option<bool>,
    #[serde(default, skip_serializing)]
    gitlab_token: Option<String>,
    #[serde(default, skip_serializing)]
    gitlab_url: Option<String>,
    #[serde(default, skip_serializing)]
    cnb_enabled: Option<bool>,
    #[serde(default, skip_serializing)]
    cnb_token: Option<String>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Users allowed to issue commands; empty allows everyone.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
}

/// Credentials and endpoint for one hosting service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "RawProviderConfig")]
pub struct ProviderConfig {
    pub enabled: bool,
    pub token: String,
    /// Base API URL for self-hosted deployments; empty uses the public service.
    pub api_url: String,
}

#[derive(Deserialize)]
struct RawProviderConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    token: String,
    api_url: Option<String>,
    url: Option<String>,
}

impl From<RawProviderConfig> for ProviderConfig {
    fn from(raw: RawProviderConfig) -> Self {
        Self {
            enabled: raw.enabled,
            token: raw.token,
            api_url: first_of([raw.api_url, raw.url], String::is_empty).unwrap_or_default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token: String::new(),
            api_url: String::new(),
        }
    }
}

/// Advanced watch block: its repos and groups join the watch lists and its
/// push targets are merged into the global target set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(from = "RawWatchTarget")]
pub struct WatchTarget {
    pub repos: Vec<RepoWatchEntry>,
    pub groups: Vec<GroupWatchEntry>,
    pub push_targets: PushTargets,
}

#[derive(Deserialize)]
struct RawWatchTarget {
    #[serde(default, deserialize_with = "opt_list_or_json")]
    repos: Option<Vec<RepoWatchEntry>>,
    #[serde(default, deserialize_with = "opt_list_or_json")]
    watch_repos: Option<Vec<RepoWatchEntry>>,
    #[serde(default, deserialize_with = "opt_list_or_json")]
    groups: Option<Vec<GroupWatchEntry>>,
    #[serde(default, deserialize_with = "opt_list_or_json")]
    watch_groups: Option<Vec<GroupWatchEntry>>,
    #[serde(default)]
    push_targets: PushTargets,
}

impl From<RawWatchTarget> for WatchTarget {
    fn from(raw: RawWatchTarget) -> Self {
        Self {
            repos: first_of([raw.repos, raw.watch_repos], Vec::is_empty).unwrap_or_default(),
            groups: first_of([raw.groups, raw.watch_groups], Vec::is_empty).unwrap_or_default(),
            push_targets: raw.push_targets,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(from = "RawPushTargets")]
pub struct PushTargets {
    pub groups: Vec<String>,
    pub users: Vec<String>,
}

#[derive(Deserialize)]
struct RawPushTargets {
    #[serde(default, deserialize_with = "opt_target_list")]
    groups: Option<Vec<String>>,
    #[serde(default, deserialize_with = "opt_target_list")]
    group: Option<Vec<String>>,
    #[serde(default, deserialize_with = "opt_target_list")]
    users: Option<Vec<String>>,
    #[serde(default, deserialize_with = "opt_target_list")]
    user: Option<Vec<String>>,
}

impl From<RawPushTargets> for PushTargets {
    fn from(raw: RawPushTargets) -> Self {
        Self {
            groups: first_of([raw.groups, raw.group], Vec::is_empty).unwrap_or_default(),
            users: first_of([raw.users, raw.user], Vec::is_empty).unwrap_or_default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}

/// Resolve a setting written under several spellings: the first spelling,
/// in the order given, that holds a non-empty value.
pub(crate) fn first_of<T, const N: usize>(
    spellings: [Option<T>; N],
    is_empty: impl Fn(&T) -> bool,
) -> Option<T> {
    spellings.into_iter().flatten().find(|v| !is_empty(v))
}

/// Accepts a native list or a JSON-encoded string holding one. A value that
/// is not a list yields an empty list; an element that does not decode is
/// dropped on its own.
pub(crate) fn list_or_json<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = serde_json::Value::deserialize(de)?;
    let value = match raw {
        serde_json::Value::Null => return Ok(Vec::new()),
        serde_json::Value::String(s) if s.trim().is_empty() => return Ok(Vec::new()),
        serde_json::Value::String(s) => match serde_json::from_str::<serde_json::Value>(&s) {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "list field is not valid JSON; using empty list");
                return Ok(Vec::new());
            }
        },
        other => other,
    };
    let serde_json::Value::Array(items) = value else {
        warn!("list field is not a list; using empty list");
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<T>(item) {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(%err, "skipping malformed list element");
                None
            }
        })
        .collect())
}

/// [`list_or_json`] for a key that may be absent; pair with `#[serde(default)]`.
pub(crate) fn opt_list_or_json<'de, D, T>(de: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    list_or_json(de).map(Some)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTarget {
    Num(i64),
    Str(String),
}

impl From<RawTarget> for String {
    fn from(value: RawTarget) -> Self {
        match value {
            RawTarget::Num(n) => n.to_string(),
            RawTarget::Str(s) => s.trim().to_string(),
        }
    }
}

/// Push target ids may be written as numbers or strings.
fn target_list<'de, D>(de: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<RawTarget> = list_or_json(de)?;
    Ok(raw
        .into_iter()
        .map(String::from)
        .filter(|s| !s.is_empty())
        .collect())
}

fn opt_target_list<'de, D>(de: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    target_list(de).map(Some)
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return Path::new(home.trim_end_matches('/')).join(rest);
            }
        }
        PathBuf::from(&self.data_dir)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.resolved_data_dir().join(CACHE_FILE_NAME)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        match kind {
            ProviderKind::GitHub => self.github.as_ref(),
            ProviderKind::GitLab => self.gitlab.as_ref(),
            ProviderKind::Cnb => self.cnb.as_ref(),
        }
    }

    pub fn is_provider_enabled(&self, kind: ProviderKind) -> bool {
        self.provider(kind).map(|p| p.enabled).unwrap_or(false)
    }

    /// Directly configured repos followed by those from `watch_targets`.
    pub fn all_watch_repos(&self) -> Vec<RepoWatchEntry> {
        self.watch_repos
            .iter()
            .chain(self.watch_targets.iter().flat_map(|t| t.repos.iter()))
            .cloned()
            .collect()
    }

    pub fn all_watch_groups(&self) -> Vec<GroupWatchEntry> {
        self.watch_groups
            .iter()
            .chain(self.watch_targets.iter().flat_map(|t| t.groups.iter()))
            .cloned()
            .collect()
    }

    /// Deduplicated (groups, users) across the global lists and every watch target.
    pub fn all_push_targets(&self) -> (Vec<String>, Vec<String>) {
        let mut groups: BTreeSet<String> = self.push_groups.iter().cloned().collect();
        let mut users: BTreeSet<String> = self.push_users.iter().cloned().collect();
        for target in &self.watch_targets {
            groups.extend(target.push_targets.groups.iter().cloned());
            users.extend(target.push_targets.users.iter().cloned());
        }
        (groups.into_iter().collect(), users.into_iter().collect())
    }

    /// Fold legacy flat keys into provider sections and drop unusable entries.
    fn normalize(&mut self) {
        let push_groups = std::mem::take(&mut self.push_groups);
        self.push_groups = first_of([Some(push_groups), self.groups_alias.take()], Vec::is_empty)
            .unwrap_or_default();
        let push_users = std::mem::take(&mut self.push_users);
        self.push_users = first_of([Some(push_users), self.users_alias.take()], Vec::is_empty)
            .unwrap_or_default();
        let watch_repos = std::mem::take(&mut self.watch_repos);
        self.watch_repos = first_of([Some(watch_repos), self.repos_alias.take()], Vec::is_empty)
            .unwrap_or_default();

        if let Some(enabled) = self.github_enabled.take() {
            self.github = Some(ProviderConfig {
                enabled,
                token: self.github_token.take().unwrap_or_default(),
                api_url: String::new(),
            });
        }
        if let Some(enabled) = self.gitlab_enabled.take() {
            self.gitlab = Some(ProviderConfig {
                enabled,
                token: self.gitlab_token.take().unwrap_or_default(),
                api_url: self.gitlab_url.take().unwrap_or_default(),
            });
        }
        if let Some(enabled) = self.cnb_enabled.take() {
            self.cnb = Some(ProviderConfig {
                enabled,
                token: self.cnb_token.take().unwrap_or_default(),
                api_url: String::new(),
            });
        }

        let keep_repo = |r: &RepoWatchEntry| {
            let ok = !r.repo.trim().is_empty() && !r.provider.trim().is_empty();
            if !ok {
                warn!(provider = %r.provider, "dropping watch_repos entry without provider or repo");
            }
            ok
        };
        let keep_group = |g: &GroupWatchEntry| {
            let ok = !g.group.trim().is_empty() && !g.provider.trim().is_empty();
            if !ok {
                warn!(provider = %g.provider, "dropping watch_groups entry without provider or group");
            }
            ok
        };
        self.watch_repos.retain(keep_repo);
        self.watch_groups.retain(keep_group);
        for target in &mut self.watch_targets {
            target.repos.retain(keep_repo);
            target.groups.retain(keep_group);
        }
    }
}

/// Load configuration from a YAML (or JSON) file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

/// Parse, normalize and validate a configuration document.
pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let mut cfg: Config = serde_yaml::from_str(content)?;
    cfg.normalize();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.check_interval == 0 {
        return Err(ConfigError::Invalid("check_interval must be > 0"));
    }
    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    for kind in ProviderKind::ALL {
        if let Some(p) = cfg.provider(kind) {
            if !p.api_url.is_empty() && reqwest::Url::parse(&p.api_url).is_err() {
                return Err(ConfigError::Invalid("provider api_url must be an absolute URL"));
            }
        }
    }
    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  allowed_users:
    - 123456789

auto_check: true
check_interval: 1800
first_push: false

github:
  enabled: true
  token: "ghp_xxx"
gitlab:
  enabled: true
  token: "glpat-xxx"
  api_url: "https://gitlab.example.com/api/v4"
cnb:
  enabled: false

push_groups:
  - -1001234567890
push_users:
  - "123456789"

watch_repos:
  - provider: github
    repo: octo/repo
    branch: main
    watch_type: commits
    note: "main app"
  - provider: gitlab
    repo: team/service
    type: releases

watch_groups:
  - provider: github
    org: octo-org
    watch_type: releases
    include_repos: []
    exclude: ["sandbox"]
    note: "whole org"
"#
}
