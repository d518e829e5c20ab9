//! Git hosting adapters.
//!
//! Each adapter maps one REST API onto the same four capabilities and
//! normalizes its JSON into [`CommitInfo`], [`ReleaseInfo`] and [`RepoInfo`].
//! Fetches return [`Fetch`]: `Ok(None)` when there is simply nothing to
//! report (404, empty list, missing identifying field) and `Err` for
//! transport, status and decoding failures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::model::{CommitInfo, ProviderKind, ReleaseInfo, RepoInfo};

pub mod cnb;
pub mod github;
pub mod gitlab;
pub mod http;

pub use cnb::CnbProvider;
pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;
pub use http::{paginate, ApiRequest, HttpFetcher, JsonFetcher, MAX_PAGES, PER_PAGE};

pub const DEFAULT_BRANCH: &str = "main";
pub const UNKNOWN_AUTHOR: &str = "Unknown";
pub const UNKNOWN_DATE: &str = "未知";
pub const EMPTY_RELEASE_BODY: &str = "无更新说明";
pub const RELEASE_BODY_MAX_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("invalid response body: {0}")]
    Decode(String),
}

/// `Ok(None)` is "no data"; `Err` is a failure worth backing off from.
pub type Fetch<T> = std::result::Result<Option<T>, FetchError>;

#[async_trait]
pub trait GitProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Never fails; falls back to [`DEFAULT_BRANCH`].
    async fn get_default_branch(&self, repo: &str) -> String;

    /// Latest commit on `branch`, or on the default branch when empty.
    async fn get_latest_commit(&self, repo: &str, branch: &str) -> Fetch<CommitInfo>;

    async fn get_latest_release(&self, repo: &str) -> Fetch<ReleaseInfo>;

    /// All repositories under an organization/group, capped at
    /// [`MAX_PAGES`] pages of [`PER_PAGE`].
    async fn get_group_repos(&self, group: &str) -> Fetch<Vec<RepoInfo>>;
}

/// Enabled providers, built once at startup and shared by reference.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderKind, Arc<dyn GitProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one adapter per enabled provider section in `cfg`.
    pub fn from_config(cfg: &Config, fetcher: Arc<dyn JsonFetcher>) -> Result<Self> {
        let mut registry = Self::new();
        for kind in ProviderKind::ALL {
            let Some(pc) = cfg.provider(kind).filter(|p| p.enabled) else {
                continue;
            };
            let provider: Arc<dyn GitProvider> = match kind {
                ProviderKind::GitHub => Arc::new(
                    GitHubProvider::new(fetcher.clone(), &pc.token, &pc.api_url)
                        .context("invalid github api_url")?,
                ),
                ProviderKind::GitLab => Arc::new(
                    GitLabProvider::new(fetcher.clone(), &pc.token, &pc.api_url)
                        .context("invalid gitlab api_url")?,
                ),
                ProviderKind::Cnb => Arc::new(
                    CnbProvider::new(fetcher.clone(), &pc.token, &pc.api_url)
                        .context("invalid cnb api_url")?,
                ),
            };
            info!(provider = %kind, "provider initialized");
            registry.register(provider);
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn GitProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Lookup by configuration id, case-insensitive.
    pub fn get(&self, id: &str) -> Option<Arc<dyn GitProvider>> {
        ProviderKind::parse(id).and_then(|kind| self.providers.get(&kind).cloned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }
}

/// Parse a base URL, falling back to `default` when `raw` is blank.
pub(crate) fn base_url(raw: &str, default: &str) -> Result<Url> {
    let raw = raw.trim();
    let raw = if raw.is_empty() { default } else { raw };
    Url::parse(raw).with_context(|| format!("invalid base URL: {raw}"))
}

/// Append `parts` to the base path; each part is split on `/` so that
/// `owner/name` becomes two segments.
pub(crate) fn endpoint(base: &Url, parts: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty();
        for part in parts {
            path.extend(part.split('/').filter(|s| !s.is_empty()));
        }
    }
    url
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, FetchError> {
    serde_json::from_value(value).map_err(|err| FetchError::Decode(err.to_string()))
}

/// RFC 3339 timestamps become `YYYY-MM-DD HH:MM` in their own offset.
/// Empty input is reported as unknown; anything else passes through.
pub fn normalize_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return UNKNOWN_DATE.to_string();
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        Err(_) => raw.to_string(),
    }
}

pub fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim_end().to_string()
}

/// First line of the release notes, truncated to 200 chars.
pub fn release_body(text: &str) -> String {
    let line: String = first_line(text).chars().take(RELEASE_BODY_MAX_CHARS).collect();
    if line.is_empty() {
        EMPTY_RELEASE_BODY.to_string()
    } else {
        line
    }
}

/// First non-draft entry, or the first entry when all are drafts.
pub(crate) fn pick_published<T>(items: Vec<T>, is_draft: impl Fn(&T) -> bool) -> Option<T> {
    let idx = items.iter().position(|r| !is_draft(r)).unwrap_or(0);
    items.into_iter().nth(idx)
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
