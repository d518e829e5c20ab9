//! GitLab REST v4 adapter, including self-hosted instances.
//!
//! Projects are addressed by their URL-encoded full path. Fields read:
//! - project: `default_branch`
//! - commit (list, first entry): `id`, `message`, `author_name`, `committed_date`, `web_url`
//! - release (list): `tag_name`, `name`, `description`, `author.username`,
//!   `released_at`, `_links.self`, `draft`
//! - group projects: `path_with_namespace`, `path`, `default_branch`, `description`, `web_url`

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{
    base_url, decode, first_line, non_empty, normalize_timestamp, paginate, pick_published,
    release_body, ApiRequest, Fetch, FetchError, GitProvider, JsonFetcher, DEFAULT_BRANCH,
    UNKNOWN_AUTHOR,
};
use crate::model::{CommitInfo, ProviderKind, ReleaseInfo, RepoInfo};

pub const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4";

pub struct GitLabProvider {
    http: Arc<dyn JsonFetcher>,
    api: Url,
    /// Web root used for commit and release links.
    web: String,
    token: String,
}

#[derive(Deserialize)]
struct ProjectMeta {
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct Commit {
    id: Option<String>,
    message: Option<String>,
    author_name: Option<String>,
    committed_date: Option<String>,
    web_url: Option<String>,
}

#[derive(Deserialize)]
struct Author {
    username: Option<String>,
}

#[derive(Deserialize)]
struct Links {
    #[serde(rename = "self")]
    self_url: Option<String>,
}

#[derive(Deserialize)]
struct Release {
    tag_name: Option<String>,
    name: Option<String>,
    description: Option<String>,
    author: Option<Author>,
    released_at: Option<String>,
    #[serde(rename = "_links")]
    links: Option<Links>,
    #[serde(default)]
    draft: bool,
}

#[derive(Deserialize)]
struct Project {
    path_with_namespace: Option<String>,
    path: Option<String>,
    default_branch: Option<String>,
    description: Option<String>,
    web_url: Option<String>,
}

impl GitLabProvider {
    pub fn new(http: Arc<dyn JsonFetcher>, token: &str, api_url: &str) -> Result<Self> {
        let api = base_url(api_url, DEFAULT_API_URL)?;
        let root = api.as_str().trim_end_matches('/');
        let web = root.strip_suffix("/api/v4").unwrap_or(root).to_string();
        Ok(Self {
            http,
            api,
            web,
            token: token.to_string(),
        })
    }

    /// `{api}/{collection}/{encoded path}/{rest...}`; the path is a single
    /// segment so its `/` separators are percent-encoded.
    fn request(&self, collection: &str, path: &str, rest: &[&str]) -> ApiRequest {
        let mut url = self.api.clone();
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.pop_if_empty().push(collection).push(path).extend(rest);
        }
        let mut headers = Vec::new();
        if !self.token.is_empty() {
            headers.push(("Authorization", format!("Bearer {}", self.token)));
            headers.push(("PRIVATE-TOKEN", self.token.clone()));
        }
        ApiRequest::new(url, headers)
    }

    fn decode_commit(&self, value: Value, repo: &str, branch: &str) -> Fetch<CommitInfo> {
        let mut list: Vec<Commit> = decode(value)?;
        if list.is_empty() {
            return Ok(None);
        }
        let raw = list.swap_remove(0);
        let Some(sha) = non_empty(raw.id) else {
            return Ok(None);
        };
        let url = non_empty(raw.web_url)
            .unwrap_or_else(|| format!("{}/{}/-/commit/{}", self.web, repo, sha));
        Ok(Some(CommitInfo {
            message: first_line(raw.message.as_deref().unwrap_or_default()),
            author: non_empty(raw.author_name).unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            date: normalize_timestamp(raw.committed_date.as_deref().unwrap_or_default()),
            branch: branch.to_string(),
            repo: repo.to_string(),
            provider: ProviderKind::GitLab,
            url: Some(url),
            sha,
        }))
    }

    fn decode_release(&self, value: Value, repo: &str) -> Fetch<ReleaseInfo> {
        let list: Vec<Release> = decode(value)?;
        let Some(raw) = pick_published(list, |r| r.draft) else {
            return Ok(None);
        };
        let Some(tag) = non_empty(raw.tag_name) else {
            return Ok(None);
        };
        let url = raw
            .links
            .and_then(|l| non_empty(l.self_url))
            .unwrap_or_else(|| format!("{}/{}/-/releases/{}", self.web, repo, tag));
        Ok(Some(ReleaseInfo {
            name: non_empty(raw.name).unwrap_or_else(|| tag.clone()),
            body: release_body(raw.description.as_deref().unwrap_or_default()),
            author: raw
                .author
                .and_then(|a| non_empty(a.username))
                .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            date: normalize_timestamp(raw.released_at.as_deref().unwrap_or_default()),
            repo: repo.to_string(),
            provider: ProviderKind::GitLab,
            url: Some(url),
            tag,
        }))
    }
}

fn decode_project(value: Value) -> Result<RepoInfo, FetchError> {
    let raw: Project = decode(value)?;
    Ok(RepoInfo {
        full_name: raw.path_with_namespace.unwrap_or_default(),
        name: raw.path.unwrap_or_default(),
        default_branch: non_empty(raw.default_branch).unwrap_or_else(|| DEFAULT_BRANCH.into()),
        description: raw.description.unwrap_or_default(),
        url: raw.web_url.unwrap_or_default(),
    })
}

#[async_trait]
impl GitProvider for GitLabProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitLab
    }

    async fn get_default_branch(&self, repo: &str) -> String {
        let meta = match self.http.get_json(self.request("projects", repo, &[])).await {
            Ok(Some(v)) => decode::<ProjectMeta>(v).ok(),
            Ok(None) => None,
            Err(err) => {
                debug!(%err, repo, "default branch lookup failed");
                None
            }
        };
        meta.and_then(|m| non_empty(m.default_branch))
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    async fn get_latest_commit(&self, repo: &str, branch: &str) -> Fetch<CommitInfo> {
        let branch = if branch.is_empty() {
            self.get_default_branch(repo).await
        } else {
            branch.to_string()
        };
        let req = self
            .request("projects", repo, &["repository", "commits"])
            .query("per_page", "1")
            .query("ref_name", &branch);
        match self.http.get_json(req).await? {
            Some(value) => self.decode_commit(value, repo, &branch),
            None => Ok(None),
        }
    }

    async fn get_latest_release(&self, repo: &str) -> Fetch<ReleaseInfo> {
        let req = self.request("projects", repo, &["releases"]);
        match self.http.get_json(req).await? {
            Some(value) => self.decode_release(value, repo),
            None => Ok(None),
        }
    }

    /// Includes subgroups; archived projects are left out.
    async fn get_group_repos(&self, group: &str) -> Fetch<Vec<RepoInfo>> {
        let req = self
            .request("groups", group, &["projects"])
            .query("include_subgroups", "true")
            .query("archived", "false");
        let Some(items) = paginate(self.http.as_ref(), &req).await? else {
            return Ok(None);
        };
        let repos = items
            .into_iter()
            .map(decode_project)
            .collect::<std::result::Result<Vec<_>, FetchError>>()?;
        Ok(Some(repos))
    }
}
