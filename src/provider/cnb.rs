//! CNB (cnb.cool) adapter.
//!
//! Fields read:
//! - head: `name`
//! - commit (object, or list whose first entry is used): `sha` (or `id`),
//!   `message`, `author.name`, `author_name`, `committed_date` (or `created_at`)
//! - release (list): `tag_name` (or `tag`), `name`, `body` (or `description`),
//!   `author.username` (or `author.login`), `published_at` (or `released_at`), `draft`
//! - group repos: `name` (or `path`), `default_branch`, `description`
//!
//! Responses may carry both spellings of a field; the first one listed wins
//! unless it is empty.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{
    base_url, decode, endpoint, first_line, non_empty, normalize_timestamp, paginate,
    pick_published, release_body, ApiRequest, Fetch, GitProvider, JsonFetcher,
    DEFAULT_BRANCH, UNKNOWN_AUTHOR,
};
use crate::model::{CommitInfo, ProviderKind, ReleaseInfo, RepoInfo};

pub const DEFAULT_API_URL: &str = "https://api.cnb.cool";
const DEFAULT_WEB_URL: &str = "https://cnb.cool";

pub struct CnbProvider {
    http: Arc<dyn JsonFetcher>,
    api: Url,
    web: String,
    token: String,
}

#[derive(Deserialize)]
struct Head {
    name: Option<String>,
}

#[derive(Deserialize)]
struct CommitAuthor {
    name: Option<String>,
}

#[derive(Deserialize)]
struct Commit {
    sha: Option<String>,
    id: Option<String>,
    message: Option<String>,
    author: Option<CommitAuthor>,
    author_name: Option<String>,
    committed_date: Option<String>,
    created_at: Option<String>,
}

#[derive(Deserialize)]
struct Author {
    username: Option<String>,
    login: Option<String>,
}

#[derive(Deserialize)]
struct Release {
    tag_name: Option<String>,
    tag: Option<String>,
    name: Option<String>,
    body: Option<String>,
    description: Option<String>,
    author: Option<Author>,
    published_at: Option<String>,
    released_at: Option<String>,
    #[serde(default)]
    draft: bool,
}

#[derive(Deserialize)]
struct Repo {
    name: Option<String>,
    path: Option<String>,
    default_branch: Option<String>,
    description: Option<String>,
}

/// The first spelling that carries a non-blank value.
fn either(first: Option<String>, second: Option<String>) -> Option<String> {
    non_empty(first).or_else(|| non_empty(second))
}

/// The commits endpoint answers with either one object or a list.
fn first_entry(value: Value) -> Option<Value> {
    match value {
        Value::Array(list) => list.into_iter().next(),
        Value::Null => None,
        other => Some(other),
    }
}

impl CnbProvider {
    pub fn new(http: Arc<dyn JsonFetcher>, token: &str, api_url: &str) -> Result<Self> {
        let api = base_url(api_url, DEFAULT_API_URL)?;
        let web = if api_url.trim().is_empty() {
            DEFAULT_WEB_URL.to_string()
        } else {
            api.as_str()
                .trim_end_matches('/')
                .replacen("://api.", "://", 1)
        };
        Ok(Self {
            http,
            api,
            web,
            token: token.to_string(),
        })
    }

    fn request(&self, parts: &[&str]) -> ApiRequest {
        let mut headers = vec![("Accept", "application/vnd.cnb.api+json".to_string())];
        if !self.token.is_empty() {
            headers.push(("Authorization", format!("Bearer {}", self.token)));
        }
        ApiRequest::new(endpoint(&self.api, parts), headers)
    }

    fn decode_commit(&self, value: Value, repo: &str, branch: &str) -> Fetch<CommitInfo> {
        let Some(entry) = first_entry(value) else {
            return Ok(None);
        };
        let raw: Commit = decode(entry)?;
        let Some(sha) = either(raw.sha, raw.id) else {
            return Ok(None);
        };
        let author = raw
            .author
            .and_then(|a| non_empty(a.name))
            .or_else(|| non_empty(raw.author_name))
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
        Ok(Some(CommitInfo {
            message: first_line(raw.message.as_deref().unwrap_or_default()),
            author,
            date: normalize_timestamp(
                &either(raw.committed_date, raw.created_at).unwrap_or_default(),
            ),
            branch: branch.to_string(),
            repo: repo.to_string(),
            provider: ProviderKind::Cnb,
            url: Some(format!("{}/{}/-/commit/{}", self.web, repo, sha)),
            sha,
        }))
    }

    fn decode_release(&self, value: Value, repo: &str) -> Fetch<ReleaseInfo> {
        let list: Vec<Release> = match value {
            Value::Array(_) => decode(value)?,
            Value::Null => return Ok(None),
            other => vec![decode(other)?],
        };
        let Some(raw) = pick_published(list, |r| r.draft) else {
            return Ok(None);
        };
        let Some(tag) = either(raw.tag_name, raw.tag) else {
            return Ok(None);
        };
        Ok(Some(ReleaseInfo {
            name: non_empty(raw.name).unwrap_or_else(|| tag.clone()),
            body: release_body(&either(raw.body, raw.description).unwrap_or_default()),
            author: raw
                .author
                .and_then(|a| either(a.username, a.login))
                .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            date: normalize_timestamp(
                &either(raw.published_at, raw.released_at).unwrap_or_default(),
            ),
            repo: repo.to_string(),
            provider: ProviderKind::Cnb,
            url: Some(format!("{}/{}/-/releases/{}", self.web, repo, tag)),
            tag,
        }))
    }
}

#[async_trait]
impl GitProvider for CnbProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cnb
    }

    async fn get_default_branch(&self, repo: &str) -> String {
        let head = match self.http.get_json(self.request(&[repo, "-", "git", "head"])).await {
            Ok(Some(v)) => decode::<Head>(v).ok(),
            Ok(None) => None,
            Err(err) => {
                debug!(%err, repo, "default branch lookup failed");
                None
            }
        };
        head.and_then(|h| non_empty(h.name))
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    async fn get_latest_commit(&self, repo: &str, branch: &str) -> Fetch<CommitInfo> {
        let branch = if branch.is_empty() {
            self.get_default_branch(repo).await
        } else {
            branch.to_string()
        };
        let req = self.request(&[repo, "-", "git", "commits", &branch]);
        match self.http.get_json(req).await? {
            Some(value) => self.decode_commit(value, repo, &branch),
            None => Ok(None),
        }
    }

    async fn get_latest_release(&self, repo: &str) -> Fetch<ReleaseInfo> {
        let req = self.request(&[repo, "-", "releases"]);
        match self.http.get_json(req).await? {
            Some(value) => self.decode_release(value, repo),
            None => Ok(None),
        }
    }

    async fn get_group_repos(&self, group: &str) -> Fetch<Vec<RepoInfo>> {
        let req = self.request(&[group, "-", "repos"]);
        let Some(items) = paginate(self.http.as_ref(), &req).await? else {
            return Ok(None);
        };
        let mut repos = Vec::with_capacity(items.len());
        for item in items {
            let raw: Repo = decode(item)?;
            let Some(name) = either(raw.name, raw.path) else {
                continue;
            };
            let full_name = format!("{group}/{name}");
            repos.push(RepoInfo {
                url: format!("{}/{}", self.web, full_name),
                full_name,
                name,
                default_branch: non_empty(raw.default_branch)
                    .unwrap_or_else(|| DEFAULT_BRANCH.into()),
                description: raw.description.unwrap_or_default(),
            });
        }
        Ok(Some(repos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::ScriptedFetcher;
    use serde_json::json;

    fn provider(fetcher: &Arc<ScriptedFetcher>) -> CnbProvider {
        CnbProvider::new(fetcher.clone(), "cnb-token", "").unwrap()
    }

    #[tokio::test]
    async fn commit_from_list_with_head_lookup() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond("https://api.cnb.cool/team/app/-/git/head", json!({ "name": "master" }));
        fetcher.respond(
            "https://api.cnb.cool/team/app/-/git/commits/master",
            json!([{
                "sha": "feedbeef00",
                "message": "Ship it",
                "author": { "name": "Builder" },
                "committed_date": "2024-07-07T07:07:07Z"
            }]),
        );
        let commit = provider(&fetcher)
            .get_latest_commit("team/app", "")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commit.branch, "master");
        assert_eq!(commit.author, "Builder");
        assert_eq!(commit.url.as_deref(), Some("https://cnb.cool/team/app/-/commit/feedbeef00"));
        let req = fetcher.requests.lock().unwrap()[1].clone();
        assert_eq!(req.header("Authorization"), Some("Bearer cnb-token"));
    }

    #[tokio::test]
    async fn commit_object_with_id_and_flat_author() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "https://api.cnb.cool/team/app/-/git/commits/main",
            json!({ "id": "77", "message": "x", "author_name": "Flat", "created_at": "" }),
        );
        let commit = provider(&fetcher)
            .get_latest_commit("team/app", "main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commit.sha, "77");
        assert_eq!(commit.author, "Flat");
        assert_eq!(commit.date, crate::provider::UNKNOWN_DATE);
    }

    #[tokio::test]
    async fn release_list_and_aliases() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "https://api.cnb.cool/team/app/-/releases",
            json!([
                { "tag": "v0.2.0", "draft": true },
                { "tag": "v0.1.0", "description": "first", "author": { "login": "lg" } }
            ]),
        );
        let release = provider(&fetcher)
            .get_latest_release("team/app")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(release.tag, "v0.1.0");
        assert_eq!(release.body, "first");
        assert_eq!(release.author, "lg");
        assert_eq!(release.url.as_deref(), Some("https://cnb.cool/team/app/-/releases/v0.1.0"));
    }

    #[tokio::test]
    async fn release_with_both_spellings_prefers_the_primary() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "https://api.cnb.cool/team/app/-/releases",
            json!([{
                "tag_name": "v1",
                "tag": "legacy",
                "body": "b",
                "description": "d",
                "author": { "username": "u", "login": "l" },
                "published_at": "2024-01-02T03:04:05Z",
                "released_at": ""
            }]),
        );
        let release = provider(&fetcher)
            .get_latest_release("team/app")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(release.tag, "v1");
        assert_eq!(release.body, "b");
        assert_eq!(release.author, "u");
        assert_eq!(release.date, "2024-01-02 03:04");
    }

    #[tokio::test]
    async fn commit_with_both_spellings_prefers_the_primary() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "https://api.cnb.cool/team/app/-/git/commits/main",
            json!({
                "sha": "abc",
                "id": "def",
                "message": "m",
                "committed_date": "",
                "created_at": "2024-05-06T07:08:09Z"
            }),
        );
        let commit = provider(&fetcher)
            .get_latest_commit("team/app", "main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commit.sha, "abc");
        // an empty primary falls through to the other spelling
        assert_eq!(commit.date, "2024-05-06 07:08");
    }

    #[tokio::test]
    async fn empty_release_list_is_absent() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond("https://api.cnb.cool/team/app/-/releases", json!([]));
        assert!(provider(&fetcher)
            .get_latest_release("team/app")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn group_repos_build_full_names() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "https://api.cnb.cool/team/-/repos?page=1&per_page=100",
            json!([{ "name": "app" }, { "path": "lib", "default_branch": "dev" }, {}]),
        );
        let repos = provider(&fetcher).get_group_repos("team").await.unwrap().unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].full_name, "team/app");
        assert_eq!(repos[1].name, "lib");
        assert_eq!(repos[1].default_branch, "dev");
        assert_eq!(repos[1].url, "https://cnb.cool/team/lib");
    }

    #[tokio::test]
    async fn group_repo_with_name_and_path_uses_name() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "https://api.cnb.cool/team/-/repos?page=1&per_page=100",
            json!([{ "name": "app", "path": "team/app" }]),
        );
        let repos = provider(&fetcher).get_group_repos("team").await.unwrap().unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].full_name, "team/app");
        assert_eq!(repos[0].name, "app");
    }
}
