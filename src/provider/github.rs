//! GitHub REST v3 adapter.
//!
//! Fields read:
//! - repo: `default_branch`
//! - commit: `sha`, `html_url`, `commit.message`, `commit.author.{name,date}`, `author.login`
//! - release: `tag_name`, `name`, `body`, `author.login`, `published_at`, `html_url`
//! - listing: `full_name`, `name`, `default_branch`, `description`, `html_url`

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{
    base_url, decode, endpoint, first_line, non_empty, normalize_timestamp, paginate,
    release_body, ApiRequest, Fetch, FetchError, GitProvider, JsonFetcher, DEFAULT_BRANCH,
    UNKNOWN_AUTHOR,
};
use crate::model::{CommitInfo, ProviderKind, ReleaseInfo, RepoInfo};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const WEB_URL: &str = "https://github.com";

pub struct GitHubProvider {
    http: Arc<dyn JsonFetcher>,
    api: Url,
    token: String,
}

#[derive(Deserialize)]
struct RepoMeta {
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct User {
    login: Option<String>,
}

#[derive(Deserialize)]
struct GitAuthor {
    name: Option<String>,
    date: Option<String>,
}

#[derive(Deserialize)]
struct CommitDetail {
    message: Option<String>,
    author: Option<GitAuthor>,
}

#[derive(Deserialize)]
struct Commit {
    sha: Option<String>,
    commit: Option<CommitDetail>,
    author: Option<User>,
    html_url: Option<String>,
}

#[derive(Deserialize)]
struct Release {
    tag_name: Option<String>,
    name: Option<String>,
    body: Option<String>,
    author: Option<User>,
    published_at: Option<String>,
    html_url: Option<String>,
}

#[derive(Deserialize)]
struct Repo {
    full_name: Option<String>,
    name: Option<String>,
    default_branch: Option<String>,
    description: Option<String>,
    html_url: Option<String>,
}

pub(crate) fn decode_commit(value: Value, repo: &str, branch: &str) -> Fetch<CommitInfo> {
    let raw: Commit = decode(value)?;
    let Some(sha) = non_empty(raw.sha) else {
        return Ok(None);
    };
    let (message, git_author, date) = match raw.commit {
        Some(detail) => {
            let (name, date) = match detail.author {
                Some(a) => (a.name, a.date),
                None => (None, None),
            };
            (detail.message.unwrap_or_default(), name, date)
        }
        None => (String::new(), None, None),
    };
    let author = raw
        .author
        .and_then(|u| non_empty(u.login))
        .or_else(|| non_empty(git_author))
        .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
    let url = non_empty(raw.html_url).unwrap_or_else(|| format!("{WEB_URL}/{repo}/commit/{sha}"));
    Ok(Some(CommitInfo {
        message: first_line(&message),
        author,
        date: normalize_timestamp(date.as_deref().unwrap_or_default()),
        branch: branch.to_string(),
        repo: repo.to_string(),
        provider: ProviderKind::GitHub,
        url: Some(url),
        sha,
    }))
}

pub(crate) fn decode_release(value: Value, repo: &str) -> Fetch<ReleaseInfo> {
    let raw: Release = decode(value)?;
    let Some(tag) = non_empty(raw.tag_name) else {
        return Ok(None);
    };
    let url = non_empty(raw.html_url)
        .unwrap_or_else(|| format!("{WEB_URL}/{repo}/releases/tag/{tag}"));
    Ok(Some(ReleaseInfo {
        name: raw.name.unwrap_or_default(),
        body: release_body(raw.body.as_deref().unwrap_or_default()),
        author: raw
            .author
            .and_then(|u| non_empty(u.login))
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
        date: normalize_timestamp(raw.published_at.as_deref().unwrap_or_default()),
        repo: repo.to_string(),
        provider: ProviderKind::GitHub,
        url: Some(url),
        tag,
    }))
}

fn decode_repo(value: Value) -> Result<RepoInfo, FetchError> {
    let raw: Repo = decode(value)?;
    Ok(RepoInfo {
        full_name: raw.full_name.unwrap_or_default(),
        name: raw.name.unwrap_or_default(),
        default_branch: non_empty(raw.default_branch).unwrap_or_else(|| DEFAULT_BRANCH.into()),
        description: raw.description.unwrap_or_default(),
        url: raw.html_url.unwrap_or_default(),
    })
}

impl GitHubProvider {
    /// `api_url` may be blank (public GitHub) or a GitHub Enterprise API
    /// root; a trailing `/repos` is tolerated.
    pub fn new(http: Arc<dyn JsonFetcher>, token: &str, api_url: &str) -> Result<Self> {
        let trimmed = api_url.trim().trim_end_matches('/');
        let trimmed = trimmed.strip_suffix("/repos").unwrap_or(trimmed);
        Ok(Self {
            http,
            api: base_url(trimmed, DEFAULT_API_URL)?,
            token: token.to_string(),
        })
    }

    fn request(&self, parts: &[&str]) -> ApiRequest {
        let mut headers = vec![("Accept", "application/vnd.github+json".to_string())];
        if !self.token.is_empty() {
            headers.push(("Authorization", format!("Bearer {}", self.token)));
        }
        ApiRequest::new(endpoint(&self.api, parts), headers)
    }

    async fn list_repos(&self, parts: &[&str]) -> Fetch<Vec<RepoInfo>> {
        let Some(items) = paginate(self.http.as_ref(), &self.request(parts)).await? else {
            return Ok(None);
        };
        let repos = items
            .into_iter()
            .map(decode_repo)
            .collect::<std::result::Result<Vec<_>, FetchError>>()?;
        Ok(Some(repos))
    }
}

#[async_trait]
impl GitProvider for GitHubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    async fn get_default_branch(&self, repo: &str) -> String {
        let meta = match self.http.get_json(self.request(&["repos", repo])).await {
            Ok(Some(v)) => decode::<RepoMeta>(v).ok(),
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
        let req = self.request(&["repos", repo, "commits", &branch]);
        match self.http.get_json(req).await? {
            Some(value) => decode_commit(value, repo, &branch),
            None => Ok(None),
        }
    }

    async fn get_latest_release(&self, repo: &str) -> Fetch<ReleaseInfo> {
        let req = self.request(&["repos", repo, "releases", "latest"]);
        match self.http.get_json(req).await? {
            Some(value) => decode_release(value, repo),
            None => Ok(None),
        }
    }

    /// Tries the organization listing first and the user listing only
    /// when that yields nothing.
    async fn get_group_repos(&self, group: &str) -> Fetch<Vec<RepoInfo>> {
        let org = self.list_repos(&["orgs", group, "repos"]).await;
        match org {
            Ok(Some(repos)) if !repos.is_empty() => return Ok(Some(repos)),
            Ok(_) => {}
            Err(err) => debug!(%err, group, "org listing failed; trying user listing"),
        }
        self.list_repos(&["users", group, "repos"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::ScriptedFetcher;
    use crate::provider::{EMPTY_RELEASE_BODY, PER_PAGE};
    use serde_json::json;

    fn provider(fetcher: &Arc<ScriptedFetcher>) -> GitHubProvider {
        GitHubProvider::new(fetcher.clone(), "tok", "").unwrap()
    }

    #[tokio::test]
    async fn latest_commit_resolves_default_branch() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "https://api.github.com/repos/octo/repo",
            json!({ "default_branch": "trunk" }),
        );
        fetcher.respond(
            "https://api.github.com/repos/octo/repo/commits/trunk",
            json!({
                "sha": "abc1234def",
                "html_url": "https://github.com/octo/repo/commit/abc1234def",
                "commit": {
                    "message": "Fix the thing\n\nLonger body",
                    "author": { "name": "Octo Cat", "date": "2024-05-01T08:30:00Z" }
                },
                "author": { "login": "octocat" }
            }),
        );
        let commit = provider(&fetcher)
            .get_latest_commit("octo/repo", "")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commit.sha, "abc1234def");
        assert_eq!(commit.branch, "trunk");
        assert_eq!(commit.message, "Fix the thing");
        assert_eq!(commit.author, "octocat");
        assert_eq!(commit.date, "2024-05-01 08:30");

        let req = fetcher.requests.lock().unwrap()[1].clone();
        assert_eq!(req.header("Authorization"), Some("Bearer tok"));
        assert_eq!(req.header("Accept"), Some("application/vnd.github+json"));
    }

    #[test]
    fn commit_author_falls_back_to_git_name() {
        let commit = decode_commit(
            json!({ "sha": "1", "commit": { "message": "m", "author": { "name": "Git Name" } }, "author": null }),
            "o/r",
            "main",
        )
        .unwrap()
        .unwrap();
        assert_eq!(commit.author, "Git Name");
        assert_eq!(commit.url.as_deref(), Some("https://github.com/o/r/commit/1"));
    }

    #[test]
    fn commit_without_sha_is_absent() {
        assert!(decode_commit(json!({ "message": "Not Found" }), "o/r", "main")
            .unwrap()
            .is_none());
        assert!(decode_commit(json!([1, 2]), "o/r", "main").is_err());
    }

    #[tokio::test]
    async fn default_branch_falls_back_to_main() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.fail("https://api.github.com/repos/octo/gone", 500);
        assert_eq!(provider(&fetcher).get_default_branch("octo/gone").await, "main");
        assert_eq!(provider(&fetcher).get_default_branch("octo/missing").await, "main");
    }

    #[tokio::test]
    async fn latest_release_decodes() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "https://api.github.com/repos/octo/repo/releases/latest",
            json!({
                "tag_name": "v2.0.0",
                "name": "Big one",
                "body": "",
                "author": { "login": "rel-bot" },
                "published_at": "2024-06-01T00:00:00Z",
                "html_url": "https://github.com/octo/repo/releases/tag/v2.0.0"
            }),
        );
        let release = provider(&fetcher)
            .get_latest_release("octo/repo")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(release.tag, "v2.0.0");
        assert_eq!(release.name, "Big one");
        assert_eq!(release.body, EMPTY_RELEASE_BODY);
        assert_eq!(release.author, "rel-bot");
        assert_eq!(release.date, "2024-06-01 00:00");
    }

    #[tokio::test]
    async fn missing_release_is_absent_and_errors_propagate() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        assert!(provider(&fetcher)
            .get_latest_release("octo/none")
            .await
            .unwrap()
            .is_none());
        fetcher.fail("https://api.github.com/repos/octo/err/releases/latest", 403);
        assert!(matches!(
            provider(&fetcher).get_latest_release("octo/err").await,
            Err(FetchError::Status(403))
        ));
    }

    #[tokio::test]
    async fn group_repos_fall_back_to_user_listing() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            &format!("https://api.github.com/users/someone/repos?page=1&per_page={PER_PAGE}"),
            json!([
                { "full_name": "someone/a", "name": "a", "default_branch": "main" },
                { "full_name": "someone/b", "name": "b", "default_branch": "dev", "description": "B" }
            ]),
        );
        let repos = provider(&fetcher)
            .get_group_repos("someone")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[1].default_branch, "dev");
        assert_eq!(
            fetcher.urls()[0],
            "https://api.github.com/orgs/someone/repos?page=1&per_page=100"
        );
    }

    #[tokio::test]
    async fn org_listing_wins_when_present() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(
            "https://api.github.com/orgs/octo/repos?page=1&per_page=100",
            json!([{ "full_name": "octo/x", "name": "x" }]),
        );
        let repos = provider(&fetcher).get_group_repos("octo").await.unwrap().unwrap();
        assert_eq!(repos[0].full_name, "octo/x");
        assert_eq!(repos[0].default_branch, "main");
        assert_eq!(fetcher.urls().len(), 1);
    }

    #[test]
    fn enterprise_base_url_strips_repos_suffix() {
        let fetcher: Arc<dyn JsonFetcher> = Arc::new(ScriptedFetcher::default());
        let p = GitHubProvider::new(fetcher, "", "https://ghe.corp/api/v3/repos/").unwrap();
        let req = p.request(&["repos", "a/b"]);
        assert_eq!(req.url.as_str(), "https://ghe.corp/api/v3/repos/a/b");
        assert!(req.header("Authorization").is_none());
    }
}
