use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use git_watchbot::cache::UpdateCache;
use git_watchbot::checker::{CheckError, Checker};
use git_watchbot::config::{self, Config};
use git_watchbot::model::{CommitInfo, ProviderKind, ReleaseInfo, RepoInfo};
use git_watchbot::notifier::{MessageSink, Notifier, PushTarget};
use git_watchbot::provider::{Fetch, FetchError, GitProvider, ProviderRegistry};
use git_watchbot::scheduler::Scheduler;

/// GitHub stand-in whose latest commit and release are set by the test.
#[derive(Default)]
struct FakeGitHub {
    sha: Mutex<Option<String>>,
    tag: Mutex<Option<String>>,
    fail: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
    commit_calls: Mutex<usize>,
}

impl FakeGitHub {
    fn set_sha(&self, sha: &str) {
        *self.sha.lock().unwrap() = Some(sha.to_string());
    }

    fn set_tag(&self, tag: &str) {
        *self.tag.lock().unwrap() = Some(tag.to_string());
    }

    fn commit_calls(&self) -> usize {
        *self.commit_calls.lock().unwrap()
    }
}

#[async_trait]
impl GitProvider for FakeGitHub {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    async fn get_default_branch(&self, _repo: &str) -> String {
        "main".into()
    }

    async fn get_latest_commit(&self, repo: &str, branch: &str) -> Fetch<CommitInfo> {
        *self.commit_calls.lock().unwrap() += 1;
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail.lock().unwrap() {
            return Err(FetchError::Status(503));
        }
        let sha = self.sha.lock().unwrap().clone();
        Ok(sha.map(|sha| CommitInfo {
            url: Some(format!("https://github.com/{repo}/commit/{sha}")),
            sha,
            message: "Update README".into(),
            author: "octocat".into(),
            date: "2024-05-01 09:30".into(),
            branch: if branch.is_empty() { "main".into() } else { branch.into() },
            repo: repo.into(),
            provider: ProviderKind::GitHub,
        }))
    }

    async fn get_latest_release(&self, repo: &str) -> Fetch<ReleaseInfo> {
        let tag = self.tag.lock().unwrap().clone();
        Ok(tag.map(|tag| ReleaseInfo {
            name: tag.clone(),
            tag,
            body: "notes".into(),
            author: "octocat".into(),
            date: "2024-05-01 09:30".into(),
            repo: repo.into(),
            provider: ProviderKind::GitHub,
            url: None,
        }))
    }

    async fn get_group_repos(&self, _group: &str) -> Fetch<Vec<RepoInfo>> {
        Ok(Some(vec![RepoInfo {
            full_name: "octo/tools".into(),
            name: "tools".into(),
            default_branch: "main".into(),
            description: String::new(),
            url: String::new(),
        }]))
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(String, String)>>,
    fail: Mutex<bool>,
    /// When set, the cache file's inode is recorded at every send.
    watch_file: Mutex<Option<std::path::PathBuf>>,
    inodes_at_send: Mutex<Vec<u64>>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send(&self, target: &PushTarget, text: &str) -> Result<()> {
        if *self.fail.lock().unwrap() {
            bail!("telegram unavailable");
        }
        let watched = self.watch_file.lock().unwrap().clone();
        if let Some(path) = watched {
            self.inodes_at_send.lock().unwrap().push(inode(&path));
        }
        self.sent
            .lock()
            .unwrap()
            .push((target.id.clone(), text.to_string()));
        Ok(())
    }
}

/// Every cache write renames a fresh temp file over the store, so the
/// store's inode moves on each write.
#[cfg(unix)]
fn inode(path: &std::path::Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).unwrap().ino()
}

#[cfg(not(unix))]
fn inode(_path: &std::path::Path) -> u64 {
    0
}

struct Harness {
    provider: Arc<FakeGitHub>,
    sink: Arc<RecordingSink>,
    checker: Arc<Checker>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn cache_path(&self) -> std::path::PathBuf {
        self.dir.path().join("cache.json")
    }

    async fn cache(&self) -> UpdateCache {
        UpdateCache::load(self.cache_path()).await
    }
}

fn test_config(dir: &std::path::Path, extra: &str) -> Config {
    let yaml = format!(
        r#"
app:
  data_dir: "{}"
telegram:
  bot_token: "test-token"
github: {{ token: "" }}
push_groups: [-100]
{extra}
"#,
        dir.display()
    );
    config::parse(&yaml).unwrap()
}

async fn harness(extra: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), extra);
    let provider = Arc::new(FakeGitHub::default());
    let mut registry = ProviderRegistry::new();
    registry.register(provider.clone());
    let sink = Arc::new(RecordingSink::default());
    let (groups, users) = cfg.all_push_targets();
    let notifier = Notifier::new(sink.clone(), &groups, &users);
    let cache = UpdateCache::load(cfg.app.cache_path()).await;
    let checker = Arc::new(Checker::new(&cfg, Arc::new(registry), cache, notifier));
    Harness {
        provider,
        sink,
        checker,
        dir,
    }
}

const ONE_REPO: &str = r#"
watch_repos:
  - provider: github
    repo: octo/repo
    branch: main
"#;

#[tokio::test]
async fn first_observation_is_silent_then_change_notifies_once() {
    let h = harness(ONE_REPO).await;

    h.provider.set_sha("abc1234");
    let report = h.checker.check_and_push().await.unwrap();
    assert_eq!(report.updates, 0);
    assert!(h.sink.messages().is_empty());
    assert_eq!(
        h.cache().await.get_cached_commit_sha("github", "octo/repo", "main"),
        Some("abc1234")
    );
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(h.cache_path()).unwrap()).unwrap();
    assert_eq!(raw["commit:github:octo/repo:main"]["sha"], "abc1234");

    h.provider.set_sha("def5678");
    let report = h.checker.check_and_push().await.unwrap();
    assert_eq!(report.updates, 1);
    let messages = h.sink.messages();
    assert_eq!(messages.len(), 1);
    let (target, text) = &messages[0];
    assert_eq!(target, "-100");
    assert!(text.contains("octo/repo"));
    assert!(text.contains("main"));
    assert!(text.contains("def5678"));
    assert_eq!(
        h.cache().await.get_cached_commit_sha("github", "octo/repo", "main"),
        Some("def5678")
    );
}

#[cfg(unix)]
#[tokio::test]
async fn changed_value_is_written_once_before_delivery() {
    let h = harness(ONE_REPO).await;
    h.provider.set_sha("abc1234");
    h.checker.check_and_push().await.unwrap();
    let before = std::fs::read_to_string(h.cache_path()).unwrap();

    *h.sink.watch_file.lock().unwrap() = Some(h.cache_path());
    h.provider.set_sha("def5678");
    h.checker.check_and_push().await.unwrap();

    // written by the time the message goes out, and never again afterwards
    let at_send = h.sink.inodes_at_send.lock().unwrap().clone();
    assert_eq!(at_send.len(), 1);
    let after_cycle = inode(&h.cache_path());
    assert_eq!(at_send[0], after_cycle);
    let after = std::fs::read_to_string(h.cache_path()).unwrap();
    assert_ne!(before, after);
    let raw: serde_json::Value = serde_json::from_str(&after).unwrap();
    assert_eq!(raw["commit:github:octo/repo:main"]["sha"], "def5678");
    assert_eq!(h.cache().await.stats().commits, 1);

    // an unchanged value leaves the store alone
    let modified = std::fs::metadata(h.cache_path()).unwrap().modified().unwrap();
    h.checker.check_and_push().await.unwrap();
    assert_eq!(inode(&h.cache_path()), after_cycle);
    assert_eq!(std::fs::metadata(h.cache_path()).unwrap().modified().unwrap(), modified);
    assert_eq!(std::fs::read_to_string(h.cache_path()).unwrap(), after);
}

#[tokio::test]
async fn unchanged_upstream_is_idempotent() {
    let h = harness(ONE_REPO).await;
    h.provider.set_sha("abc1234");
    h.checker.check_and_push().await.unwrap();
    h.provider.set_sha("def5678");
    h.checker.check_and_push().await.unwrap();

    let report = h.checker.check_and_push().await.unwrap();
    assert_eq!(report.updates, 0);
    assert_eq!(report.checked, 1);
    assert_eq!(h.sink.messages().len(), 1);
}

#[tokio::test]
async fn failed_delivery_still_advances_the_cache() {
    let h = harness(ONE_REPO).await;
    h.provider.set_sha("abc1234");
    h.checker.check_and_push().await.unwrap();

    *h.sink.fail.lock().unwrap() = true;
    h.provider.set_sha("def5678");
    let report = h.checker.check_and_push().await.unwrap();
    assert_eq!(report.updates, 1);
    assert_eq!(report.delivery.failed, 1);
    assert_eq!(
        h.cache().await.get_cached_commit_sha("github", "octo/repo", "main"),
        Some("def5678")
    );

    // no resend once delivery recovers
    *h.sink.fail.lock().unwrap() = false;
    h.checker.check_and_push().await.unwrap();
    assert!(h.sink.messages().is_empty());
}

#[tokio::test]
async fn first_push_notifies_on_first_observation() {
    let h = harness(&format!("first_push: true\n{ONE_REPO}")).await;
    h.provider.set_sha("abc1234");
    let report = h.checker.check_and_push().await.unwrap();
    assert_eq!(report.updates, 1);
    assert_eq!(h.sink.messages().len(), 1);
}

#[tokio::test]
async fn releases_and_notes() {
    let h = harness(
        r#"
watch_repos:
  - provider: github
    repo: octo/repo
    watch_type: release
    note: "prod"
"#,
    )
    .await;
    h.provider.set_tag("v1.0.0");
    h.checker.check_and_push().await.unwrap();
    h.provider.set_tag("v1.1.0");
    h.checker.check_and_push().await.unwrap();

    let messages = h.sink.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].1.starts_with("🚀 【GitHub】octo/repo\n🏷️ 版本: v1.1.0"));
    assert!(messages[0].1.ends_with("\n📌 备注: prod"));
    assert_eq!(
        h.cache().await.get_cached_release_tag("github", "octo/repo"),
        Some("v1.1.0")
    );
}

#[tokio::test]
async fn disabled_provider_is_skipped_and_failures_counted() {
    let h = harness(
        r#"
watch_repos:
  - { provider: github, repo: octo/repo }
  - { provider: gitlab, repo: grp/app }
  - { provider: sourcehut, repo: x/y }
"#,
    )
    .await;
    *h.provider.fail.lock().unwrap() = true;
    let report = h.checker.check_and_push().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failed, 1);
    assert!(h.cache().await.is_first_commit_check("github", "octo/repo", "main"));
}

#[tokio::test]
async fn expanded_group_repos_are_checked() {
    let h = harness(
        r#"
watch_groups:
  - { provider: github, org: octo }
"#,
    )
    .await;
    assert_eq!(h.checker.refresh_groups().await, 1);
    h.provider.set_sha("abc1234");
    let report = h.checker.check_and_push().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(
        h.cache().await.get_cached_commit_sha("github", "octo/tools", "main"),
        Some("abc1234")
    );
}

#[tokio::test]
async fn clear_is_scoped() {
    let h = harness(ONE_REPO).await;
    h.provider.set_sha("abc1234");
    h.checker.check_and_push().await.unwrap();

    assert_eq!(h.checker.clear_cache(Some("gitlab"), None).await.unwrap(), 0);
    assert_eq!(
        h.checker
            .clear_cache(Some("github"), Some("octo/repo"))
            .await
            .unwrap(),
        1
    );
    assert_eq!(h.checker.cache_stats().await.commits, 0);
}

#[tokio::test]
async fn concurrent_cycle_is_rejected() {
    let h = harness(ONE_REPO).await;
    h.provider.set_sha("abc1234");
    *h.provider.delay.lock().unwrap() = Some(Duration::from_millis(200));

    let running = {
        let checker = h.checker.clone();
        tokio::spawn(async move { checker.check_and_push().await })
    };
    // let the spawned cycle take the guard
    while h.provider.commit_calls() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        h.checker.check_and_push().await,
        Err(CheckError::AlreadyRunning)
    ));
    assert!(running.await.unwrap().is_ok());
    assert!(h.checker.check_and_push().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn scheduler_runs_each_interval_until_shutdown() {
    let h = harness(ONE_REPO).await;
    h.provider.set_sha("abc1234");

    let scheduler = Scheduler::start(h.checker.clone(), Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.provider.commit_calls(), 0);

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(h.provider.commit_calls(), 2);

    // a failing cycle does not stop the timer
    *h.provider.fail.lock().unwrap() = true;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.provider.commit_calls(), 3);

    scheduler.shutdown().await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.provider.commit_calls(), 3);
}
