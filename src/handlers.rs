use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;
use teloxide::prelude::*;
use tracing::{error, info, instrument, warn};

use crate::cache::CacheStats;
use crate::checker::{CheckError, Checker};
use crate::config::Config;
use crate::model::{GroupWatchEntry, ProviderKind, RepoWatchEntry};
use crate::provider::ProviderRegistry;

static COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/git_push_([a-z]+)(?:@\w+)?(?:\s+(.*))?$").expect("valid command regex")
});

/// Expanded repositories shown by `/git_push_list`.
const LIST_EXPANDED_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Check,
    Status,
    List,
    Providers,
    Refresh,
    Clear {
        provider: Option<String>,
        repo: Option<String>,
    },
}

impl Command {
    /// `None` for anything that is not one of our commands.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = COMMAND_RE.captures(text.trim())?;
        let mut args = caps
            .get(2)
            .map(|m| m.as_str().split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter();
        let cmd = match &caps[1] {
            "help" => Command::Help,
            "check" => Command::Check,
            "status" => Command::Status,
            "list" => Command::List,
            "providers" => Command::Providers,
            "refresh" => Command::Refresh,
            "clear" => Command::Clear {
                provider: args.next(),
                repo: args.next(),
            },
            _ => return None,
        };
        Some(cmd)
    }
}

#[instrument(skip_all)]
pub async fn handle_update(bot: &Bot, cfg: &Config, checker: &Checker, msg: &Message) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(command) = Command::parse(text) else {
        return Ok(());
    };
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;
    if !cfg.telegram.allowed_users.is_empty() && !cfg.telegram.allowed_users.contains(&user_id) {
        warn!(user_id, "command from user not in allowed_users");
        return Ok(());
    }
    info!(user_id, ?command, "command received");

    let reply = match command {
        Command::Help => help_text().to_string(),
        Command::Check => {
            let _ = bot.send_message(msg.chat.id, "正在检查仓库更新...").await;
            match checker.check_and_push().await {
                Ok(report) if report.updates > 0 => {
                    format!("✅ 检查完成，发现 {} 个仓库有更新", report.updates)
                }
                Ok(_) => "✅ 检查完成，没有发现仓库更新".to_string(),
                Err(CheckError::AlreadyRunning) => "⏳ 已有检查正在进行，请稍后再试".to_string(),
            }
        }
        Command::Status => {
            let expanded = checker.expanded_entries().await.len();
            render_status(cfg, expanded, &checker.cache_stats().await)
        }
        Command::List => render_list(
            checker.watch_repos(),
            checker.watch_groups(),
            &checker.expanded_entries().await,
            checker.registry(),
        ),
        Command::Providers => render_providers(cfg),
        Command::Refresh => {
            let _ = bot.send_message(msg.chat.id, "正在刷新群组仓库列表...").await;
            let count = checker.refresh_groups().await;
            format!("✅ 刷新完成，共展开 {count} 个仓库")
        }
        Command::Clear { provider, repo } => {
            match checker.clear_cache(provider.as_deref(), repo.as_deref()).await {
                Ok(removed) => format!("✅ 已清除 {removed} 条缓存记录"),
                Err(err) => {
                    error!(%err, "cache clear failed");
                    format!("❌ 清除失败: {err}")
                }
            }
        }
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

pub fn help_text() -> &'static str {
    r#"📖 Git推送插件帮助

🔹 基础指令:
  /git_push_help - 显示帮助
  /git_push_check - 检查仓库更新
  /git_push_status - 查看当前状态
  /git_push_list - 列出监听的仓库和群组
  /git_push_providers - 查看提供商状态
  /git_push_refresh - 刷新群组仓库列表
  /git_push_clear [provider] [repo] - 清除更新缓存

🔹 监听配置:
  1. 仓库级别：监听单个仓库
  2. 群组级别：监听整个组织/群组下的所有仓库

🔹 配置示例:

  仓库监听 (watch_repos):
[
  {
    "provider": "github",
    "repo": "owner/repo",
    "branch": "main",
    "watch_type": "commits",
    "note": "备注"
  }
]

  群组监听 (watch_groups):
[
  {
    "provider": "github",
    "group": "organization-name",
    "watch_type": "commits",
    "include_repos": [],
    "exclude_repos": ["test-repo"],
    "note": "整个组织"
  }
]

🔹 获取令牌:
  GitHub: https://github.com/settings/tokens
  GitLab: https://gitlab.com/-/profile/personal_access_tokens
  CNB: https://cnb.cool/-/profile/personal_access_tokens
"#
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "✅ 开启"
    } else {
        "❌ 关闭"
    }
}

pub fn render_status(cfg: &Config, expanded: usize, stats: &CacheStats) -> String {
    let (groups, users) = cfg.all_push_targets();
    let mut text = String::from("📊 Git推送插件状态\n\n");
    let _ = writeln!(text, "🔄 自动检查: {}", on_off(cfg.auto_check));
    if cfg.auto_check {
        let _ = writeln!(text, "   间隔: {} 秒", cfg.check_interval);
    }
    let _ = writeln!(text, "🔔 首次推送: {}\n", on_off(cfg.first_push));
    let _ = writeln!(text, "📢 推送群聊: {} 个", groups.len());
    let _ = writeln!(text, "📢 推送用户: {} 个\n", users.len());
    let _ = writeln!(text, "📦 直接监听仓库: {} 个", cfg.all_watch_repos().len());
    let _ = writeln!(text, "📂 监听群组: {} 个", cfg.all_watch_groups().len());
    let _ = writeln!(text, "📦 群组展开仓库: {} 个", expanded);
    let _ = write!(
        text,
        "🗂️ 缓存: {} 提交 / {} 版本 / {} 群组",
        stats.commits, stats.releases, stats.groups
    );
    text
}

pub fn render_list(
    repos: &[RepoWatchEntry],
    groups: &[GroupWatchEntry],
    expanded: &[RepoWatchEntry],
    registry: &ProviderRegistry,
) -> String {
    if repos.is_empty() && groups.is_empty() {
        return "📋 当前没有监听任何仓库或群组".to_string();
    }
    let status = |provider: &str| if registry.contains(provider) { "✅" } else { "❌" };
    let mut text = String::from("📋 监听配置列表\n\n");

    if !repos.is_empty() {
        text.push_str("🔹 直接监听仓库:\n");
        for (i, repo) in repos.iter().enumerate() {
            let _ = writeln!(
                text,
                "  {} [{}] {}/{}",
                status(&repo.provider),
                i + 1,
                repo.provider,
                repo.repo
            );
            let _ = write!(text, "       类型: {}", repo.watch_kind);
            if !repo.branch.is_empty() {
                let _ = write!(text, " | 分支: {}", repo.branch);
            }
            text.push('\n');
        }
        text.push('\n');
    }

    if !groups.is_empty() {
        text.push_str("🔹 监听群组:\n");
        for (i, group) in groups.iter().enumerate() {
            let _ = writeln!(
                text,
                "  {} [{}] {}/{}",
                status(&group.provider),
                i + 1,
                group.provider,
                group.group
            );
            let _ = write!(text, "       类型: {}", group.watch_kind);
            if !group.include_repos.is_empty() {
                let _ = write!(text, " | 包含: {}", group.include_repos.len());
            }
            if !group.exclude_repos.is_empty() {
                let _ = write!(text, " | 排除: {}", group.exclude_repos.len());
            }
            text.push('\n');
        }
        text.push('\n');
    }

    if !expanded.is_empty() {
        let _ = writeln!(text, "🔹 群组展开仓库 ({} 个):", expanded.len());
        for (i, repo) in expanded.iter().take(LIST_EXPANDED_LIMIT).enumerate() {
            let _ = writeln!(text, "  [{}] {}/{}", i + 1, repo.provider, repo.repo);
        }
        if expanded.len() > LIST_EXPANDED_LIMIT {
            let _ = writeln!(text, "  ... 还有 {} 个", expanded.len() - LIST_EXPANDED_LIMIT);
        }
    }
    text
}

pub fn render_providers(cfg: &Config) -> String {
    let mut text = String::from("🔌 提供商状态\n\n");
    for kind in ProviderKind::ALL {
        match cfg.provider(kind).filter(|p| p.enabled) {
            Some(pc) => {
                let url = if pc.api_url.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", pc.api_url)
                };
                let token = if pc.token.is_empty() { "⚠️ 未配置" } else { "✅ 已配置" };
                let _ = writeln!(text, "✅ {}{}", kind.display_name(), url);
                let _ = writeln!(text, "   令牌: {token}");
            }
            None => {
                let _ = writeln!(text, "❌ {}", kind.display_name());
                text.push_str("   状态: 未启用\n");
            }
        }
        text.push('\n');
    }
    text
}
