//! Message rendering and fan-out to push targets.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::Recipient;
use tracing::{error, info};

use crate::model::{CommitInfo, ReleaseInfo, Update};
use crate::provider::RELEASE_BODY_MAX_CHARS;

pub fn format_commit(commit: &CommitInfo) -> String {
    let mut text = [
        format!("📦 【{}】{}", commit.provider.display_name(), commit.repo),
        format!("🌿 分支: {}", commit.branch),
        format!("📝 提交: {}", commit.short_sha()),
        format!("👤 作者: {}", commit.author),
        format!("⏰ 时间: {}", commit.date),
        format!("💬 信息: {}", commit.message),
    ]
    .join("\n");
    if let Some(url) = &commit.url {
        text.push_str(&format!("\n🔗 链接: {url}"));
    }
    text
}

pub fn format_release(release: &ReleaseInfo) -> String {
    let mut lines = vec![
        format!("🚀 【{}】{}", release.provider.display_name(), release.repo),
        format!("🏷️ 版本: {}", release.tag),
    ];
    if !release.name.is_empty() && release.name != release.tag {
        lines.push(format!("📋 名称: {}", release.name));
    }
    if !release.author.is_empty() {
        lines.push(format!("👤 发布者: {}", release.author));
    }
    lines.push(format!("⏰ 时间: {}", release.date));
    let body: String = release.body.chars().take(RELEASE_BODY_MAX_CHARS).collect();
    lines.push(format!("📄 说明: {body}"));
    let mut text = lines.join("\n");
    if let Some(url) = &release.url {
        text.push_str(&format!("\n🔗 链接: {url}"));
    }
    text
}

/// Render an update, appending the watch entry's note when present.
pub fn render(update: &Update, note: &str) -> String {
    let mut text = match update {
        Update::Commit(c) => format_commit(c),
        Update::Release(r) => format_release(r),
    };
    if !note.is_empty() {
        text.push_str(&format!("\n📌 备注: {note}"));
    }
    text
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Group,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub kind: TargetKind,
    pub id: String,
}

impl PushTarget {
    pub fn group(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Group,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::User,
            id: id.into(),
        }
    }

    /// Numeric ids are chats; `@name` is a public channel or group username.
    pub fn recipient(&self) -> Result<Recipient> {
        let id = self.id.trim();
        if id.starts_with('@') && id.len() > 1 {
            return Ok(Recipient::ChannelUsername(id.to_string()));
        }
        id.parse::<i64>()
            .map(|n| Recipient::Id(ChatId(n)))
            .map_err(|_| anyhow!("invalid push target: {id}"))
    }
}

impl fmt::Display for PushTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TargetKind::Group => write!(f, "group {}", self.id),
            TargetKind::User => write!(f, "user {}", self.id),
        }
    }
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, target: &PushTarget, text: &str) -> Result<()>;
}

/// Delivers through the Telegram Bot API.
pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MessageSink for TelegramSink {
    async fn send(&self, target: &PushTarget, text: &str) -> Result<()> {
        let recipient = target.recipient()?;
        self.bot
            .send_message(recipient, text)
            .await
            .with_context(|| format!("send to {target} failed"))?;
        Ok(())
    }
}

/// Prints instead of sending; used for dry runs.
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl MessageSink for StdoutSink {
    async fn send(&self, target: &PushTarget, text: &str) -> Result<()> {
        println!("----- {target}\n{text}\n");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub failed: usize,
}

pub struct Notifier {
    sink: Arc<dyn MessageSink>,
    targets: Vec<PushTarget>,
}

impl Notifier {
    /// Groups are tried before users.
    pub fn new(sink: Arc<dyn MessageSink>, groups: &[String], users: &[String]) -> Self {
        let targets = groups
            .iter()
            .map(|g| PushTarget::group(g.as_str()))
            .chain(users.iter().map(|u| PushTarget::user(u.as_str())))
            .collect();
        Self { sink, targets }
    }

    /// Send `text` to every target. A failed target does not stop the rest.
    pub async fn broadcast(&self, text: &str) -> Delivery {
        let mut delivery = Delivery::default();
        for target in &self.targets {
            match self.sink.send(target, text).await {
                Ok(()) => {
                    info!(%target, "notification sent");
                    delivery.sent += 1;
                }
                Err(err) => {
                    error!(?err, %target, "notification failed");
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }
}
