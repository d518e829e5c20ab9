//! Git push-notification bot: polls GitHub, GitLab and CNB for new commits
//! and releases and announces them to Telegram chats.

pub mod cache;
pub mod checker;
pub mod config;
pub mod expander;
pub mod handlers;
pub mod model;
pub mod notifier;
pub mod provider;
pub mod scheduler;
