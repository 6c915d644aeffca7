//! Platforms module
//! 平台模块
//!
//! 每个广告 / 社交平台一个子模块，提供批处理器（读与批量写）和发布器（发帖）。
//!
//! # 模块结构
//!
//! - [`traits`] - `PlatformBatcher` / `PlatformPublisher` 接口
//! - [`common`] - 分组、结果补全、节流、轮询、错误翻译等共用工具
//! - [`factory`] - 批处理器注册表与发布器工厂
//! - [`meta`] - Facebook / Instagram
//! - [`google`] - Google Ads / Google Business Profile
//! - [`tiktok`] - TikTok Marketing / Content Posting
//! - [`linkedin`] - LinkedIn Marketing / Posts
//! - [`twitter`] - X (Twitter) Ads / API v2
//! - [`snapchat`] - Snapchat Marketing（仅批处理）

pub mod common;
pub mod factory;
pub mod google;
pub mod linkedin;
pub mod meta;
pub mod snapchat;
pub mod tiktok;
pub mod traits;
pub mod twitter;

pub use self::factory::{BatcherRegistry, PublishTarget, PublisherFactory};
pub use self::traits::{BatchContext, BatchStrategy, PlatformBatcher, PlatformPublisher};
