//! Snapchat 平台模块
//!
//! - [`batcher`] - Snapchat Marketing API 批处理器（组织带广告账户、批量统计、next_link 翻页）

pub mod batcher;

pub use self::batcher::SnapchatBatcher;

pub const API_VERSION: &str = "v1";

pub const BASE_URL: &str = "https://adsapi.snapchat.com";
