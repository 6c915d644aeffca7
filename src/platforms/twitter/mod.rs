//! Twitter (X) 平台模块
//!
//! - [`batcher`] - Twitter Ads API 批处理器（批量用户查询、实体统计、异步报表、游标翻页）
//! - [`publisher`] - 推文发布器（INIT / APPEND / FINALIZE 分片媒体上传）

pub mod batcher;
pub mod publisher;

pub use self::batcher::TwitterBatcher;
pub use self::publisher::TwitterPublisher;

/// Ads API version
pub const ADS_API_VERSION: &str = "12";

pub const ADS_BASE_URL: &str = "https://ads-api.twitter.com";

/// Public v2 API (users, tweets, media)
pub const API_BASE_URL: &str = "https://api.twitter.com/2";
