//! Google 平台模块
//!
//! - [`batcher`] - Google Ads 批处理器（searchStream 查询 + 批量 mutate）
//! - [`publisher`] - Google Business Profile 发布器（localPosts）

pub mod batcher;
pub mod publisher;

pub use self::batcher::GoogleBatcher;
pub use self::publisher::GoogleBusinessPublisher;

/// Google Ads API version
pub const ADS_API_VERSION: &str = "v15";

/// Google Ads base URL
pub const ADS_BASE_URL: &str = "https://googleads.googleapis.com";

/// Business Profile (My Business) API version
pub const BUSINESS_API_VERSION: &str = "v4";

/// Business Profile base URL
pub const BUSINESS_BASE_URL: &str = "https://mybusiness.googleapis.com";
