//! LinkedIn 平台模块
//!
//! - [`batcher`] - LinkedIn Marketing API 批处理器（分析透视、线索表单、分页合并）
//! - [`publisher`] - LinkedIn 帖子发布器（图片 / 多图 / 分片视频）

pub mod batcher;
pub mod publisher;

pub use self::batcher::LinkedInBatcher;
pub use self::publisher::LinkedInPublisher;

use crate::http::ApiRequest;

/// Versioned REST API (`LinkedIn-Version` header)
pub const API_VERSION: &str = "202312";

pub const BASE_URL: &str = "https://api.linkedin.com/rest";

const RESTLI_PROTOCOL_VERSION: &str = "2.0.0";

/// Headers every versioned REST call needs
pub(crate) fn restli(request: ApiRequest, token: &str) -> ApiRequest {
    request
        .bearer(token)
        .header("LinkedIn-Version", API_VERSION)
        .header("X-Restli-Protocol-Version", RESTLI_PROTOCOL_VERSION)
}
