//! TikTok 平台模块
//!
//! - [`batcher`] - TikTok Marketing API 批处理器（批量广告主信息、批量转化事件、分页合并）
//! - [`publisher`] - TikTok Content Posting API 视频发布器（FILE_UPLOAD 分片上传）

pub mod batcher;
pub mod publisher;

pub use self::batcher::TikTokBatcher;
pub use self::publisher::TikTokPublisher;

use serde_json::Value;

use crate::core::PlatformError;
use crate::http::ApiResponse;
use crate::platforms::common::json_or_error;

/// Marketing API version
pub const ADS_API_VERSION: &str = "v1.3";

/// Marketing API base URL
pub const ADS_BASE_URL: &str = "https://business-api.tiktok.com/open_api";

/// Content Posting API base URL
pub const CONTENT_BASE_URL: &str = "https://open.tiktokapis.com/v2";

/// Marketing API envelope: `{code, message, data}`; a non-zero code is an error
/// even on HTTP 200.
pub(crate) fn ads_envelope(response: &ApiResponse) -> Result<Value, PlatformError> {
    let body = json_or_error(response, "TikTok")?;
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code != 0 {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("TikTok API error")
            .to_string();
        return Err(PlatformError::remote(
            message,
            response.status,
            Some(code.to_string()),
        ));
    }
    Ok(body.get("data").cloned().unwrap_or(Value::Null))
}

/// Content Posting API envelope: `{data, error: {code, message}}`; code "ok" is success
pub(crate) fn content_envelope(response: &ApiResponse) -> Result<Value, PlatformError> {
    let body = if response.is_success() {
        json_or_error(response, "TikTok")?
    } else {
        response.json()
    };
    let error_code = body
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("ok");
    if response.is_success() && error_code == "ok" {
        return Ok(body.get("data").cloned().unwrap_or(Value::Null));
    }
    let message = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("TikTok API error (HTTP {})", response.status));
    Err(PlatformError::remote(
        message,
        response.status,
        Some(error_code.to_string()),
    ))
}
