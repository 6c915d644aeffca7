//! TikTok 视频发布器
//!
//! 流程：
//! 1. 校验：必须包含视频
//! 2. video/init（FILE_UPLOAD），拿到 publish_id 和 upload_url
//! 3. 按 Content-Range 顺序 PUT 分片
//! 4. 轮询 status/fetch 直到 PUBLISH_COMPLETE

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use super::{content_envelope, CONTENT_BASE_URL};
use crate::core::{
    ErrorCategory, MediaAsset, PlatformConnection, PlatformError, PublishOptions, PublishResult,
};
use crate::http::{ApiRequest, HttpTransport};
use crate::media::MediaLibrary;
use crate::platforms::common::{
    finish_publish, not_connected_message, poll_until, ErrorTable, PollConfig, PollState,
};
use crate::platforms::traits::PlatformPublisher;

pub const REQUIRES_VIDEO: &str = "TikTok requires a video. Please add a video to your post.";
const NO_VIDEO_FOUND: &str = "TikTok requires a video. No video found in media attachments.";

/// Files below this size go up in a single chunk
const CHUNK_SIZE: usize = 10 * 1024 * 1024;
const MAX_VIDEO_BYTES: usize = 4 * 1024 * 1024 * 1024;
const TITLE_MAX_CHARS: usize = 2200;
const DEFAULT_PRIVACY: &str = "SELF_ONLY";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new("TikTok")
        .code("access_token_invalid", ErrorCategory::TokenExpired)
        .code("token_expired", ErrorCategory::TokenExpired)
        .code("scope_not_authorized", ErrorCategory::PermissionDenied)
        .code("unaudited_client_can_only_post_to_private_accounts", ErrorCategory::PermissionDenied)
        .code("privacy_level_option_mismatch", ErrorCategory::PermissionDenied)
        .code("rate_limit_exceeded", ErrorCategory::RateLimited)
        .code("spam_risk_too_many_posts", ErrorCategory::RateLimited)
        .code("file_format_check_failed", ErrorCategory::InvalidMedia)
        .code("duration_check_failed", ErrorCategory::InvalidMedia)
        .code("frame_rate_check_failed", ErrorCategory::InvalidMedia)
        .code("picture_size_check_failed", ErrorCategory::InvalidMedia)
        .code("video_pull_failed", ErrorCategory::InvalidMedia)
});

/// Chunk plan for FILE_UPLOAD: every chunk is `chunk_size` except the last,
/// which absorbs the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub video_size: usize,
    pub chunk_size: usize,
    pub total_chunk_count: usize,
}

impl ChunkPlan {
    pub fn for_size(video_size: usize) -> Self {
        if video_size < CHUNK_SIZE {
            return Self {
                video_size,
                chunk_size: video_size,
                total_chunk_count: 1,
            };
        }
        Self {
            video_size,
            chunk_size: CHUNK_SIZE,
            total_chunk_count: video_size / CHUNK_SIZE,
        }
    }

    /// Byte range (start, end exclusive) of chunk `index`
    pub fn range(&self, index: usize) -> (usize, usize) {
        let start = index * self.chunk_size;
        let end = if index + 1 == self.total_chunk_count {
            self.video_size
        } else {
            start + self.chunk_size
        };
        (start, end)
    }
}

pub struct TikTokPublisher {
    connection: Option<PlatformConnection>,
    transport: Arc<dyn HttpTransport>,
    media: MediaLibrary,
    poll: PollConfig,
}

impl TikTokPublisher {
    pub fn new(
        connection: Option<PlatformConnection>,
        transport: Arc<dyn HttpTransport>,
        media: MediaLibrary,
    ) -> Self {
        Self {
            connection,
            transport,
            media,
            poll: PollConfig::secs(5, 36),
        }
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn map_poll(mut self, f: impl FnOnce(PollConfig) -> PollConfig) -> Self {
        self.poll = f(self.poll);
        self
    }

    async fn init_upload(
        &self,
        token: &str,
        content: &str,
        plan: &ChunkPlan,
        options: &PublishOptions,
    ) -> Result<(String, String), PlatformError> {
        let title: String = options
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(content)
            .chars()
            .take(TITLE_MAX_CHARS)
            .collect();
        let body = json!({
            "post_info": {
                "title": title,
                "privacy_level": options.privacy_level.clone().unwrap_or_else(|| DEFAULT_PRIVACY.to_string()),
                "disable_comment": options.disable_comment,
                "disable_duet": options.disable_duet,
                "disable_stitch": options.disable_stitch,
            },
            "source_info": {
                "source": "FILE_UPLOAD",
                "video_size": plan.video_size,
                "chunk_size": plan.chunk_size,
                "total_chunk_count": plan.total_chunk_count,
            }
        });
        let request = ApiRequest::post(format!("{}/post/publish/video/init/", CONTENT_BASE_URL))
            .bearer(token)
            .header("Content-Type", "application/json; charset=UTF-8")
            .json(&body);
        let response = self.transport.send(request).await?;
        let data = content_envelope(&response)?;

        let publish_id = data.get("publish_id").and_then(Value::as_str);
        let upload_url = data.get("upload_url").and_then(Value::as_str);
        match (publish_id, upload_url) {
            (Some(p), Some(u)) => Ok((p.to_string(), u.to_string())),
            _ => Err(PlatformError::remote(
                "TikTok did not return an upload URL",
                response.status,
                None,
            )),
        }
    }

    async fn upload_chunks(
        &self,
        upload_url: &str,
        bytes: &[u8],
        mime: &str,
        plan: &ChunkPlan,
    ) -> Result<(), PlatformError> {
        for index in 0..plan.total_chunk_count {
            let (start, end) = plan.range(index);
            tracing::info!(
                "[Publish] TikTok chunk {}/{} bytes {}-{}",
                index + 1,
                plan.total_chunk_count,
                start,
                end - 1
            );
            let request = ApiRequest::put(upload_url)
                .header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", start, end - 1, plan.video_size),
                )
                .bytes(bytes[start..end].to_vec(), mime)
                .timeout(UPLOAD_TIMEOUT);
            let response = self.transport.send(request).await?;
            if !response.is_success() {
                return Err(PlatformError::remote(
                    format!("TikTok chunk {} upload failed", index + 1),
                    response.status,
                    None,
                ));
            }
        }
        Ok(())
    }

    async fn wait_for_publish(&self, token: &str, publish_id: &str) -> Result<String, PlatformError> {
        let url = format!("{}/post/publish/status/fetch/", CONTENT_BASE_URL);
        poll_until(&self.poll, "TikTok video", |_| {
            let request = ApiRequest::post(url.clone())
                .bearer(token)
                .json(&json!({ "publish_id": publish_id }));
            async move {
                let response = self.transport.send(request).await?;
                let data = content_envelope(&response)?;
                let status = data.get("status").and_then(Value::as_str).unwrap_or_default();
                Ok(match status {
                    "PUBLISH_COMPLETE" => {
                        let post_id = data
                            .get("publicaly_available_post_id")
                            .and_then(Value::as_array)
                            .and_then(|ids| ids.first())
                            .and_then(|id| match id {
                                Value::String(s) => Some(s.clone()),
                                Value::Number(n) => Some(n.to_string()),
                                _ => None,
                            })
                            .unwrap_or_else(|| publish_id.to_string());
                        PollState::Ready(post_id)
                    }
                    // 草稿投递到用户收件箱，由用户在 App 内完成发布
                    "SEND_TO_USER_INBOX" => PollState::Ready(publish_id.to_string()),
                    "FAILED" => PollState::Failed(
                        data.get("fail_reason")
                            .and_then(Value::as_str)
                            .unwrap_or("TikTok rejected the video")
                            .to_string(),
                    ),
                    _ => PollState::Pending,
                })
            }
        })
        .await
    }

    async fn run(
        &self,
        connection: &PlatformConnection,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> Result<(String, Option<String>), PlatformError> {
        let video = media
            .iter()
            .find(|m| m.is_video())
            .ok_or_else(|| PlatformError::Validation(NO_VIDEO_FOUND.to_string()))?;
        let token = connection.token().unwrap_or_default();

        tracing::info!("[Publish] ====== TikTok 步骤1: 读取视频 ======");
        let file = self.media.load(video).await?;
        if file.is_empty() {
            return Err(PlatformError::Validation("TikTok video file is empty".to_string()));
        }
        if file.len() > MAX_VIDEO_BYTES {
            return Err(PlatformError::Validation(
                "TikTok videos must be smaller than 4 GB".to_string(),
            ));
        }
        let plan = ChunkPlan::for_size(file.len());

        tracing::info!("[Publish] ====== TikTok 步骤2: 初始化上传 ======");
        let (publish_id, upload_url) = self.init_upload(token, content, &plan, options).await?;

        tracing::info!("[Publish] ====== TikTok 步骤3: 上传分片 ======");
        self.upload_chunks(&upload_url, &file.bytes, &file.mime, &plan)
            .await?;

        tracing::info!("[Publish] ====== TikTok 步骤4: 等待发布完成 ======");
        let post_id = self.wait_for_publish(token, &publish_id).await?;

        let permalink = connection
            .credential("username")
            .map(|user| format!("https://www.tiktok.com/@{}/video/{}", user, post_id))
            .filter(|_| post_id != publish_id);
        Ok((post_id, permalink))
    }
}

#[async_trait::async_trait]
impl PlatformPublisher for TikTokPublisher {
    fn platform_name(&self) -> &'static str {
        "tiktok"
    }

    async fn publish(
        &self,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> PublishResult {
        if media.is_empty() {
            return PublishResult::failed(REQUIRES_VIDEO);
        }
        let Some(connection) = self.connection.as_ref().filter(|c| c.is_usable()) else {
            return PublishResult::failed(not_connected_message("TikTok"));
        };
        finish_publish(
            &ERROR_TABLE,
            self.run(connection, content, media, options).await,
        )
    }
}
