//! Twitter (X) 推文发布器
//!
//! 媒体走分片上传：INIT -> APPEND（按段）-> FINALIZE -> 必要时 STATUS 轮询，
//! 然后 POST /2/tweets 引用 media_ids。

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use super::API_BASE_URL;
use crate::core::{
    ErrorCategory, MediaAsset, PlatformConnection, PlatformError, PublishOptions, PublishResult,
};
use crate::http::{ApiRequest, FormPart, HttpTransport};
use crate::media::{MediaBytes, MediaLibrary};
use crate::platforms::common::{
    finish_publish, json_or_error, not_connected_message, poll_until, ErrorTable, PollConfig,
    PollState,
};
use crate::platforms::traits::PlatformPublisher;

const TWEET_MAX_CHARS: usize = 280;
const MAX_IMAGES: usize = 4;
const SEGMENT_SIZE: usize = 4 * 1024 * 1024;
const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
const MAX_VIDEO_BYTES: usize = 512 * 1024 * 1024;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new("Twitter")
        .code("89", ErrorCategory::TokenExpired)
        .code("32", ErrorCategory::TokenExpired)
        .code("64", ErrorCategory::PermissionDenied)
        .code("326", ErrorCategory::PermissionDenied)
        .code("88", ErrorCategory::RateLimited)
        .code("185", ErrorCategory::RateLimited)
        .code("324", ErrorCategory::InvalidMedia)
        .code("325", ErrorCategory::InvalidMedia)
        .fragment("invalid or expired token", ErrorCategory::TokenExpired)
        .fragment("unsupported authentication", ErrorCategory::TokenExpired)
        .fragment("too many requests", ErrorCategory::RateLimited)
        .fragment("invalid media", ErrorCategory::InvalidMedia)
});

fn media_category(file: &MediaBytes, is_video: bool) -> &'static str {
    if is_video {
        "tweet_video"
    } else if file.mime == "image/gif" {
        "tweet_gif"
    } else {
        "tweet_image"
    }
}

pub struct TwitterPublisher {
    connection: Option<PlatformConnection>,
    transport: Arc<dyn HttpTransport>,
    media: MediaLibrary,
    poll: PollConfig,
}

impl TwitterPublisher {
    pub fn new(
        connection: Option<PlatformConnection>,
        transport: Arc<dyn HttpTransport>,
        media: MediaLibrary,
    ) -> Self {
        Self {
            connection,
            transport,
            media,
            poll: PollConfig::secs(5, 24),
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

    fn validate(content: &str, media: &[MediaAsset]) -> Result<(), PlatformError> {
        let length = content.chars().count();
        if length > TWEET_MAX_CHARS {
            return Err(PlatformError::Validation(format!(
                "Tweet is {} characters; the limit is {}",
                length, TWEET_MAX_CHARS
            )));
        }
        if content.trim().is_empty() && media.is_empty() {
            return Err(PlatformError::Validation(
                "Tweets need text or media".to_string(),
            ));
        }
        let videos = media.iter().filter(|m| m.is_video()).count();
        if videos > 0 && media.len() > 1 {
            return Err(PlatformError::Validation(
                "Twitter supports either one video or up to 4 images per tweet".to_string(),
            ));
        }
        if media.len() > MAX_IMAGES {
            return Err(PlatformError::Validation(format!(
                "Twitter supports at most {} images per tweet",
                MAX_IMAGES
            )));
        }
        Ok(())
    }

    fn upload_url() -> String {
        format!("{}/media/upload", API_BASE_URL)
    }

    fn media_id(data: &Value) -> Option<String> {
        let data = data.get("data").unwrap_or(data);
        data.get("id")
            .or_else(|| data.get("media_id_string"))
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    fn processing_info(data: &Value) -> Option<Value> {
        data.get("data")
            .unwrap_or(data)
            .get("processing_info")
            .cloned()
    }

    async fn upload(
        &self,
        token: &str,
        asset: &MediaAsset,
    ) -> Result<String, PlatformError> {
        let file = self.media.load(asset).await?;
        let limit = if asset.is_video() { MAX_VIDEO_BYTES } else { MAX_IMAGE_BYTES };
        if file.is_empty() || file.len() > limit {
            return Err(PlatformError::Validation(format!(
                "{} is {} bytes; Twitter accepts up to {} bytes for this media type",
                file.file_name,
                file.len(),
                limit
            )));
        }

        // INIT
        let init = ApiRequest::post(Self::upload_url()).bearer(token).form(vec![
            ("command".into(), "INIT".into()),
            ("total_bytes".into(), file.len().to_string()),
            ("media_type".into(), file.mime.clone()),
            (
                "media_category".into(),
                media_category(&file, asset.is_video()).into(),
            ),
        ]);
        let response = self.transport.send(init).await?;
        let data = json_or_error(&response, "Twitter")?;
        let media_id = Self::media_id(&data).ok_or_else(|| {
            PlatformError::remote("Twitter did not return a media id", response.status, None)
        })?;

        // APPEND
        let segments: Vec<&[u8]> = file.bytes.chunks(SEGMENT_SIZE).collect();
        for (index, segment) in segments.iter().enumerate() {
            tracing::info!(
                "[Publish] Twitter media {} segment {}/{}",
                media_id,
                index + 1,
                segments.len()
            );
            let append = ApiRequest::post(Self::upload_url())
                .bearer(token)
                .multipart(vec![
                    ("command".into(), FormPart::Text("APPEND".into())),
                    ("media_id".into(), FormPart::Text(media_id.clone())),
                    ("segment_index".into(), FormPart::Text(index.to_string())),
                    (
                        "media".into(),
                        FormPart::File {
                            bytes: segment.to_vec(),
                            file_name: file.file_name.clone(),
                            mime: file.mime.clone(),
                        },
                    ),
                ])
                .timeout(UPLOAD_TIMEOUT);
            let response = self.transport.send(append).await?;
            json_or_error(&response, "Twitter")?;
        }

        // FINALIZE
        let finalize = ApiRequest::post(Self::upload_url()).bearer(token).form(vec![
            ("command".into(), "FINALIZE".into()),
            ("media_id".into(), media_id.clone()),
        ]);
        let response = self.transport.send(finalize).await?;
        let data = json_or_error(&response, "Twitter")?;

        if let Some(info) = Self::processing_info(&data) {
            match info.get("state").and_then(Value::as_str) {
                Some("succeeded") | None => {}
                Some("failed") => {
                    return Err(PlatformError::ProcessingFailed(Self::failure_reason(&info)));
                }
                Some(_) => self.wait_for_processing(token, &media_id).await?,
            }
        }
        Ok(media_id)
    }

    fn failure_reason(info: &Value) -> String {
        info.get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("Twitter could not process the media")
            .to_string()
    }

    async fn wait_for_processing(&self, token: &str, media_id: &str) -> Result<(), PlatformError> {
        poll_until(&self.poll, "Twitter media", |_| {
            let request = ApiRequest::get(Self::upload_url())
                .bearer(token)
                .query("command", "STATUS")
                .query("media_id", media_id);
            async move {
                let response = self.transport.send(request).await?;
                let data = json_or_error(&response, "Twitter")?;
                let info = Self::processing_info(&data).unwrap_or(Value::Null);
                Ok(match info.get("state").and_then(Value::as_str) {
                    Some("succeeded") | None => PollState::Ready(()),
                    Some("failed") => PollState::Failed(Self::failure_reason(&info)),
                    Some(_) => PollState::Pending,
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
    ) -> Result<(String, Option<String>), PlatformError> {
        Self::validate(content, media)?;
        let token = connection.token().unwrap_or_default();

        let mut media_ids = Vec::with_capacity(media.len());
        if !media.is_empty() {
            tracing::info!("[Publish] ====== Twitter 步骤1: 上传 {} 个媒体 ======", media.len());
        }
        for asset in media {
            media_ids.push(self.upload(token, asset).await?);
        }

        tracing::info!("[Publish] ====== Twitter 步骤2: 发布推文 ======");
        let mut body = json!({ "text": content });
        if !media_ids.is_empty() {
            body["media"] = json!({ "media_ids": media_ids });
        }
        let request = ApiRequest::post(format!("{}/tweets", API_BASE_URL))
            .bearer(token)
            .json(&body);
        let response = self.transport.send(request).await?;
        let data = json_or_error(&response, "Twitter")?;

        let tweet_id = data
            .get("data")
            .and_then(|d| d.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let permalink = (!tweet_id.is_empty()).then(|| match connection.credential("username") {
            Some(user) => format!("https://x.com/{}/status/{}", user, tweet_id),
            None => format!("https://x.com/i/web/status/{}", tweet_id),
        });
        Ok((tweet_id, permalink))
    }
}

#[async_trait::async_trait]
impl PlatformPublisher for TwitterPublisher {
    fn platform_name(&self) -> &'static str {
        "twitter"
    }

    async fn publish(
        &self,
        content: &str,
        media: &[MediaAsset],
        _options: &PublishOptions,
    ) -> PublishResult {
        let Some(connection) = self.connection.as_ref().filter(|c| c.is_usable()) else {
            return PublishResult::failed(not_connected_message("Twitter"));
        };
        finish_publish(&ERROR_TABLE, self.run(connection, content, media).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectionStatus, MediaKind, PlatformType};
    use crate::http::{ApiResponse, Method, ScriptedTransport};
    use serde_json::Map;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn connection() -> PlatformConnection {
        let mut credentials = Map::new();
        credentials.insert("username".into(), json!("acme"));
        PlatformConnection {
            id: "tw".into(),
            org_id: "org".into(),
            platform: PlatformType::Twitter,
            access_token: Some("tok".into()),
            account_id: None,
            credentials,
            status: ConnectionStatus::Active,
        }
    }

    fn publisher(root: &Path, transport: Arc<ScriptedTransport>) -> TwitterPublisher {
        let media = MediaLibrary::new(root.to_path_buf(), None, transport.clone());
        TwitterPublisher::new(Some(connection()), transport, media)
            .with_poll(PollConfig::new(Duration::ZERO, 3))
    }

    fn tweet_created() -> ApiResponse {
        ApiResponse::json_body(201, &json!({"data": {"id": "1790000000000000000", "text": "hi"}}))
    }

    #[tokio::test]
    async fn test_text_only_tweet() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(|req| {
            assert!(req.url.ends_with("/2/tweets"));
            assert!(req.json_body().unwrap().get("media").is_none());
            Ok(tweet_created())
        }));
        let result = publisher(dir.path(), transport.clone())
            .publish("hi", &[], &PublishOptions::default())
            .await;
        assert!(result.success);
        assert_eq!(
            result.permalink.as_deref(),
            Some("https://x.com/acme/status/1790000000000000000")
        );
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_video_upload_polls_status_before_tweet() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v.mp4"), vec![0u8; 100]).unwrap();
        let status_calls = Arc::new(AtomicU32::new(0));
        let counter = status_calls.clone();
        let transport = Arc::new(ScriptedTransport::new(move |req| {
            if req.url.ends_with("/2/tweets") {
                assert_eq!(req.json_body().unwrap()["media"]["media_ids"], json!(["m1"]));
                return Ok(tweet_created());
            }
            if req.method == Method::Get {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let state = if n == 0 { "in_progress" } else { "succeeded" };
                return Ok(ApiResponse::json_body(
                    200,
                    &json!({"data": {"id": "m1", "processing_info": {"state": state}}}),
                ));
            }
            match req.form_value("command") {
                Some("INIT") => {
                    assert_eq!(req.form_value("media_category"), Some("tweet_video"));
                    Ok(ApiResponse::json_body(202, &json!({"data": {"id": "m1"}})))
                }
                Some("APPEND") => Ok(ApiResponse::new(204, Vec::new())),
                Some("FINALIZE") => Ok(ApiResponse::json_body(
                    200,
                    &json!({"data": {"id": "m1", "processing_info": {"state": "pending", "check_after_secs": 1}}}),
                )),
                other => panic!("unexpected command {:?}", other),
            }
        }));

        let result = publisher(dir.path(), transport.clone())
            .publish(
                "launch",
                &[MediaAsset::stored(MediaKind::Video, "v.mp4")],
                &PublishOptions::default(),
            )
            .await;

        assert!(result.success, "{:?}", result.message);
        assert_eq!(status_calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.call_count(), 6);
    }

    #[tokio::test]
    async fn test_limits_checked_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::unreachable());
        let publisher = publisher(dir.path(), transport.clone());

        let long = "x".repeat(TWEET_MAX_CHARS + 1);
        let result = publisher.publish(&long, &[], &PublishOptions::default()).await;
        assert!(result.message.unwrap().contains("280"));

        let images: Vec<MediaAsset> = (0..5)
            .map(|i| MediaAsset::image_url(format!("https://a.test/{}.jpg", i)))
            .collect();
        let result = publisher.publish("x", &images, &PublishOptions::default()).await;
        assert!(!result.success);

        let mixed = [
            MediaAsset::image_url("https://a.test/1.jpg"),
            MediaAsset::video_url("https://a.test/1.mp4"),
        ];
        let result = publisher.publish("x", &mixed, &PublishOptions::default()).await;
        assert!(!result.success);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_tweet_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(ApiResponse::json_body(
                403,
                &json!({"detail": "You are not allowed to create a Tweet with duplicate content.", "status": 403}),
            ))
        }));
        let result = publisher(dir.path(), transport)
            .publish("again", &[], &PublishOptions::default())
            .await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("permission"));
    }
}
