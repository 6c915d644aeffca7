//! LinkedIn 帖子发布器
//!
//! 图片：images?action=initializeUpload -> PUT 上传 -> 得到 image URN
//! 视频：videos?action=initializeUpload -> 按服务端给出的字节区间逐段 PUT（收集 ETag）
//!       -> finalizeUpload -> 轮询状态直到 AVAILABLE
//! 最后 POST /rest/posts，帖子 id 取自 x-restli-id 响应头。

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use super::{restli, BASE_URL};
use crate::core::{
    ErrorCategory, MediaAsset, PlatformConnection, PlatformError, PublishOptions, PublishResult,
};
use crate::http::{ApiRequest, HttpTransport};
use crate::media::{MediaBytes, MediaLibrary};
use crate::platforms::common::{
    finish_publish, json_or_error, not_connected_message, poll_until, remote_error, ErrorTable,
    PollConfig, PollState,
};
use crate::platforms::traits::PlatformPublisher;

const COMMENTARY_MAX_CHARS: usize = 3000;
const MAX_IMAGES: usize = 20;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new("LinkedIn")
        .code("65600", ErrorCategory::TokenExpired)
        .code("65601", ErrorCategory::TokenExpired)
        .code("65602", ErrorCategory::TokenExpired)
        .code("100", ErrorCategory::PermissionDenied)
        .code("429", ErrorCategory::RateLimited)
        .fragment("expired access token", ErrorCategory::TokenExpired)
        .fragment("invalid access token", ErrorCategory::TokenExpired)
        .fragment("not enough permissions", ErrorCategory::PermissionDenied)
        .fragment("throttle", ErrorCategory::RateLimited)
        .fragment("media asset", ErrorCategory::InvalidMedia)
});

/// Uploaded media ready to be referenced by a post
#[derive(Debug, Clone, PartialEq)]
enum PostMedia {
    None,
    Images(Vec<(String, Option<String>)>),
    Video(String),
}

pub struct LinkedInPublisher {
    connection: Option<PlatformConnection>,
    transport: Arc<dyn HttpTransport>,
    media: MediaLibrary,
    poll: PollConfig,
}

impl LinkedInPublisher {
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

    /// Organization pages post as the organization, everything else as the member
    fn author_urn(
        connection: &PlatformConnection,
        options: &PublishOptions,
    ) -> Result<String, PlatformError> {
        if let Some(org) = options
            .organization_id
            .clone()
            .or_else(|| connection.credential("organization_id"))
        {
            if org.starts_with("urn:li:") {
                return Ok(org);
            }
            return Ok(format!("urn:li:organization:{}", org));
        }
        let member = connection
            .credential("member_id")
            .or_else(|| connection.credential("person_id"))
            .or_else(|| connection.account())
            .ok_or_else(|| {
                PlatformError::Configuration(
                    "No LinkedIn profile or organization selected. Please reconnect your LinkedIn account."
                        .to_string(),
                )
            })?;
        if member.starts_with("urn:li:") {
            return Ok(member);
        }
        Ok(format!("urn:li:person:{}", member))
    }

    fn validate(content: &str, media: &[MediaAsset]) -> Result<(), PlatformError> {
        let length = content.chars().count();
        if length > COMMENTARY_MAX_CHARS {
            return Err(PlatformError::Validation(format!(
                "LinkedIn post text is {} characters; the limit is {}",
                length, COMMENTARY_MAX_CHARS
            )));
        }
        let videos = media.iter().filter(|m| m.is_video()).count();
        if videos > 1 || (videos == 1 && media.len() > 1) {
            return Err(PlatformError::Validation(
                "LinkedIn posts support one video, or images only".to_string(),
            ));
        }
        if media.len() > MAX_IMAGES {
            return Err(PlatformError::Validation(format!(
                "LinkedIn posts support at most {} images",
                MAX_IMAGES
            )));
        }
        if content.trim().is_empty() && media.is_empty() {
            return Err(PlatformError::Validation(
                "LinkedIn posts need text or media".to_string(),
            ));
        }
        Ok(())
    }

    fn rest(&self, request: ApiRequest, token: &str) -> ApiRequest {
        restli(request, token)
    }

    async fn upload_image(
        &self,
        token: &str,
        owner: &str,
        asset: &MediaAsset,
    ) -> Result<String, PlatformError> {
        let file = self.media.load(asset).await?;
        let init = self.rest(
            ApiRequest::post(format!("{}/images", BASE_URL))
                .query("action", "initializeUpload")
                .json(&json!({ "initializeUploadRequest": { "owner": owner } })),
            token,
        );
        let response = self.transport.send(init).await?;
        let data = json_or_error(&response, "LinkedIn")?;
        let value = data.get("value").cloned().unwrap_or(Value::Null);
        let (upload_url, image) = match (
            value.get("uploadUrl").and_then(Value::as_str),
            value.get("image").and_then(Value::as_str),
        ) {
            (Some(url), Some(image)) => (url.to_string(), image.to_string()),
            _ => {
                return Err(PlatformError::remote(
                    "LinkedIn did not return an image upload URL",
                    response.status,
                    None,
                ))
            }
        };

        let upload = ApiRequest::put(upload_url)
            .bearer(token)
            .bytes(file.bytes, file.mime)
            .timeout(UPLOAD_TIMEOUT);
        let response = self.transport.send(upload).await?;
        if !response.is_success() {
            return Err(remote_error(&response, "LinkedIn"));
        }
        tracing::info!("[Publish] LinkedIn image uploaded: {}", image);
        Ok(image)
    }

    async fn upload_video(
        &self,
        token: &str,
        owner: &str,
        file: &MediaBytes,
    ) -> Result<String, PlatformError> {
        let init = self.rest(
            ApiRequest::post(format!("{}/videos", BASE_URL))
                .query("action", "initializeUpload")
                .json(&json!({
                    "initializeUploadRequest": {
                        "owner": owner,
                        "fileSizeBytes": file.len(),
                        "uploadCaptions": false,
                        "uploadThumbnail": false,
                    }
                })),
            token,
        );
        let response = self.transport.send(init).await?;
        let data = json_or_error(&response, "LinkedIn")?;
        let value = data.get("value").cloned().unwrap_or(Value::Null);
        let video = value
            .get("video")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PlatformError::remote(
                    "LinkedIn did not return a video URN",
                    response.status,
                    None,
                )
            })?
            .to_string();
        let upload_token = value
            .get("uploadToken")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let instructions = value
            .get("uploadInstructions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if instructions.is_empty() {
            return Err(PlatformError::remote(
                "LinkedIn did not return upload instructions",
                response.status,
                None,
            ));
        }

        // 按服务端给出的区间顺序上传，ETag 顺序即 part 顺序
        let mut etags = Vec::with_capacity(instructions.len());
        for (index, instruction) in instructions.iter().enumerate() {
            let url = instruction
                .get("uploadUrl")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let first = instruction.get("firstByte").and_then(Value::as_u64).unwrap_or(0) as usize;
            let last = instruction
                .get("lastByte")
                .and_then(Value::as_u64)
                .map(|b| b as usize)
                .unwrap_or(file.len().saturating_sub(1));
            if url.is_empty() || first > last || last >= file.len() {
                return Err(PlatformError::Validation(format!(
                    "LinkedIn upload instruction {} does not fit the video ({} bytes)",
                    index + 1,
                    file.len()
                )));
            }

            tracing::info!(
                "[Publish] LinkedIn video part {}/{} bytes {}-{}",
                index + 1,
                instructions.len(),
                first,
                last
            );
            let request = ApiRequest::put(url)
                .bearer(token)
                .bytes(file.bytes[first..=last].to_vec(), "application/octet-stream")
                .timeout(UPLOAD_TIMEOUT);
            let response = self.transport.send(request).await?;
            if !response.is_success() {
                return Err(remote_error(&response, "LinkedIn"));
            }
            let etag = response.header("etag").ok_or_else(|| {
                PlatformError::remote(
                    format!("LinkedIn returned no ETag for video part {}", index + 1),
                    response.status,
                    None,
                )
            })?;
            etags.push(etag.to_string());
        }

        let finalize = self.rest(
            ApiRequest::post(format!("{}/videos", BASE_URL))
                .query("action", "finalizeUpload")
                .json(&json!({
                    "finalizeUploadRequest": {
                        "video": video,
                        "uploadToken": upload_token,
                        "uploadedPartIds": etags,
                    }
                })),
            token,
        );
        let response = self.transport.send(finalize).await?;
        json_or_error(&response, "LinkedIn")?;

        self.wait_for_video(token, &video).await?;
        Ok(video)
    }

    async fn wait_for_video(&self, token: &str, video: &str) -> Result<(), PlatformError> {
        let url = format!("{}/videos/{}", BASE_URL, urlencoding::encode(video));
        poll_until(&self.poll, "LinkedIn video", |_| {
            let request = self.rest(ApiRequest::get(url.clone()), token);
            async move {
                let response = self.transport.send(request).await?;
                let data = json_or_error(&response, "LinkedIn")?;
                Ok(match data.get("status").and_then(Value::as_str) {
                    Some("AVAILABLE") => PollState::Ready(()),
                    Some("PROCESSING_FAILED") => PollState::Failed(
                        data.get("processingFailureReason")
                            .and_then(Value::as_str)
                            .unwrap_or("LinkedIn could not process the video")
                            .to_string(),
                    ),
                    _ => PollState::Pending,
                })
            }
        })
        .await
    }

    async fn upload_media(
        &self,
        token: &str,
        owner: &str,
        media: &[MediaAsset],
    ) -> Result<PostMedia, PlatformError> {
        if let Some(video) = media.iter().find(|m| m.is_video()) {
            tracing::info!("[Publish] ====== LinkedIn 步骤1: 上传视频 ======");
            let file = self.media.load(video).await?;
            if file.is_empty() {
                return Err(PlatformError::Validation(
                    "LinkedIn video file is empty".to_string(),
                ));
            }
            return Ok(PostMedia::Video(self.upload_video(token, owner, &file).await?));
        }
        if media.is_empty() {
            return Ok(PostMedia::None);
        }

        tracing::info!("[Publish] ====== LinkedIn 步骤1: 上传 {} 张图片 ======", media.len());
        let mut images = Vec::with_capacity(media.len());
        for asset in media {
            let urn = self.upload_image(token, owner, asset).await?;
            images.push((urn, asset.alt_text.clone()));
        }
        Ok(PostMedia::Images(images))
    }

    fn post_body(
        author: &str,
        content: &str,
        media: &PostMedia,
        options: &PublishOptions,
    ) -> Value {
        let mut body = json!({
            "author": author,
            "commentary": content,
            "visibility": "PUBLIC",
            "distribution": {
                "feedDistribution": "MAIN_FEED",
                "targetEntities": [],
                "thirdPartyDistributionChannels": [],
            },
            "lifecycleState": "PUBLISHED",
            "isReshareDisabledByAuthor": false,
        });

        let image_entry = |(id, alt): &(String, Option<String>)| {
            let mut entry = json!({ "id": id });
            if let Some(alt) = alt {
                entry["altText"] = json!(alt);
            }
            entry
        };

        match media {
            PostMedia::Video(urn) => {
                body["content"] = json!({
                    "media": {
                        "id": urn,
                        "title": options.title.clone().unwrap_or_default(),
                    }
                });
            }
            PostMedia::Images(images) if images.len() == 1 => {
                body["content"] = json!({ "media": image_entry(&images[0]) });
            }
            PostMedia::Images(images) => {
                let entries: Vec<Value> = images.iter().map(image_entry).collect();
                body["content"] = json!({ "multiImage": { "images": entries } });
            }
            PostMedia::None => {
                if let Some(link) = &options.link {
                    let mut article = json!({ "source": link });
                    if let Some(title) = &options.title {
                        article["title"] = json!(title);
                    }
                    body["content"] = json!({ "article": article });
                }
            }
        }
        body
    }

    async fn run(
        &self,
        connection: &PlatformConnection,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> Result<(String, Option<String>), PlatformError> {
        Self::validate(content, media)?;
        let author = Self::author_urn(connection, options)?;
        let token = connection.token().unwrap_or_default();

        let post_media = self.upload_media(token, &author, media).await?;

        tracing::info!("[Publish] ====== LinkedIn 步骤2: 创建帖子 ======");
        let body = Self::post_body(&author, content, &post_media, options);
        let request = self.rest(ApiRequest::post(format!("{}/posts", BASE_URL)).json(&body), token);
        let response = self.transport.send(request).await?;
        let data = json_or_error(&response, "LinkedIn")?;

        let post_id = response
            .header("x-restli-id")
            .map(str::to_string)
            .or_else(|| data.get("id").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        let permalink = (!post_id.is_empty())
            .then(|| format!("https://www.linkedin.com/feed/update/{}", post_id));
        Ok((post_id, permalink))
    }
}

#[async_trait::async_trait]
impl PlatformPublisher for LinkedInPublisher {
    fn platform_name(&self) -> &'static str {
        "linkedin"
    }

    async fn publish(
        &self,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> PublishResult {
        let Some(connection) = self.connection.as_ref().filter(|c| c.is_usable()) else {
            return PublishResult::failed(not_connected_message("LinkedIn"));
        };
        finish_publish(
            &ERROR_TABLE,
            self.run(connection, content, media, options).await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectionStatus, MediaKind, PlatformType};
    use crate::http::{ApiResponse, Method, ScriptedTransport};
    use serde_json::Map;
    use std::path::Path;

    fn connection() -> PlatformConnection {
        let mut credentials = Map::new();
        credentials.insert("organization_id".into(), json!(2414183));
        PlatformConnection {
            id: "li".into(),
            org_id: "org".into(),
            platform: PlatformType::LinkedIn,
            access_token: Some("tok".into()),
            account_id: None,
            credentials,
            status: ConnectionStatus::Active,
        }
    }

    fn publisher(root: &Path, transport: Arc<ScriptedTransport>) -> LinkedInPublisher {
        let media = MediaLibrary::new(root.to_path_buf(), None, transport.clone());
        LinkedInPublisher::new(Some(connection()), transport, media)
            .with_poll(PollConfig::new(Duration::ZERO, 3))
    }

    #[tokio::test]
    async fn test_single_image_post() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"png-bytes").unwrap();
        let transport = Arc::new(ScriptedTransport::new(|req| {
            if req.url.ends_with("/rest/images") {
                assert_eq!(
                    req.json_body().unwrap()["initializeUploadRequest"]["owner"],
                    "urn:li:organization:2414183"
                );
                return Ok(ApiResponse::json_body(
                    200,
                    &json!({"value": {"uploadUrl": "https://upload.test/img", "image": "urn:li:image:C1"}}),
                ));
            }
            if req.method == Method::Put {
                return Ok(ApiResponse::new(201, Vec::new()));
            }
            let body = req.json_body().unwrap();
            assert_eq!(body["content"]["media"]["id"], "urn:li:image:C1");
            assert_eq!(body["content"]["media"]["altText"], "logo");
            Ok(ApiResponse::new(201, Vec::new()).with_header("x-restli-id", "urn:li:share:99"))
        }));

        let result = publisher(dir.path(), transport.clone())
            .publish(
                "Hello LinkedIn",
                &[MediaAsset::stored(MediaKind::Image, "a.png").with_alt_text("logo")],
                &PublishOptions::default(),
            )
            .await;

        assert!(result.success, "{:?}", result.message);
        assert_eq!(result.post_id.as_deref(), Some("urn:li:share:99"));
        assert_eq!(
            result.permalink.as_deref(),
            Some("https://www.linkedin.com/feed/update/urn:li:share:99")
        );
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_video_parts_follow_instructions_and_etags_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v.mp4"), vec![3u8; 10]).unwrap();
        let transport = Arc::new(ScriptedTransport::new(|req| {
            match (req.method, req.query_value("action")) {
                (Method::Post, Some("initializeUpload")) => Ok(ApiResponse::json_body(
                    200,
                    &json!({"value": {
                        "video": "urn:li:video:V1",
                        "uploadToken": "ut",
                        "uploadInstructions": [
                            {"uploadUrl": "https://upload.test/p1", "firstByte": 0, "lastByte": 5},
                            {"uploadUrl": "https://upload.test/p2", "firstByte": 6, "lastByte": 9}
                        ]
                    }}),
                )),
                (Method::Put, _) => {
                    let etag = if req.url.ends_with("p1") { "e-1" } else { "e-2" };
                    Ok(ApiResponse::new(200, Vec::new()).with_header("ETag", etag))
                }
                (Method::Post, Some("finalizeUpload")) => {
                    let body = req.json_body().unwrap();
                    assert_eq!(
                        body["finalizeUploadRequest"]["uploadedPartIds"],
                        json!(["e-1", "e-2"])
                    );
                    Ok(ApiResponse::new(200, Vec::new()))
                }
                (Method::Get, _) => Ok(ApiResponse::json_body(200, &json!({"status": "AVAILABLE"}))),
                _ => Ok(ApiResponse::new(201, Vec::new())
                    .with_header("x-restli-id", "urn:li:share:7")),
            }
        }));

        let result = publisher(dir.path(), transport.clone())
            .publish(
                "Watch",
                &[MediaAsset::stored(MediaKind::Video, "v.mp4")],
                &PublishOptions::default(),
            )
            .await;

        assert!(result.success, "{:?}", result.message);
        let puts: Vec<usize> = transport
            .requests()
            .iter()
            .filter(|r| r.method == Method::Put)
            .map(|r| match &r.body {
                crate::http::RequestBody::Bytes { data, .. } => data.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(puts, vec![6, 4]);
        let post = transport.calls_to("/rest/posts");
        assert_eq!(post[0].json_body().unwrap()["content"]["media"]["id"], "urn:li:video:V1");
    }

    #[tokio::test]
    async fn test_video_processing_failure_skips_post() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v.mp4"), vec![3u8; 4]).unwrap();
        let transport = Arc::new(ScriptedTransport::new(|req| {
            match (req.method, req.query_value("action")) {
                (Method::Post, Some("initializeUpload")) => Ok(ApiResponse::json_body(
                    200,
                    &json!({"value": {
                        "video": "urn:li:video:V2",
                        "uploadInstructions": [{"uploadUrl": "https://upload.test/p", "firstByte": 0, "lastByte": 3}]
                    }}),
                )),
                (Method::Put, _) => Ok(ApiResponse::new(200, Vec::new()).with_header("etag", "x")),
                (Method::Get, _) => Ok(ApiResponse::json_body(
                    200,
                    &json!({"status": "PROCESSING_FAILED", "processingFailureReason": "Unsupported codec"}),
                )),
                _ => Ok(ApiResponse::new(200, Vec::new())),
            }
        }));
        let result = publisher(dir.path(), transport.clone())
            .publish(
                "",
                &[MediaAsset::stored(MediaKind::Video, "v.mp4")],
                &PublishOptions::default(),
            )
            .await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("Unsupported codec"));
        assert!(transport.calls_to("/rest/posts").is_empty());
    }

    #[tokio::test]
    async fn test_missing_author_is_configuration_failure() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::unreachable());
        let mut conn = connection();
        conn.credentials.clear();
        let media = MediaLibrary::new(dir.path().to_path_buf(), None, transport.clone());
        let result = LinkedInPublisher::new(Some(conn), transport.clone(), media)
            .publish("Hi", &[], &PublishOptions::default())
            .await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("No LinkedIn profile"));
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn test_link_post_body_uses_article() {
        let options = PublishOptions {
            link: Some("https://example.test/blog".into()),
            title: Some("Blog".into()),
            ..Default::default()
        };
        let body = LinkedInPublisher::post_body("urn:li:person:1", "Read", &PostMedia::None, &options);
        assert_eq!(body["content"]["article"]["source"], "https://example.test/blog");
        assert_eq!(body["content"]["article"]["title"], "Blog");
    }
}
