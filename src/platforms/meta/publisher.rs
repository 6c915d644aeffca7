//! Facebook 主页 / Instagram 专业账号发布器
//!
//! Facebook：用户 token 换取主页 token，然后按内容类型发到 feed / photos / videos。
//! 多图：每张图先以 published=false 上传，再由 feed 帖子通过 attached_media 引用。
//!
//! Instagram：创建媒体容器 -> 轮询 status_code 直到 FINISHED -> media_publish。
//! 轮播：每个子容器逐个创建并等待就绪，全部就绪后才创建父容器。
//! 任一容器失败或超时都不会调用 media_publish。

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use super::graph_url;
use crate::core::{
    ErrorCategory, MediaAsset, PlatformConnection, PlatformError, PublishOptions, PublishResult,
};
use crate::http::{ApiRequest, HttpTransport};
use crate::media::MediaLibrary;
use crate::platforms::common::{
    finish_publish, json_or_error, not_connected_message, poll_until, ErrorTable, PollConfig,
    PollState,
};
use crate::platforms::traits::PlatformPublisher;

const MAX_CAROUSEL_ITEMS: usize = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn graph_error_table(platform: &'static str) -> ErrorTable {
    ErrorTable::new(platform)
        .code("190", ErrorCategory::TokenExpired)
        .code("102", ErrorCategory::TokenExpired)
        .code("463", ErrorCategory::TokenExpired)
        .code("467", ErrorCategory::TokenExpired)
        .code("10", ErrorCategory::PermissionDenied)
        .code("200", ErrorCategory::PermissionDenied)
        .code("299", ErrorCategory::PermissionDenied)
        .code("4", ErrorCategory::RateLimited)
        .code("17", ErrorCategory::RateLimited)
        .code("32", ErrorCategory::RateLimited)
        .code("613", ErrorCategory::RateLimited)
        .code("352", ErrorCategory::InvalidMedia)
        .code("2207026", ErrorCategory::InvalidMedia)
        .code("2207004", ErrorCategory::InvalidMedia)
        .code("36003", ErrorCategory::InvalidMedia)
        .code("2207052", ErrorCategory::InvalidMedia)
        .fragment("session has expired", ErrorCategory::TokenExpired)
        .fragment("rate limit", ErrorCategory::RateLimited)
}

static FACEBOOK_ERRORS: Lazy<ErrorTable> = Lazy::new(|| graph_error_table("Facebook"));
static INSTAGRAM_ERRORS: Lazy<ErrorTable> = Lazy::new(|| graph_error_table("Instagram"));

/// Which Meta surface a publisher posts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaSurface {
    Facebook,
    Instagram,
}

impl MetaSurface {
    pub fn display_name(&self) -> &'static str {
        match self {
            MetaSurface::Facebook => "Facebook",
            MetaSurface::Instagram => "Instagram",
        }
    }

    fn error_table(&self) -> &'static ErrorTable {
        match self {
            MetaSurface::Facebook => &FACEBOOK_ERRORS,
            MetaSurface::Instagram => &INSTAGRAM_ERRORS,
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn push_caption(form: &mut Vec<(String, String)>, key: &str, content: &str) {
    if !content.trim().is_empty() {
        form.push((key.into(), content.to_string()));
    }
}

pub struct MetaPublisher {
    connection: Option<PlatformConnection>,
    transport: Arc<dyn HttpTransport>,
    media: MediaLibrary,
    surface: MetaSurface,
    image_poll: PollConfig,
    carousel_poll: PollConfig,
    video_poll: PollConfig,
}

impl MetaPublisher {
    pub fn new(
        connection: Option<PlatformConnection>,
        transport: Arc<dyn HttpTransport>,
        media: MediaLibrary,
        surface: MetaSurface,
    ) -> Self {
        Self {
            connection,
            transport,
            media,
            surface,
            image_poll: PollConfig::secs(1, 10),
            carousel_poll: PollConfig::secs(2, 20),
            video_poll: PollConfig::secs(2, 30),
        }
    }

    /// Same wait for every container kind
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.image_poll = poll;
        self.carousel_poll = poll;
        self.video_poll = poll;
        self
    }

    pub fn map_polls(mut self, f: impl Fn(PollConfig) -> PollConfig) -> Self {
        self.image_poll = f(self.image_poll);
        self.carousel_poll = f(self.carousel_poll);
        self.video_poll = f(self.video_poll);
        self
    }

    pub fn surface(&self) -> MetaSurface {
        self.surface
    }

    async fn post_form(
        &self,
        path: &str,
        token: &str,
        form: Vec<(String, String)>,
    ) -> Result<Value, PlatformError> {
        let request = ApiRequest::post(graph_url(path))
            .bearer(token)
            .form(form)
            .timeout(REQUEST_TIMEOUT);
        let response = self.transport.send(request).await?;
        json_or_error(&response, self.surface.display_name())
    }

    async fn get_fields(&self, path: &str, token: &str, fields: &str) -> Result<Value, PlatformError> {
        let request = ApiRequest::get(graph_url(path))
            .query("fields", fields)
            .bearer(token)
            .timeout(REQUEST_TIMEOUT);
        let response = self.transport.send(request).await?;
        json_or_error(&response, self.surface.display_name())
    }

    /// Best effort; a missing permalink never fails the publish
    async fn permalink(&self, object_id: &str, token: &str, field: &str) -> Option<String> {
        match self.get_fields(object_id, token, field).await {
            Ok(data) => string_field(&data, field),
            Err(e) => {
                tracing::warn!(
                    "[Publish] {} permalink lookup failed for {}: {}",
                    self.surface.display_name(),
                    object_id,
                    e
                );
                None
            }
        }
    }

    // ========================================================================
    // Facebook
    // ========================================================================

    /// Stored page token, or exchange the user token for one
    async fn page_token(
        &self,
        connection: &PlatformConnection,
        page_id: &str,
    ) -> Result<String, PlatformError> {
        if let Some(token) = connection.credential("page_access_token") {
            return Ok(token);
        }
        tracing::info!("[Publish] 获取 Facebook 主页 token: {}", page_id);
        let data = self
            .get_fields(page_id, connection.token().unwrap_or_default(), "access_token")
            .await?;
        string_field(&data, "access_token").ok_or_else(|| {
            PlatformError::Configuration(
                "Could not obtain a Facebook page access token. Please reconnect your Facebook account."
                    .to_string(),
            )
        })
    }

    async fn publish_facebook(
        &self,
        connection: &PlatformConnection,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> Result<(String, Option<String>), PlatformError> {
        let page_id = options
            .page_id
            .clone()
            .or_else(|| connection.credential("page_id"))
            .ok_or_else(|| {
                PlatformError::Configuration(
                    "No Facebook page selected. Please select a page in your Facebook connection settings."
                        .to_string(),
                )
            })?;

        let videos = media.iter().filter(|m| m.is_video()).count();
        if videos > 1 || (videos == 1 && media.len() > 1) {
            return Err(PlatformError::Validation(
                "Facebook posts support one video, or images only".to_string(),
            ));
        }
        if content.trim().is_empty() && media.is_empty() && options.link.is_none() {
            return Err(PlatformError::Validation(
                "Facebook posts need text, a link or media".to_string(),
            ));
        }

        let token = self.page_token(connection, &page_id).await?;

        let post_id = match media {
            [] => {
                tracing::info!("[Publish] ====== Facebook: 文本/链接帖子 ======");
                let mut form = Vec::new();
                push_caption(&mut form, "message", content);
                if let Some(link) = &options.link {
                    form.push(("link".into(), link.clone()));
                }
                let data = self.post_form(&format!("{}/feed", page_id), &token, form).await?;
                string_field(&data, "id")
            }
            [video] if video.is_video() => {
                tracing::info!("[Publish] ====== Facebook: 视频帖子 ======");
                let mut form = vec![("file_url".into(), self.media.public_url(video)?)];
                push_caption(&mut form, "description", content);
                if let Some(title) = &options.title {
                    form.push(("title".into(), title.clone()));
                }
                let data = self.post_form(&format!("{}/videos", page_id), &token, form).await?;
                string_field(&data, "id")
            }
            [image] => {
                tracing::info!("[Publish] ====== Facebook: 单图帖子 ======");
                let mut form = vec![("url".into(), self.media.public_url(image)?)];
                push_caption(&mut form, "caption", content);
                let data = self.post_form(&format!("{}/photos", page_id), &token, form).await?;
                string_field(&data, "post_id").or_else(|| string_field(&data, "id"))
            }
            images => {
                tracing::info!("[Publish] ====== Facebook: 多图帖子 ({} 张) ======", images.len());
                let mut form = Vec::new();
                push_caption(&mut form, "message", content);
                for (index, image) in images.iter().enumerate() {
                    let upload = vec![
                        ("url".into(), self.media.public_url(image)?),
                        ("published".into(), "false".into()),
                    ];
                    let data = self
                        .post_form(&format!("{}/photos", page_id), &token, upload)
                        .await?;
                    let photo_id = string_field(&data, "id").ok_or_else(|| {
                        PlatformError::ProcessingFailed(format!(
                            "Facebook returned no id for photo {}",
                            index + 1
                        ))
                    })?;
                    form.push((
                        format!("attached_media[{}]", index),
                        json!({ "media_fbid": photo_id }).to_string(),
                    ));
                }
                let data = self.post_form(&format!("{}/feed", page_id), &token, form).await?;
                string_field(&data, "id")
            }
        }
        .unwrap_or_default();

        if post_id.is_empty() {
            return Ok((post_id, None));
        }
        let permalink = self.permalink(&post_id, &token, "permalink_url").await;
        Ok((post_id, permalink))
    }

    // ========================================================================
    // Instagram
    // ========================================================================

    async fn create_container(
        &self,
        account: &str,
        token: &str,
        form: Vec<(String, String)>,
    ) -> Result<String, PlatformError> {
        let data = self.post_form(&format!("{}/media", account), token, form).await?;
        string_field(&data, "id").ok_or_else(|| {
            PlatformError::ProcessingFailed("Instagram returned no media container id".to_string())
        })
    }

    async fn wait_for_container(
        &self,
        container: &str,
        token: &str,
        poll: &PollConfig,
    ) -> Result<(), PlatformError> {
        let what = format!("Instagram media container {}", container);
        poll_until(poll, &what, |_| async move {
            let data = self.get_fields(container, token, "status_code,status").await?;
            let state = match data.get("status_code").and_then(Value::as_str) {
                Some("FINISHED") | Some("PUBLISHED") => PollState::Ready(()),
                Some(code @ ("ERROR" | "EXPIRED")) => PollState::Failed(format!(
                    "Instagram media container {}: {}",
                    code.to_lowercase(),
                    data.get("status").and_then(Value::as_str).unwrap_or("no details")
                )),
                _ => PollState::Pending,
            };
            Ok(state)
        })
        .await
    }

    fn media_form(
        &self,
        asset: &MediaAsset,
        carousel_item: bool,
    ) -> Result<Vec<(String, String)>, PlatformError> {
        let url = self.media.public_url(asset)?;
        let mut form = Vec::new();
        if carousel_item {
            form.push(("is_carousel_item".into(), "true".into()));
        }
        if asset.is_video() {
            let media_type = if carousel_item { "VIDEO" } else { "REELS" };
            form.push(("media_type".into(), media_type.into()));
            form.push(("video_url".into(), url));
        } else {
            form.push(("image_url".into(), url));
            if let Some(alt) = &asset.alt_text {
                form.push(("alt_text".into(), alt.clone()));
            }
        }
        Ok(form)
    }

    fn apply_post_options(form: &mut Vec<(String, String)>, content: &str, options: &PublishOptions) {
        push_caption(form, "caption", content);
        if let Some(location) = options.location_tag.as_ref().or(options.location_id.as_ref()) {
            form.push(("location_id".into(), location.clone()));
        }
        if !options.collaborators.is_empty() {
            form.push((
                "collaborators".into(),
                Value::from(options.collaborators.clone()).to_string(),
            ));
        }
    }

    async fn publish_instagram(
        &self,
        connection: &PlatformConnection,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> Result<(String, Option<String>), PlatformError> {
        let account = options
            .instagram_account_id
            .clone()
            .or_else(|| connection.credential("instagram_account_id"))
            .or_else(|| connection.account())
            .ok_or_else(|| {
                PlatformError::Configuration(
                    "No Instagram business account selected. Please reconnect your Instagram account."
                        .to_string(),
                )
            })?;
        if media.is_empty() {
            return Err(PlatformError::Validation(
                "Instagram requires at least one image or video".to_string(),
            ));
        }
        if media.len() > MAX_CAROUSEL_ITEMS {
            return Err(PlatformError::Validation(format!(
                "Instagram carousels support at most {} items",
                MAX_CAROUSEL_ITEMS
            )));
        }
        let token = connection.token().unwrap_or_default();

        let container = match media {
            [single] => {
                tracing::info!("[Publish] ====== Instagram 步骤1: 创建媒体容器 ======");
                let mut form = self.media_form(single, false)?;
                Self::apply_post_options(&mut form, content, options);
                if single.is_video() {
                    if let Some(share) = options.share_to_feed {
                        form.push(("share_to_feed".into(), share.to_string()));
                    }
                }
                let container = self.create_container(&account, token, form).await?;
                let poll = if single.is_video() {
                    &self.video_poll
                } else {
                    &self.image_poll
                };
                tracing::info!("[Publish] ====== Instagram 步骤2: 等待容器就绪 ======");
                self.wait_for_container(&container, token, poll).await?;
                container
            }
            items => {
                tracing::info!(
                    "[Publish] ====== Instagram 步骤1: 创建 {} 个轮播子容器 ======",
                    items.len()
                );
                let mut children = Vec::with_capacity(items.len());
                for item in items {
                    let child = self
                        .create_container(&account, token, self.media_form(item, true)?)
                        .await?;
                    let poll = if item.is_video() {
                        &self.video_poll
                    } else {
                        &self.image_poll
                    };
                    self.wait_for_container(&child, token, poll).await?;
                    children.push(child);
                }

                tracing::info!("[Publish] ====== Instagram 步骤2: 创建轮播父容器 ======");
                let mut form = vec![
                    ("media_type".into(), "CAROUSEL".into()),
                    ("children".into(), children.join(",")),
                ];
                Self::apply_post_options(&mut form, content, options);
                let container = self.create_container(&account, token, form).await?;
                self.wait_for_container(&container, token, &self.carousel_poll)
                    .await?;
                container
            }
        };

        tracing::info!("[Publish] ====== Instagram 步骤3: 发布 ======");
        let data = self
            .post_form(
                &format!("{}/media_publish", account),
                token,
                vec![("creation_id".into(), container)],
            )
            .await?;
        let media_id = string_field(&data, "id").unwrap_or_default();
        if media_id.is_empty() {
            return Ok((media_id, None));
        }

        let permalink = self.permalink(&media_id, token, "permalink").await;

        if let Some(comment) = options.first_comment.as_deref().filter(|c| !c.trim().is_empty()) {
            let form = vec![("message".into(), comment.to_string())];
            if let Err(e) = self
                .post_form(&format!("{}/comments", media_id), token, form)
                .await
            {
                tracing::warn!("[Publish] Instagram first comment failed: {}", e);
            }
        }

        Ok((media_id, permalink))
    }
}

#[async_trait::async_trait]
impl PlatformPublisher for MetaPublisher {
    fn platform_name(&self) -> &'static str {
        match self.surface {
            MetaSurface::Facebook => "facebook",
            MetaSurface::Instagram => "instagram",
        }
    }

    async fn publish(
        &self,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> PublishResult {
        let name = self.surface.display_name();
        let Some(connection) = self.connection.as_ref().filter(|c| c.is_usable()) else {
            return PublishResult::failed(not_connected_message(name));
        };
        let outcome = match self.surface {
            MetaSurface::Facebook => {
                self.publish_facebook(connection, content, media, options)
                    .await
            }
            MetaSurface::Instagram => {
                self.publish_instagram(connection, content, media, options)
                    .await
            }
        };
        finish_publish(self.surface.error_table(), outcome)
    }
}
