//! Google Business Profile 发布器
//!
//! 发布 localPosts（STANDARD 类型），最多附带一张图片和一个行动按钮。

use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use super::{BUSINESS_API_VERSION, BUSINESS_BASE_URL};
use crate::core::{
    ErrorCategory, MediaAsset, PlatformConnection, PlatformError, PublishOptions, PublishResult,
};
use crate::http::{ApiRequest, HttpTransport};
use crate::media::MediaLibrary;
use crate::platforms::common::{finish_publish, json_or_error, not_connected_message, ErrorTable};
use crate::platforms::traits::PlatformPublisher;

const SUMMARY_MAX_CHARS: usize = 1500;
const ACTION_TYPES: &[&str] = &["BOOK", "ORDER", "SHOP", "LEARN_MORE", "SIGN_UP", "CALL"];

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new("Google Business")
        .code("UNAUTHENTICATED", ErrorCategory::TokenExpired)
        .code("PERMISSION_DENIED", ErrorCategory::PermissionDenied)
        .code("RESOURCE_EXHAUSTED", ErrorCategory::RateLimited)
        .fragment("invalid authentication credentials", ErrorCategory::TokenExpired)
        .fragment("sourceurl", ErrorCategory::InvalidMedia)
        .fragment("media", ErrorCategory::InvalidMedia)
});

pub struct GoogleBusinessPublisher {
    connection: Option<PlatformConnection>,
    transport: Arc<dyn HttpTransport>,
    media: MediaLibrary,
}

impl GoogleBusinessPublisher {
    pub fn new(
        connection: Option<PlatformConnection>,
        transport: Arc<dyn HttpTransport>,
        media: MediaLibrary,
    ) -> Self {
        Self {
            connection,
            transport,
            media,
        }
    }

    fn location_name(
        connection: &PlatformConnection,
        options: &PublishOptions,
    ) -> Result<String, PlatformError> {
        let location = options
            .location_id
            .clone()
            .or_else(|| connection.credential("location_id"))
            .ok_or_else(|| {
                PlatformError::Configuration(
                    "No Google Business location selected. Please choose a location in the connection settings."
                        .to_string(),
                )
            })?;
        // 允许直接传入完整资源名
        if location.starts_with("accounts/") {
            return Ok(location);
        }
        let account = connection
            .account()
            .or_else(|| connection.credential("account_id"))
            .ok_or_else(|| {
                PlatformError::Configuration(
                    "Google Business account ID is missing. Please reconnect your account."
                        .to_string(),
                )
            })?;
        let account = account.trim_start_matches("accounts/");
        let location = location.trim_start_matches("locations/");
        Ok(format!("accounts/{}/locations/{}", account, location))
    }

    fn validate(content: &str, media: &[MediaAsset]) -> Result<(), PlatformError> {
        let length = content.chars().count();
        if length == 0 {
            return Err(PlatformError::Validation(
                "Google Business posts need some text".to_string(),
            ));
        }
        if length > SUMMARY_MAX_CHARS {
            return Err(PlatformError::Validation(format!(
                "Google Business post text is {} characters; the limit is {}",
                length, SUMMARY_MAX_CHARS
            )));
        }
        if media.len() > 1 {
            return Err(PlatformError::Validation(
                "Google Business posts support a single photo only".to_string(),
            ));
        }
        if media.iter().any(MediaAsset::is_video) {
            return Err(PlatformError::Validation(
                "Google Business posts support photos only, not videos".to_string(),
            ));
        }
        Ok(())
    }

    fn build_body(
        &self,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> Result<Value, PlatformError> {
        let mut body = json!({
            "languageCode": options.language_code.clone().unwrap_or_else(|| "en".to_string()),
            "summary": content,
            "topicType": "STANDARD",
        });

        if let Some(asset) = media.first() {
            body["media"] = json!([{
                "mediaFormat": "PHOTO",
                "sourceUrl": self.media.public_url(asset)?,
            }]);
        }

        if let Some(cta) = &options.call_to_action {
            let action = cta.action_type.to_uppercase();
            if !ACTION_TYPES.contains(&action.as_str()) {
                return Err(PlatformError::Validation(format!(
                    "Invalid call to action {}. Must be one of: {}",
                    cta.action_type,
                    ACTION_TYPES.join(", ")
                )));
            }
            match (&cta.url, action.as_str()) {
                (Some(url), _) => {
                    body["callToAction"] = json!({ "actionType": action, "url": url });
                }
                (None, "CALL") => {
                    body["callToAction"] = json!({ "actionType": action });
                }
                (None, _) => {
                    return Err(PlatformError::Validation(format!(
                        "Call to action {} needs a URL",
                        action
                    )));
                }
            }
        }

        Ok(body)
    }

    async fn run(
        &self,
        connection: &PlatformConnection,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> Result<(String, Option<String>), PlatformError> {
        Self::validate(content, media)?;
        let location = Self::location_name(connection, options)?;
        let body = self.build_body(content, media, options)?;

        tracing::info!("[Publish] ====== Google Business: {} ======", location);
        let url = format!(
            "{}/{}/{}/localPosts",
            BUSINESS_BASE_URL, BUSINESS_API_VERSION, location
        );
        let request = ApiRequest::post(url)
            .bearer(connection.token().unwrap_or_default())
            .json(&body);
        let response = self.transport.send(request).await?;
        let data = json_or_error(&response, "Google Business")?;

        let post_id = data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let permalink = data
            .get("searchUrl")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok((post_id, permalink))
    }
}

#[async_trait::async_trait]
impl PlatformPublisher for GoogleBusinessPublisher {
    fn platform_name(&self) -> &'static str {
        "google_business"
    }

    async fn publish(
        &self,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> PublishResult {
        let Some(connection) = self.connection.as_ref().filter(|c| c.is_usable()) else {
            return PublishResult::failed(not_connected_message("Google Business"));
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
    use crate::core::{CallToAction, ConnectionStatus, PlatformType};
    use crate::http::{ApiResponse, ScriptedTransport};
    use serde_json::Map;
    use std::path::PathBuf;

    fn connection() -> PlatformConnection {
        PlatformConnection {
            id: "gb".into(),
            org_id: "org".into(),
            platform: PlatformType::Google,
            access_token: Some("tok".into()),
            account_id: Some("111".into()),
            credentials: Map::new(),
            status: ConnectionStatus::Active,
        }
    }

    fn publisher(transport: Arc<ScriptedTransport>) -> GoogleBusinessPublisher {
        let media = MediaLibrary::new(
            PathBuf::from("/nonexistent"),
            Some("https://cdn.example.test".into()),
            transport.clone(),
        );
        GoogleBusinessPublisher::new(Some(connection()), transport, media)
    }

    #[tokio::test]
    async fn test_publish_single_photo_post() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            assert!(req
                .url
                .ends_with("/v4/accounts/111/locations/222/localPosts"));
            let body = req.json_body().unwrap();
            assert_eq!(body["media"][0]["sourceUrl"], "https://img.example.test/a.jpg");
            assert_eq!(body["callToAction"]["actionType"], "LEARN_MORE");
            Ok(ApiResponse::json_body(
                200,
                &json!({
                    "name": "accounts/111/locations/222/localPosts/333",
                    "searchUrl": "https://local.google.com/place?id=1"
                }),
            ))
        }));
        let options = PublishOptions {
            location_id: Some("222".into()),
            call_to_action: Some(CallToAction {
                action_type: "learn_more".into(),
                url: Some("https://example.test".into()),
            }),
            ..Default::default()
        };
        let result = publisher(transport.clone())
            .publish(
                "Spring sale",
                &[MediaAsset::image_url("https://img.example.test/a.jpg")],
                &options,
            )
            .await;

        assert!(result.success, "{:?}", result.message);
        assert_eq!(
            result.post_id.as_deref(),
            Some("accounts/111/locations/222/localPosts/333")
        );
        assert!(result.permalink.is_some());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_location_fails_without_calls() {
        let transport = Arc::new(ScriptedTransport::unreachable());
        let result = publisher(transport.clone())
            .publish("Hello", &[], &PublishOptions::default())
            .await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("location"));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_multiple_photos_and_long_text() {
        let transport = Arc::new(ScriptedTransport::unreachable());
        let publisher = publisher(transport.clone());
        let options = PublishOptions {
            location_id: Some("222".into()),
            ..Default::default()
        };
        let two = [
            MediaAsset::image_url("https://a.test/1.jpg"),
            MediaAsset::image_url("https://a.test/2.jpg"),
        ];
        assert!(!publisher.publish("x", &two, &options).await.success);

        let long = "a".repeat(SUMMARY_MAX_CHARS + 1);
        assert!(!publisher.publish(&long, &[], &options).await.success);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unauthenticated_is_translated() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(ApiResponse::json_body(
                401,
                &json!({"error": {"code": 401, "message": "Request had invalid authentication credentials.", "status": "UNAUTHENTICATED"}}),
            ))
        }));
        let options = PublishOptions {
            location_id: Some("222".into()),
            ..Default::default()
        };
        let result = publisher(transport).publish("Hi", &[], &options).await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("reconnect"));
    }
}
