// Core module - platform types, domain records and errors
// 核心模块 - 平台类型、领域数据与错误定义

mod connection;
mod params;
mod results;

pub use connection::{ConnectionResolver, ConnectionStore, InMemoryConnectionStore, INVALID_CONNECTION};
#[cfg(any(test, feature = "test-export-mocks"))]
pub use connection::MockConnectionStore;
pub use params::RequestParams;
pub use results::{BatchError, BatchResult, BatchResults};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::http::TransportError;

/// Platform type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformType {
    Meta,
    Google,
    TikTok,
    LinkedIn,
    Twitter,
    Snapchat,
}

impl PlatformType {
    pub const ALL: [PlatformType; 6] = [
        PlatformType::Meta,
        PlatformType::Google,
        PlatformType::TikTok,
        PlatformType::LinkedIn,
        PlatformType::Twitter,
        PlatformType::Snapchat,
    ];

    /// Storage / wire identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::Meta => "meta",
            PlatformType::Google => "google",
            PlatformType::TikTok => "tiktok",
            PlatformType::LinkedIn => "linkedin",
            PlatformType::Twitter => "twitter",
            PlatformType::Snapchat => "snapchat",
        }
    }

    /// Get platform display name
    pub fn display_name(&self) -> &'static str {
        match self {
            PlatformType::Meta => "Meta",
            PlatformType::Google => "Google",
            PlatformType::TikTok => "TikTok",
            PlatformType::LinkedIn => "LinkedIn",
            PlatformType::Twitter => "Twitter",
            PlatformType::Snapchat => "Snapchat",
        }
    }

    /// Get platform type from string
    pub fn parse(s: &str) -> Option<PlatformType> {
        match s.trim().to_lowercase().as_str() {
            "meta" | "facebook" | "instagram" => Some(PlatformType::Meta),
            "google" | "google_ads" | "youtube" => Some(PlatformType::Google),
            "tiktok" => Some(PlatformType::TikTok),
            "linkedin" => Some(PlatformType::LinkedIn),
            "twitter" | "x" => Some(PlatformType::Twitter),
            "snapchat" => Some(PlatformType::Snapchat),
            _ => None,
        }
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Inactive,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Inactive => "inactive",
        }
    }
}

/// Stored OAuth/API credentials for one platform + organization.
/// 平台连接凭证（由外部 OAuth 流程写入，本层只读）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConnection {
    pub id: String,
    pub org_id: String,
    pub platform: PlatformType,
    pub access_token: Option<String>,
    pub account_id: Option<String>,
    /// Platform-specific extras (organization_id, access_token_secret, page_id, ...)
    #[serde(default)]
    pub credentials: Map<String, Value>,
    pub status: ConnectionStatus,
}

impl PlatformConnection {
    /// Token, if present and non-blank
    pub fn token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn is_usable(&self) -> bool {
        self.status == ConnectionStatus::Active && self.token().is_some()
    }

    /// Read a string credential; numeric values are stringified
    pub fn credential(&self, key: &str) -> Option<String> {
        match self.credentials.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Account id with surrounding whitespace removed, None when blank
    pub fn account(&self) -> Option<String> {
        self.account_id
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
    }
}

/// One logical unit of pending work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub id: String,
    pub request_type: String,
    #[serde(default)]
    pub request_params: Value,
}

impl BatchRequest {
    pub fn new(id: impl Into<String>, request_type: impl Into<String>, request_params: Value) -> Self {
        Self {
            id: id.into(),
            request_type: request_type.into(),
            request_params,
        }
    }

    /// Typed view over the opaque params
    pub fn params(&self) -> RequestParams {
        RequestParams::from_value(&self.request_params)
    }
}

/// Media type of a publish attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// Where the media bytes live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Url(String),
    Storage(String),
}

#[derive(Deserialize)]
struct MediaAssetWire {
    #[serde(rename = "type")]
    kind: MediaKind,
    url: Option<String>,
    storage_path: Option<String>,
    alt_text: Option<String>,
}

/// A piece of content to attach to a post
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "MediaAssetWire")]
pub struct MediaAsset {
    pub kind: MediaKind,
    pub source: MediaSource,
    pub alt_text: Option<String>,
}

impl TryFrom<MediaAssetWire> for MediaAsset {
    type Error = String;

    fn try_from(wire: MediaAssetWire) -> Result<Self, Self::Error> {
        let source = match (wire.storage_path, wire.url) {
            (Some(path), _) if !path.trim().is_empty() => MediaSource::Storage(path),
            (_, Some(url)) if !url.trim().is_empty() => MediaSource::Url(url),
            _ => return Err("media item needs either url or storage_path".to_string()),
        };
        Ok(MediaAsset {
            kind: wire.kind,
            source,
            alt_text: wire.alt_text.filter(|t| !t.trim().is_empty()),
        })
    }
}

impl MediaAsset {
    pub fn image_url(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Image,
            source: MediaSource::Url(url.into()),
            alt_text: None,
        }
    }

    pub fn video_url(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            source: MediaSource::Url(url.into()),
            alt_text: None,
        }
    }

    pub fn stored(kind: MediaKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            source: MediaSource::Storage(path.into()),
            alt_text: None,
        }
    }

    pub fn with_alt_text(mut self, alt: impl Into<String>) -> Self {
        self.alt_text = Some(alt.into());
        self
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// File name part of the source, used for extension checks
    pub fn file_name(&self) -> &str {
        let raw = match &self.source {
            MediaSource::Url(u) => u.split(['?', '#']).next().unwrap_or(u),
            MediaSource::Storage(p) => p.as_str(),
        };
        raw.rsplit('/').next().unwrap_or(raw)
    }

    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
    }
}

/// Call-to-action button attached to a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallToAction {
    pub action_type: String,
    pub url: Option<String>,
}

/// Publishing options
/// 发布选项（各平台按需读取，未识别字段保留在 extra 中）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    pub page_id: Option<String>,
    pub instagram_account_id: Option<String>,
    pub organization_id: Option<String>,
    pub location_id: Option<String>,
    pub privacy_level: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub first_comment: Option<String>,
    pub call_to_action: Option<CallToAction>,
    pub share_to_feed: Option<bool>,
    pub location_tag: Option<String>,
    pub collaborators: Vec<String>,
    pub disable_comment: bool,
    pub disable_duet: bool,
    pub disable_stitch: bool,
    pub language_code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Normalized outcome of a publish operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PublishResult {
    /// Successful publish; an empty post id is downgraded to a failure
    pub fn published(post_id: impl Into<String>, permalink: Option<String>) -> Self {
        let post_id = post_id.into();
        if post_id.trim().is_empty() {
            return Self::failed("Platform accepted the post but returned no post id");
        }
        Self {
            success: true,
            post_id: Some(post_id),
            permalink,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            post_id: None,
            permalink: None,
            message: Some(if message.trim().is_empty() {
                "Unknown publishing error".to_string()
            } else {
                message
            }),
        }
    }
}

/// User-facing error categories for publish failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    TokenExpired,
    PermissionDenied,
    RateLimited,
    InvalidMedia,
    Unknown,
}

impl ErrorCategory {
    pub fn user_message(&self, platform: &str) -> String {
        match self {
            ErrorCategory::TokenExpired => format!(
                "Your {} connection has expired. Please reconnect your account.",
                platform
            ),
            ErrorCategory::PermissionDenied => format!(
                "The connected {} account does not have permission to publish here. Check the account's permissions and reconnect.",
                platform
            ),
            ErrorCategory::RateLimited => format!(
                "{} rate limit reached. Please try again later.",
                platform
            ),
            ErrorCategory::InvalidMedia => format!(
                "{} rejected the attached media. Check the file format, size and duration.",
                platform
            ),
            ErrorCategory::Unknown => format!("{} API error", platform),
        }
    }
}

/// Platform errors
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{0}")]
    Connection(String),

    #[error("Unsupported request type: {0}")]
    UnsupportedRequest(String),

    #[error("{message}")]
    RemoteApi {
        message: String,
        status: u16,
        code: Option<String>,
    },

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Validation(String),

    #[error("Media processing failed: {0}")]
    ProcessingFailed(String),

    #[error("{0}")]
    ProcessingTimeout(String),

    #[error("{0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl PlatformError {
    pub fn remote(message: impl Into<String>, status: u16, code: Option<String>) -> Self {
        PlatformError::RemoteApi {
            message: message.into(),
            status,
            code,
        }
    }

    /// Convert to the per-request error shape used by batch results
    pub fn to_batch_error(&self) -> BatchError {
        match self {
            PlatformError::RemoteApi { message, status, code } => {
                let code = code
                    .as_deref()
                    .and_then(|c| c.parse::<i64>().ok())
                    .unwrap_or(i64::from(*status));
                BatchError::with_code(message.clone(), code)
            }
            other => BatchError::new(other.to_string()),
        }
    }
}

impl std::convert::From<rusqlite::Error> for PlatformError {
    fn from(e: rusqlite::Error) -> Self {
        PlatformError::Storage(e.to_string())
    }
}

impl std::convert::From<std::io::Error> for PlatformError {
    fn from(e: std::io::Error) -> Self {
        PlatformError::Validation(format!("Media file could not be read: {}", e))
    }
}

impl std::convert::From<TransportError> for PlatformError {
    fn from(e: TransportError) -> Self {
        PlatformError::Transport(e.to_string())
    }
}

impl std::convert::From<serde_json::Error> for PlatformError {
    fn from(e: serde_json::Error) -> Self {
        PlatformError::Transport(format!("Invalid JSON payload: {}", e))
    }
}
