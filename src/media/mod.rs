// Media module - resolves MediaAsset sources to public URLs, local files or bytes
// 媒体模块 - 将媒体引用解析为公网 URL、本地文件或字节

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::core::{MediaAsset, MediaSource, PlatformError};
use crate::http::{ApiRequest, HttpTransport};

/// Loaded media content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBytes {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub file_name: String,
}

impl MediaBytes {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Media storage resolver
/// 媒体存储解析器
#[derive(Clone)]
pub struct MediaLibrary {
    storage_root: PathBuf,
    public_base_url: Option<String>,
    transport: Arc<dyn HttpTransport>,
}

impl MediaLibrary {
    pub fn new(
        storage_root: PathBuf,
        public_base_url: Option<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            storage_root,
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
            transport,
        }
    }

    /// Publicly reachable URL for the asset, used by URL-pull platforms
    pub fn public_url(&self, asset: &MediaAsset) -> Result<String, PlatformError> {
        match &asset.source {
            MediaSource::Url(url) => {
                if url.starts_with("http://") || url.starts_with("https://") {
                    return Ok(url.clone());
                }
                let base = self.base_url()?;
                Ok(format!("{}/{}", base, url.trim_start_matches('/')))
            }
            MediaSource::Storage(path) => {
                let base = self.base_url()?;
                Ok(format!("{}/storage/{}", base, path.trim_start_matches('/')))
            }
        }
    }

    fn base_url(&self) -> Result<&str, PlatformError> {
        self.public_base_url.as_deref().ok_or_else(|| {
            PlatformError::Configuration(
                "Media public base URL is not configured; cannot expose stored media".to_string(),
            )
        })
    }

    /// Local file backing the asset, when it lives under the storage root
    pub fn local_path(&self, asset: &MediaAsset) -> Option<PathBuf> {
        let relative = match &asset.source {
            MediaSource::Storage(path) => path.clone(),
            MediaSource::Url(url) => {
                let path = match url::Url::parse(url) {
                    Ok(parsed) => parsed.path().to_string(),
                    Err(_) => url.clone(),
                };
                let idx = path.find("/storage/")?;
                path[idx + "/storage/".len()..].to_string()
            }
        };
        let relative = Path::new(relative.trim_start_matches('/'));
        // 拒绝 .. 等路径逃逸
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.storage_root.join(relative))
    }

    /// Read the asset bytes, from disk when possible, otherwise over HTTP
    pub async fn load(&self, asset: &MediaAsset) -> Result<MediaBytes, PlatformError> {
        let file_name = asset.file_name().to_string();
        let mime = guess_mime(asset);

        if let Some(path) = self.local_path(asset) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tracing::debug!("[Media] reading local file {:?}", path);
                let bytes = tokio::fs::read(&path).await?;
                return Ok(MediaBytes {
                    bytes,
                    mime,
                    file_name,
                });
            }
            if let MediaSource::Storage(p) = &asset.source {
                return Err(PlatformError::Validation(format!(
                    "Media file not found in storage: {}",
                    p
                )));
            }
        }

        let url = self.public_url(asset)?;
        tracing::info!("[Media] downloading {}", url);
        let response = self.transport.send(ApiRequest::get(url.clone())).await?;
        if !response.is_success() {
            return Err(PlatformError::Validation(format!(
                "Media download failed (HTTP {}): {}",
                response.status, url
            )));
        }
        let mime = response
            .header("content-type")
            .map(|m| m.split(';').next().unwrap_or(m).trim().to_string())
            .filter(|m| !m.is_empty() && m != "application/octet-stream")
            .unwrap_or(mime);
        Ok(MediaBytes {
            bytes: response.body,
            mime,
            file_name,
        })
    }
}

/// MIME type from the file extension, falling back on the asset kind
pub fn guess_mime(asset: &MediaAsset) -> String {
    let by_ext = match asset.extension().as_deref() {
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("png") => Some("image/png"),
        Some("gif") => Some("image/gif"),
        Some("webp") => Some("image/webp"),
        Some("mp4") => Some("video/mp4"),
        Some("mov") => Some("video/quicktime"),
        Some("webm") => Some("video/webm"),
        Some("avi") => Some("video/x-msvideo"),
        _ => None,
    };
    by_ext
        .unwrap_or(if asset.is_video() { "video/mp4" } else { "image/jpeg" })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MediaKind;
    use crate::http::{ApiResponse, ScriptedTransport};

    fn library(root: &Path, transport: Arc<dyn HttpTransport>) -> MediaLibrary {
        MediaLibrary::new(
            root.to_path_buf(),
            Some("https://cdn.example.test/".to_string()),
            transport,
        )
    }

    #[test]
    fn test_public_url_for_storage_reference() {
        let lib = library(Path::new("/srv"), Arc::new(ScriptedTransport::unreachable()));
        let asset = MediaAsset::stored(MediaKind::Image, "posts/a.png");
        assert_eq!(
            lib.public_url(&asset).unwrap(),
            "https://cdn.example.test/storage/posts/a.png"
        );
    }

    #[test]
    fn test_local_path_maps_storage_urls_and_rejects_escape() {
        let lib = library(Path::new("/srv"), Arc::new(ScriptedTransport::unreachable()));
        let asset = MediaAsset::image_url("https://app.example.test/storage/posts/a.png");
        assert_eq!(lib.local_path(&asset), Some(PathBuf::from("/srv/posts/a.png")));

        let escape = MediaAsset::stored(MediaKind::Image, "../etc/passwd");
        assert!(lib.local_path(&escape).is_none());

        let remote = MediaAsset::image_url("https://other.test/img.png");
        assert!(lib.local_path(&remote).is_none());
    }

    #[tokio::test]
    async fn test_load_prefers_local_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("posts")).unwrap();
        std::fs::write(dir.path().join("posts/clip.mp4"), b"videobytes").unwrap();

        let lib = library(dir.path(), Arc::new(ScriptedTransport::unreachable()));
        let media = lib
            .load(&MediaAsset::stored(MediaKind::Video, "posts/clip.mp4"))
            .await
            .unwrap();
        assert_eq!(media.bytes, b"videobytes");
        assert_eq!(media.mime, "video/mp4");
        assert_eq!(media.file_name, "clip.mp4");
    }

    #[tokio::test]
    async fn test_load_downloads_remote_url() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(ApiResponse::new(200, b"png".to_vec()).with_header("Content-Type", "image/png"))
        }));
        let lib = library(dir.path(), transport.clone());
        let media = lib
            .load(&MediaAsset::image_url("https://other.test/pic"))
            .await
            .unwrap();
        assert_eq!(media.mime, "image/png");
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_storage_file_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let lib = library(dir.path(), Arc::new(ScriptedTransport::unreachable()));
        let err = lib
            .load(&MediaAsset::stored(MediaKind::Image, "nope.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
    }
}
