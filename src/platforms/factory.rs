//! 批处理器注册表与发布器工厂
//!
//! - `BatcherRegistry`：平台类型 -> 批处理器，启动时一次性注册全部平台
//! - `PublisherFactory`：平台名 -> 发布器；按 (发布目标, 组织) 缓存实例，
//!   连接在首次获取时解析

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::Mutex;

use crate::config::{AppConfig, PollingSettings};
use crate::core::{
    ConnectionResolver, MediaAsset, PlatformConnection, PlatformType, PublishOptions,
    PublishResult,
};
use crate::http::HttpTransport;
use crate::media::MediaLibrary;
use crate::platforms::google::{GoogleBatcher, GoogleBusinessPublisher};
use crate::platforms::linkedin::{LinkedInBatcher, LinkedInPublisher};
use crate::platforms::meta::{MetaBatcher, MetaPublisher, MetaSurface};
use crate::platforms::snapchat::SnapchatBatcher;
use crate::platforms::tiktok::{TikTokBatcher, TikTokPublisher};
use crate::platforms::traits::{PlatformBatcher, PlatformPublisher};
use crate::platforms::twitter::{TwitterBatcher, TwitterPublisher};

// ============================================================================
// 批处理器注册表
// ============================================================================

/// One batcher per platform, in registration order
#[derive(Default, Clone)]
pub struct BatcherRegistry {
    batchers: IndexMap<PlatformType, Arc<dyn PlatformBatcher>>,
}

impl BatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every supported platform, wired to one shared transport
    pub fn defaults(transport: Arc<dyn HttpTransport>, config: &AppConfig) -> Self {
        let throttled = config.throttle.enabled;
        let mut registry = Self::new();

        let meta = MetaBatcher::new(transport.clone());
        let google = GoogleBatcher::new(transport.clone(), config.google_ads.clone());
        let tiktok = TikTokBatcher::new(transport.clone());
        let linkedin = LinkedInBatcher::new(transport.clone());
        let twitter = TwitterBatcher::new(transport.clone());
        let snapchat = SnapchatBatcher::new(transport);

        if throttled {
            registry.register(Arc::new(meta));
            registry.register(Arc::new(google));
            registry.register(Arc::new(tiktok));
            registry.register(Arc::new(linkedin));
            registry.register(Arc::new(twitter));
            registry.register(Arc::new(snapchat));
        } else {
            tracing::info!("[Registry] 节流已关闭");
            registry.register(Arc::new(meta.without_throttle()));
            registry.register(Arc::new(google.without_throttle()));
            registry.register(Arc::new(tiktok.without_throttle()));
            registry.register(Arc::new(linkedin.without_throttle()));
            registry.register(Arc::new(twitter.without_throttle()));
            registry.register(Arc::new(snapchat.without_throttle()));
        }

        tracing::info!(
            "[Registry] 已注册批处理器: {:?}",
            registry.platforms().collect::<Vec<_>>()
        );
        registry
    }

    /// Register (or replace) the batcher for its platform
    pub fn register(&mut self, batcher: Arc<dyn PlatformBatcher>) {
        self.batchers.insert(batcher.platform(), batcher);
    }

    pub fn get(&self, platform: PlatformType) -> Option<Arc<dyn PlatformBatcher>> {
        self.batchers.get(&platform).cloned()
    }

    pub fn platforms(&self) -> impl Iterator<Item = PlatformType> + '_ {
        self.batchers.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PlatformBatcher>> {
        self.batchers.values()
    }

    pub fn len(&self) -> usize {
        self.batchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batchers.is_empty()
    }
}

// ============================================================================
// 发布器工厂
// ============================================================================

/// Publishing destination named by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishTarget {
    Facebook,
    Instagram,
    Twitter,
    LinkedIn,
    TikTok,
    GoogleBusiness,
}

impl PublishTarget {
    /// Case-insensitive; platforms without a publisher yield None
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "facebook" => Some(PublishTarget::Facebook),
            "instagram" => Some(PublishTarget::Instagram),
            "twitter" | "x" => Some(PublishTarget::Twitter),
            "linkedin" => Some(PublishTarget::LinkedIn),
            "tiktok" => Some(PublishTarget::TikTok),
            "google_business" | "google" | "gmb" => Some(PublishTarget::GoogleBusiness),
            _ => None,
        }
    }

    /// Platform whose connection authorizes this target
    pub fn platform_type(&self) -> PlatformType {
        match self {
            PublishTarget::Facebook | PublishTarget::Instagram => PlatformType::Meta,
            PublishTarget::Twitter => PlatformType::Twitter,
            PublishTarget::LinkedIn => PlatformType::LinkedIn,
            PublishTarget::TikTok => PlatformType::TikTok,
            PublishTarget::GoogleBusiness => PlatformType::Google,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PublishTarget::Facebook => "facebook",
            PublishTarget::Instagram => "instagram",
            PublishTarget::Twitter => "twitter",
            PublishTarget::LinkedIn => "linkedin",
            PublishTarget::TikTok => "tiktok",
            PublishTarget::GoogleBusiness => "google_business",
        }
    }
}

type PublisherKey = (PublishTarget, String);

/// Builds publishers bound to an organization's active connection
pub struct PublisherFactory {
    resolver: ConnectionResolver,
    transport: Arc<dyn HttpTransport>,
    media: MediaLibrary,
    polling: PollingSettings,
    cache: Mutex<HashMap<PublisherKey, Arc<dyn PlatformPublisher>>>,
}

impl PublisherFactory {
    pub fn new(
        resolver: ConnectionResolver,
        transport: Arc<dyn HttpTransport>,
        media: MediaLibrary,
    ) -> Self {
        Self {
            resolver,
            transport,
            media,
            polling: PollingSettings::default(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Apply configured poll overrides to every publisher built afterwards
    pub fn with_polling(mut self, polling: PollingSettings) -> Self {
        self.polling = polling;
        self
    }

    /// Publisher for `platform_name` acting for `org_id`.
    ///
    /// Returns None only when the platform has no publisher. A missing
    /// connection still yields a publisher, which then fails every publish
    /// with a reconnect prompt; that publisher is not cached.
    pub async fn get_publisher(
        &self,
        platform_name: &str,
        org_id: &str,
    ) -> Option<Arc<dyn PlatformPublisher>> {
        let Some(target) = PublishTarget::parse(platform_name) else {
            tracing::warn!("[PublisherFactory] 未注册的平台: {}", platform_name);
            return None;
        };
        let key = (target, org_id.to_string());

        let mut cache = self.cache.lock().await;
        if let Some(publisher) = cache.get(&key) {
            return Some(publisher.clone());
        }

        let connection = match self
            .resolver
            .resolve_for_org(org_id, target.platform_type())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(
                    "[PublisherFactory] 连接查询失败 ({}, {}): {}",
                    target.as_str(),
                    org_id,
                    e
                );
                None
            }
        };
        // 无连接时不缓存，组织连接后下一次调用重新构建
        let Some(connection) = connection else {
            tracing::warn!(
                "[PublisherFactory] 组织 {} 没有可用的 {} 连接",
                org_id,
                target.platform_type().display_name()
            );
            return Some(self.build(target, None));
        };

        let publisher = self.build(target, Some(connection));
        cache.insert(key, publisher.clone());
        Some(publisher)
    }

    fn build(
        &self,
        target: PublishTarget,
        connection: Option<PlatformConnection>,
    ) -> Arc<dyn PlatformPublisher> {
        let transport = self.transport.clone();
        let media = self.media.clone();
        let polling = &self.polling;
        match target {
            PublishTarget::Facebook => Arc::new(
                MetaPublisher::new(connection, transport, media, MetaSurface::Facebook)
                    .map_polls(|p| polling.apply(p)),
            ),
            PublishTarget::Instagram => Arc::new(
                MetaPublisher::new(connection, transport, media, MetaSurface::Instagram)
                    .map_polls(|p| polling.apply(p)),
            ),
            PublishTarget::Twitter => Arc::new(
                TwitterPublisher::new(connection, transport, media).map_poll(|p| polling.apply(p)),
            ),
            PublishTarget::LinkedIn => Arc::new(
                LinkedInPublisher::new(connection, transport, media).map_poll(|p| polling.apply(p)),
            ),
            PublishTarget::TikTok => Arc::new(
                TikTokPublisher::new(connection, transport, media).map_poll(|p| polling.apply(p)),
            ),
            PublishTarget::GoogleBusiness => {
                Arc::new(GoogleBusinessPublisher::new(connection, transport, media))
            }
        }
    }

    /// Resolve a publisher and publish in one step
    pub async fn publish(
        &self,
        platform_name: &str,
        org_id: &str,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> PublishResult {
        match self.get_publisher(platform_name, org_id).await {
            Some(publisher) => {
                tracing::info!(
                    "[PublisherFactory] 发布到 {} (org={}, media={})",
                    publisher.platform_name(),
                    org_id,
                    media.len()
                );
                publisher.publish(content, media, options).await
            }
            None => PublishResult::failed(format!(
                "Publishing to {} is not supported",
                platform_name
            )),
        }
    }
}
