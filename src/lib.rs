// Core modules
// 核心模块
pub mod commands;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod http;
pub mod media;
pub mod platforms;
pub mod storage;

// Re-export the main entry points
// 重新导出主要入口类型
pub use crate::config::AppConfig;
pub use crate::core::{
    BatchError, BatchRequest, BatchResult, BatchResults, ConnectionResolver, ConnectionStore,
    MediaAsset, PlatformConnection, PlatformError, PlatformType, PublishOptions, PublishResult,
};
pub use crate::dispatch::BatchDispatcher;
pub use crate::platforms::factory::{BatcherRegistry, PublishTarget, PublisherFactory};

use tracing_subscriber::EnvFilter;

// Initialize tracing for logging; RUST_LOG wins over the configured level
// 初始化 tracing 日志输出
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
