//! Meta 平台模块（Facebook / Instagram）
//!
//! - [`batcher`] - Marketing API 批处理器（嵌套字段展开 + Graph Batch API）
//! - [`publisher`] - Facebook 主页与 Instagram 专业账号发布器（容器 + 轮询）

pub mod batcher;
pub mod publisher;

pub use self::batcher::MetaBatcher;
pub use self::publisher::{MetaPublisher, MetaSurface};

/// Graph API version
pub const GRAPH_API_VERSION: &str = "v21.0";

pub const GRAPH_BASE_URL: &str = "https://graph.facebook.com";

pub(crate) fn graph_url(path: &str) -> String {
    format!(
        "{}/{}/{}",
        GRAPH_BASE_URL,
        GRAPH_API_VERSION,
        path.trim_start_matches('/')
    )
}
