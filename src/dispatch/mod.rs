// Dispatch module - routes a batch for one connection to its platform batcher
// 分发模块 - 按连接所属平台把批次交给对应的批处理器

use std::sync::Arc;

use crate::core::{BatchError, BatchRequest, BatchResults, ConnectionResolver};
use crate::platforms::common::{fail_group, finalize_results, request_ids};
use crate::platforms::factory::BatcherRegistry;
use crate::platforms::traits::PlatformBatcher;

/// Entry point for batched platform reads and writes.
///
/// The returned map always has exactly one entry per submitted request id.
#[derive(Clone)]
pub struct BatchDispatcher {
    resolver: ConnectionResolver,
    registry: Arc<BatcherRegistry>,
}

impl BatchDispatcher {
    pub fn new(resolver: ConnectionResolver, registry: Arc<BatcherRegistry>) -> Self {
        Self { resolver, registry }
    }

    pub fn registry(&self) -> &BatcherRegistry {
        &self.registry
    }

    /// Batchers that accept `request_type`
    pub fn batchers_for(&self, request_type: &str) -> Vec<Arc<dyn PlatformBatcher>> {
        self.registry
            .iter()
            .filter(|b| b.can_handle(request_type))
            .cloned()
            .collect()
    }

    pub async fn dispatch(&self, connection_id: &str, requests: &[BatchRequest]) -> BatchResults {
        if requests.is_empty() {
            return BatchResults::new();
        }
        tracing::info!(
            "[Dispatch] ====== 开始分发: connection={}, requests={} ======",
            connection_id,
            requests.len()
        );

        // 连接无效时不发起任何远程调用
        let connection = match self.resolver.resolve(connection_id).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("[Dispatch] 连接 {} 无效: {}", connection_id, e);
                let mut results = BatchResults::new();
                fail_group(&mut results, requests, &e);
                return finalize_results(requests, results);
            }
        };

        let platform = connection.platform;
        let Some(batcher) = self.registry.get(platform) else {
            tracing::error!("[Dispatch] 平台 {} 没有注册批处理器", platform.as_str());
            let mut results = BatchResults::new();
            results.fail_all(
                request_ids(requests),
                &BatchError::new(format!(
                    "No batcher registered for platform {}",
                    platform.as_str()
                )),
            );
            return finalize_results(requests, results);
        };

        let results = batcher.execute_for_connection(connection, requests).await;
        let results = finalize_results(requests, results);

        let failed = results.iter().filter(|(_, r)| !r.is_success()).count();
        tracing::info!(
            "[Dispatch] ====== 分发完成: platform={}, ok={}, failed={} ======",
            platform.as_str(),
            results.len() - failed,
            failed
        );
        results
    }
}
