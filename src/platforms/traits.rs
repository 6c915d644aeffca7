//! 平台适配器 traits 定义
//!
//! 批处理器（PlatformBatcher）与发布器（PlatformPublisher）的通用接口。
//! 每个平台一个实现，由工厂 / 注册表按平台类型选择。

use std::time::Duration;

use serde::Serialize;

use crate::core::{
    BatchRequest, BatchResults, ConnectionResolver, MediaAsset, PlatformConnection,
    PlatformError, PlatformType, PublishOptions, PublishResult,
};
use crate::platforms::common::{fail_group, finalize_results, group_by_type, request_ids};

/// How an adapter consolidates many logical requests into few remote calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    FieldExpansion,
    SearchStream,
    BulkEndpoint,
    Pagination,
}

impl BatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStrategy::FieldExpansion => "field_expansion",
            BatchStrategy::SearchStream => "search_stream",
            BatchStrategy::BulkEndpoint => "bulk",
            BatchStrategy::Pagination => "pagination",
        }
    }
}

/// Validated connection handed to every group of one batch
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub connection: PlatformConnection,
    /// Platform account the batch runs against (customer id, advertiser id, ...)
    pub account_id: Option<String>,
}

impl BatchContext {
    pub fn new(connection: PlatformConnection) -> Self {
        let account_id = connection.account();
        Self {
            connection,
            account_id,
        }
    }

    pub fn token(&self) -> &str {
        self.connection.token().unwrap_or_default()
    }

    pub fn account(&self) -> &str {
        self.account_id.as_deref().unwrap_or_default()
    }
}

/// 批处理器 trait
///
/// `execute_by_type` receives every request of one type; an `Err` fails the
/// whole group and leaves other groups untouched.
#[async_trait::async_trait]
pub trait PlatformBatcher: Send + Sync {
    fn platform(&self) -> PlatformType;

    fn supported_request_types(&self) -> &'static [&'static str];

    fn can_handle(&self, request_type: &str) -> bool {
        self.supported_request_types().contains(&request_type)
    }

    /// Scheduler hint, not enforced here
    fn max_batch_size(&self) -> usize;

    /// Scheduler hint, not enforced here
    fn flush_interval(&self) -> Duration;

    fn batch_strategy(&self) -> BatchStrategy;

    /// Platform-specific connection checks, run before any remote call
    fn prepare(&self, connection: PlatformConnection) -> Result<BatchContext, PlatformError> {
        Ok(BatchContext::new(connection))
    }

    async fn execute_by_type(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError>;

    /// Resolve the connection, then run the batch. Never makes a remote call
    /// when the connection is unusable.
    async fn execute_batch(
        &self,
        resolver: &ConnectionResolver,
        connection_id: &str,
        requests: &[BatchRequest],
    ) -> BatchResults {
        match resolver.resolve(connection_id).await {
            Ok(connection) => self.execute_for_connection(connection, requests).await,
            Err(e) => {
                let mut results = BatchResults::new();
                fail_group(&mut results, requests, &e);
                results
            }
        }
    }

    /// Group by type and run each group in isolation
    async fn execute_for_connection(
        &self,
        connection: PlatformConnection,
        requests: &[BatchRequest],
    ) -> BatchResults {
        let platform = self.platform().display_name();
        let mut results = BatchResults::new();

        let ctx = match self.prepare(connection) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!("[{}Batcher] connection rejected: {}", platform, e);
                fail_group(&mut results, requests, &e);
                return results;
            }
        };

        for (request_type, group) in group_by_type(requests) {
            if !self.can_handle(&request_type) {
                tracing::warn!(
                    "[{}Batcher] unsupported request type {} ({} requests)",
                    platform,
                    request_type,
                    group.len()
                );
                fail_group(
                    &mut results,
                    &group,
                    &PlatformError::UnsupportedRequest(request_type.clone()),
                );
                continue;
            }

            tracing::info!(
                request_type = %request_type,
                request_count = group.len(),
                "[{}Batcher] executing group",
                platform
            );

            match self.execute_by_type(&ctx, &request_type, &group).await {
                Ok(group_results) => {
                    let produced = group_results.len();
                    let group_results = finalize_results(&group, group_results);
                    tracing::info!(
                        request_type = %request_type,
                        results_count = produced,
                        "[{}Batcher] group complete",
                        platform
                    );
                    results.merge(group_results);
                }
                Err(e) => {
                    tracing::error!(
                        request_type = %request_type,
                        "[{}Batcher] group failed: {}",
                        platform,
                        e
                    );
                    results.fail_all(request_ids(&group), &e.to_batch_error());
                }
            }
        }

        finalize_results(requests, results)
    }
}

/// 发布器 trait
///
/// Failures are reported through `PublishResult`, never as `Err`.
#[async_trait::async_trait]
pub trait PlatformPublisher: Send + Sync {
    fn platform_name(&self) -> &'static str;

    async fn publish(
        &self,
        content: &str,
        media: &[MediaAsset],
        options: &PublishOptions,
    ) -> PublishResult;
}
