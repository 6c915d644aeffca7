//! Twitter Ads 批处理器
//!
//! - 用户查询：每次最多 100 个用户
//! - 统计：按实体类型分组，每次最多 20 个实体
//! - 异步统计：整组共用一个 stats job
//! - 其他类型：next_cursor 翻页

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde_json::{json, Value};

use super::{ADS_API_VERSION, ADS_BASE_URL, API_BASE_URL};
use crate::core::{
    BatchError, BatchRequest, BatchResults, PlatformConnection, PlatformError, PlatformType,
};
use crate::http::{ApiRequest, HttpTransport};
use crate::platforms::common::{distribute_rows, json_or_error, keyed, unique_ids, Throttle};
use crate::platforms::traits::{BatchContext, BatchStrategy, PlatformBatcher};

const MAX_BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL_SECS: u64 = 300;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const STATS_CHUNK_SIZE: usize = 20;
const PAGE_SIZE: u32 = 100;

const USER_FIELDS: &str = "id,name,username,description,profile_image_url,public_metrics,verified";
const STATS_ENTITY_TYPES: &[&str] = &["CAMPAIGN", "LINE_ITEM", "PROMOTED_TWEET"];

const SUPPORTED_REQUEST_TYPES: &[&str] = &[
    "get_accounts",
    "get_campaigns",
    "get_line_items",
    "get_promoted_tweets",
    "get_media_creatives",
    "get_cards",
    "get_targeting_criteria",
    "get_tailored_audiences",
    "get_stats",
    "get_reach_frequency",
    "get_async_stats",
    "get_users",
    "lookup_users",
];

fn iso_now_minus(days: i64) -> String {
    (Utc::now() - ChronoDuration::days(days)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Entity stats endpoint flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsKind {
    Engagement,
    Reach,
}

/// Twitter Ads API batcher
pub struct TwitterBatcher {
    transport: Arc<dyn HttpTransport>,
    throttle: Throttle,
}

impl TwitterBatcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            throttle: Throttle::millis(100, 100),
        }
    }

    pub fn without_throttle(mut self) -> Self {
        self.throttle = Throttle::none();
        self
    }

    fn endpoint(request_type: &str, account_id: &str) -> Option<String> {
        let base = format!("{}/{}/accounts/{}", ADS_BASE_URL, ADS_API_VERSION, account_id);
        let path = match request_type {
            "get_accounts" => return Some(format!("{}/{}/accounts", ADS_BASE_URL, ADS_API_VERSION)),
            "get_campaigns" => "/campaigns",
            "get_line_items" => "/line_items",
            "get_promoted_tweets" => "/promoted_tweets",
            "get_media_creatives" => "/media_creatives",
            "get_cards" => "/cards",
            "get_targeting_criteria" => "/targeting_criteria",
            "get_tailored_audiences" => "/tailored_audiences",
            _ => return None,
        };
        Some(format!("{}{}", base, path))
    }

    fn authorized(request: ApiRequest, ctx: &BatchContext) -> ApiRequest {
        request.bearer(ctx.token()).timeout(REQUEST_TIMEOUT)
    }

    /// Distinct user ids across the group, 100 per lookup; each request gets
    /// the users it asked for
    async fn batch_user_lookup(
        &self,
        ctx: &BatchContext,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_count = requests.len(),
            "[TwitterBatcher] batch user lookup"
        );

        let mut results = BatchResults::new();
        let user_ids = unique_ids(requests.iter().flat_map(|r| r.params().list("user_ids")));
        if user_ids.is_empty() {
            results.fail_all(
                requests.iter().map(|r| r.id.as_str()),
                &BatchError::new("No user IDs provided"),
            );
            return Ok(results);
        }

        let mut users: HashMap<String, Value> = HashMap::new();
        let mut failed: HashMap<String, BatchError> = HashMap::new();
        let chunks: Vec<&[String]> = user_ids.chunks(MAX_BATCH_SIZE).collect();
        let chunk_count = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let request = Self::authorized(ApiRequest::get(format!("{}/users", API_BASE_URL)), ctx)
                .query("ids", chunk.join(","))
                .query("user.fields", USER_FIELDS);
            let outcome = match self.transport.send(request).await {
                Ok(response) => json_or_error(&response, "Twitter"),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(data) => {
                    for user in data.get("data").and_then(Value::as_array).into_iter().flatten() {
                        if let Some(id) = user.get("id").and_then(Value::as_str) {
                            users.insert(id.to_string(), user.clone());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("[TwitterBatcher] user chunk {} failed: {}", index + 1, e);
                    let error = e.to_batch_error();
                    for id in chunk {
                        failed.insert(id.clone(), error.clone());
                    }
                }
            }
            if index + 1 < chunk_count {
                self.throttle.after_chunk().await;
            }
        }

        for request in requests {
            let wanted = request.params().list("user_ids");
            if let Some(error) = wanted.iter().find_map(|id| failed.get(id)) {
                results.failure(request.id.clone(), error.clone());
                continue;
            }
            let matched: Vec<Value> = wanted.iter().filter_map(|id| users.get(id).cloned()).collect();
            results.success(request.id.clone(), json!({ "users": matched }));
        }

        tracing::info!(
            users_fetched = users.len(),
            "[TwitterBatcher] user lookup completed"
        );
        Ok(results)
    }

    /// Stats per entity type in chunks of 20, time window from the first request
    async fn get_entity_stats(
        &self,
        ctx: &BatchContext,
        kind: StatsKind,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_count = requests.len(),
            kind = ?kind,
            "[TwitterBatcher] getting combined stats"
        );

        let entity_type = |request: &BatchRequest| {
            request
                .params()
                .str("entity_type")
                .map(|t| t.to_uppercase())
                .unwrap_or_else(|| "CAMPAIGN".to_string())
        };

        // 实体类型 -> 去重后的实体 id
        let mut entities: IndexMap<String, Vec<String>> = IndexMap::new();
        for request in requests {
            let ty = entity_type(request);
            if kind == StatsKind::Engagement && !STATS_ENTITY_TYPES.contains(&ty.as_str()) {
                continue;
            }
            entities
                .entry(ty)
                .or_default()
                .extend(request.params().list("entity_ids"));
        }

        let first = requests.first().map(BatchRequest::params).unwrap_or_default();
        let start_time = first
            .str("start_time")
            .unwrap_or_else(|| iso_now_minus(7));
        let end_time = first.str("end_time").unwrap_or_else(|| iso_now_minus(0));

        let mut stats: HashMap<(String, String), Value> = HashMap::new();
        let mut failed: HashMap<(String, String), BatchError> = HashMap::new();

        for (ty, ids) in entities {
            let ids = unique_ids(ids);
            for chunk in ids.chunks(STATS_CHUNK_SIZE) {
                let request = match kind {
                    StatsKind::Engagement => ApiRequest::get(format!(
                        "{}/{}/stats/accounts/{}",
                        ADS_BASE_URL,
                        ADS_API_VERSION,
                        ctx.account()
                    ))
                    .query("entity", ty.clone())
                    .query("entity_ids", chunk.join(","))
                    .query("granularity", "DAY")
                    .query("metric_groups", "ENGAGEMENT,BILLING"),
                    StatsKind::Reach => ApiRequest::get(format!(
                        "{}/{}/stats/accounts/{}/reach/campaigns",
                        ADS_BASE_URL,
                        ADS_API_VERSION,
                        ctx.account()
                    ))
                    .query("campaign_ids", chunk.join(",")),
                };
                let request = Self::authorized(request, ctx)
                    .query("start_time", start_time.clone())
                    .query("end_time", end_time.clone());

                let outcome = match self.transport.send(request).await {
                    Ok(response) => json_or_error(&response, "Twitter"),
                    Err(e) => Err(e.into()),
                };
                match outcome {
                    Ok(data) => {
                        for stat in data.get("data").and_then(Value::as_array).into_iter().flatten() {
                            if let Some(id) = stat.get("id").and_then(Value::as_str) {
                                stats.insert((ty.clone(), id.to_string()), stat.clone());
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("[TwitterBatcher] {} stats chunk failed: {}", ty, e);
                        let error = e.to_batch_error();
                        for id in chunk {
                            failed.insert((ty.clone(), id.clone()), error.clone());
                        }
                    }
                }
                self.throttle.after_chunk().await;
            }
        }

        let key = match kind {
            StatsKind::Engagement => "stats",
            StatsKind::Reach => "reach",
        };
        let mut results = BatchResults::new();
        for request in requests {
            let ty = entity_type(request);
            let ids = request.params().list("entity_ids");
            if let Some(error) = ids.iter().find_map(|id| failed.get(&(ty.clone(), id.clone()))) {
                results.failure(request.id.clone(), error.clone());
                continue;
            }
            let matched: Vec<Value> = ids
                .iter()
                .filter_map(|id| stats.get(&(ty.clone(), id.clone())).cloned())
                .collect();
            results.success(request.id.clone(), keyed(key, Value::Array(matched)));
        }

        tracing::info!(
            stats_fetched = stats.len(),
            "[TwitterBatcher] combined stats completed"
        );
        Ok(results)
    }

    /// One async stats job for the whole group
    async fn get_async_stats(
        &self,
        ctx: &BatchContext,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_count = requests.len(),
            "[TwitterBatcher] creating async stats job"
        );

        let first = requests.first().map(BatchRequest::params).unwrap_or_default();
        let body = json!({
            "entity": first.str("entity_type").unwrap_or_else(|| "CAMPAIGN".to_string()),
            "entity_ids": first.list("entity_ids").join(","),
            "start_time": first.str("start_time").unwrap_or_else(|| iso_now_minus(30)),
            "end_time": first.str("end_time").unwrap_or_else(|| iso_now_minus(0)),
            "granularity": first.str("granularity").unwrap_or_else(|| "DAY".to_string()),
            "metric_groups": first.str("metric_groups").unwrap_or_else(|| "ENGAGEMENT,BILLING,VIDEO".to_string()),
            "placement": first.str("placement").unwrap_or_else(|| "ALL_ON_TWITTER".to_string()),
        });
        let url = format!(
            "{}/{}/stats/jobs/accounts/{}",
            ADS_BASE_URL,
            ADS_API_VERSION,
            ctx.account()
        );
        let response = self
            .transport
            .send(Self::authorized(ApiRequest::post(url), ctx).json(&body))
            .await?;
        let data = json_or_error(&response, "Twitter")?;
        let job = data
            .get("data")
            .filter(|j| j.is_object())
            .ok_or_else(|| PlatformError::remote("Failed to create async job", response.status, None))?;

        let job_id = job
            .get("id_str")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| job.get("id").map(|id| id.to_string().trim_matches('"').to_string()))
            .unwrap_or_default();
        let payload = json!({
            "job_id": job_id,
            "status": job.get("status").cloned().unwrap_or_else(|| json!("pending")),
            "url": job.get("url").cloned().unwrap_or(Value::Null),
        });

        let mut results = BatchResults::new();
        for request in requests {
            results.success(request.id.clone(), payload.clone());
        }
        tracing::info!(job_id = %job_id, "[TwitterBatcher] async stats job created");
        Ok(results)
    }

    /// `next_cursor` pagination; every request receives the full list
    async fn execute_standard_request(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        let url = Self::endpoint(request_type, ctx.account())
            .ok_or_else(|| PlatformError::UnsupportedRequest(request_type.to_string()))?;

        tracing::info!(
            request_type = %request_type,
            request_count = requests.len(),
            "[TwitterBatcher] executing standard request"
        );

        let mut rows: Vec<Value> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut request = Self::authorized(ApiRequest::get(url.clone()), ctx)
                .query("count", PAGE_SIZE.to_string());
            if let Some(cursor) = &cursor {
                request = request.query("cursor", cursor.clone());
            }
            let response = self.transport.send(request).await?;
            let data = json_or_error(&response, "Twitter")?;
            if let Some(items) = data.get("data").and_then(Value::as_array) {
                rows.extend(items.iter().cloned());
            }
            cursor = data
                .get("next_cursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
            self.throttle.after_page().await;
        }

        tracing::info!(
            request_type = %request_type,
            results_count = rows.len(),
            "[TwitterBatcher] standard request completed"
        );
        Ok(distribute_rows(requests, request_type, &rows))
    }
}

#[async_trait::async_trait]
impl PlatformBatcher for TwitterBatcher {
    fn platform(&self) -> PlatformType {
        PlatformType::Twitter
    }

    fn supported_request_types(&self) -> &'static [&'static str] {
        SUPPORTED_REQUEST_TYPES
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }

    fn flush_interval(&self) -> Duration {
        Duration::from_secs(FLUSH_INTERVAL_SECS)
    }

    fn batch_strategy(&self) -> BatchStrategy {
        BatchStrategy::BulkEndpoint
    }

    fn prepare(&self, connection: PlatformConnection) -> Result<BatchContext, PlatformError> {
        if connection.account().is_none() {
            return Err(PlatformError::Connection(
                "Missing Twitter Ads account ID".to_string(),
            ));
        }
        Ok(BatchContext::new(connection))
    }

    async fn execute_by_type(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        match request_type {
            "get_users" | "lookup_users" => self.batch_user_lookup(ctx, requests).await,
            "get_stats" => {
                self.get_entity_stats(ctx, StatsKind::Engagement, requests)
                    .await
            }
            "get_reach_frequency" => self.get_entity_stats(ctx, StatsKind::Reach, requests).await,
            "get_async_stats" => self.get_async_stats(ctx, requests).await,
            _ => {
                self.execute_standard_request(ctx, request_type, requests)
                    .await
            }
        }
    }
}
