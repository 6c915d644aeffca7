//! TikTok 批处理器
//!
//! - 广告主信息：每次最多 100 个 advertiser_id
//! - 转化事件：每次最多 2000 条
//! - 其他类型：按 page / total_page 翻页，所有同类请求共享结果

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use super::{ads_envelope, ADS_API_VERSION, ADS_BASE_URL};
use crate::core::{
    BatchError, BatchRequest, BatchResults, PlatformConnection, PlatformError, PlatformType,
};
use crate::http::{ApiRequest, HttpTransport};
use crate::platforms::common::{distribute_rows, unique_ids, Throttle};
use crate::platforms::traits::{BatchContext, BatchStrategy, PlatformBatcher};

const MAX_BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL_SECS: u64 = 600;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const BULK_EVENTS_LIMIT: usize = 2000;
const PAGE_SIZE: u32 = 100;

const SUPPORTED_REQUEST_TYPES: &[&str] = &[
    "get_advertisers",
    "get_advertiser_info",
    "get_campaigns",
    "get_ad_groups",
    "get_ads",
    "get_campaign_metrics",
    "get_ad_group_metrics",
    "get_ad_metrics",
    "get_creatives",
    "get_images",
    "get_videos",
    "get_audiences",
    "get_custom_audiences",
    "upload_conversions",
];

fn endpoint(request_type: &str) -> Option<&'static str> {
    match request_type {
        "get_advertisers" | "get_advertiser_info" => Some("/advertiser/info/"),
        "get_campaigns" => Some("/campaign/get/"),
        "get_ad_groups" => Some("/adgroup/get/"),
        "get_ads" => Some("/ad/get/"),
        "get_campaign_metrics" | "get_ad_group_metrics" | "get_ad_metrics" => {
            Some("/report/integrated/get/")
        }
        "get_creatives" => Some("/creative/get/"),
        "get_images" => Some("/file/image/get/"),
        "get_videos" => Some("/file/video/get/"),
        "get_audiences" => Some("/audience/list/"),
        "get_custom_audiences" => Some("/custom_audience/list/"),
        "upload_conversions" => Some("/pixel/batch/"),
        _ => None,
    }
}

fn data_level(request_type: &str) -> &'static str {
    match request_type {
        "get_ad_group_metrics" => "AUCTION_ADGROUP",
        "get_ad_metrics" => "AUCTION_AD",
        _ => "AUCTION_CAMPAIGN",
    }
}

/// TikTok Marketing API batcher
pub struct TikTokBatcher {
    transport: Arc<dyn HttpTransport>,
    throttle: Throttle,
    event_throttle: Throttle,
}

impl TikTokBatcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            throttle: Throttle::millis(100, 100),
            event_throttle: Throttle::millis(200, 200),
        }
    }

    pub fn without_throttle(mut self) -> Self {
        self.throttle = Throttle::none();
        self.event_throttle = Throttle::none();
        self
    }

    fn url(path: &str) -> String {
        format!("{}/{}{}", ADS_BASE_URL, ADS_API_VERSION, path)
    }

    fn authorized(request: ApiRequest, ctx: &BatchContext) -> ApiRequest {
        request
            .header("Access-Token", ctx.token())
            .timeout(REQUEST_TIMEOUT)
    }

    /// Bulk advertiser info, chunked at the bulk limit and keyed back by advertiser id
    async fn get_bulk_advertiser_info(
        &self,
        ctx: &BatchContext,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_count = requests.len(),
            "[TikTokBatcher] getting bulk advertiser info"
        );

        let mut results = BatchResults::new();
        let advertiser_ids = unique_ids(requests.iter().filter_map(|r| r.params().str("advertiser_id")));
        if advertiser_ids.is_empty() {
            results.fail_all(
                requests.iter().map(|r| r.id.as_str()),
                &BatchError::new("No advertiser IDs provided"),
            );
            return Ok(results);
        }

        let mut found: HashMap<String, Value> = HashMap::new();
        let mut failed: HashMap<String, BatchError> = HashMap::new();
        let chunks: Vec<&[String]> = advertiser_ids.chunks(MAX_BATCH_SIZE).collect();
        let chunk_count = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let request = Self::authorized(ApiRequest::get(Self::url("/advertiser/info/")), ctx)
                .query("advertiser_ids", serde_json::to_string(chunk)?);

            let outcome = match self.transport.send(request).await {
                Ok(response) => ads_envelope(&response),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(data) => {
                    for advertiser in data
                        .get("list")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten()
                    {
                        if let Some(id) = advertiser.get("advertiser_id").and_then(id_string) {
                            found.insert(id, advertiser.clone());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("[TikTokBatcher] advertiser chunk {} failed: {}", index + 1, e);
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
            let id = request.params().str("advertiser_id");
            match id {
                Some(id) if found.contains_key(&id) => {
                    results.success(request.id.clone(), json!({ "advertiser": found[&id] }));
                }
                Some(id) if failed.contains_key(&id) => {
                    results.failure(request.id.clone(), failed[&id].clone());
                }
                _ => {
                    results.failure(request.id.clone(), BatchError::new("Advertiser not found"));
                }
            }
        }

        tracing::info!(
            advertisers_fetched = found.len(),
            "[TikTokBatcher] bulk advertiser info completed"
        );
        Ok(results)
    }

    /// Flatten every request's events, upload in chunks of 2000 and report
    /// per-request uploaded / failed counts
    async fn upload_bulk_conversions(
        &self,
        ctx: &BatchContext,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_count = requests.len(),
            "[TikTokBatcher] uploading bulk conversions"
        );

        let mut results = BatchResults::new();
        let mut events: Vec<(usize, Value)> = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            let request_events = request
                .params()
                .get("events")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if request_events.is_empty() {
                results.failure(request.id.clone(), BatchError::new("No events provided"));
            }
            events.extend(request_events.into_iter().map(|e| (index, e)));
        }
        if events.is_empty() {
            return Ok(results);
        }

        let mut uploaded = vec![0usize; requests.len()];
        let mut failed = vec![0usize; requests.len()];
        let mut last_error: Vec<Option<BatchError>> = vec![None; requests.len()];
        let chunks: Vec<_> = events.chunks(BULK_EVENTS_LIMIT).collect();
        let chunk_count = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let batch: Vec<&Value> = chunk.iter().map(|(_, e)| e).collect();
            let request = Self::authorized(ApiRequest::post(Self::url("/pixel/batch/")), ctx)
                .json(&json!({ "advertiser_id": ctx.account(), "batch": batch }));

            let outcome = match self.transport.send(request).await {
                Ok(response) => ads_envelope(&response),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(_) => chunk.iter().for_each(|(owner, _)| uploaded[*owner] += 1),
                Err(e) => {
                    tracing::warn!("[TikTokBatcher] event chunk {} failed: {}", index + 1, e);
                    let error = e.to_batch_error();
                    for (owner, _) in chunk {
                        failed[*owner] += 1;
                        last_error[*owner] = Some(error.clone());
                    }
                }
            }

            if index + 1 < chunk_count {
                self.event_throttle.after_chunk().await;
            }
        }

        for (index, request) in requests.iter().enumerate() {
            if results.contains(&request.id) {
                continue;
            }
            let mut payload = json!({
                "success": failed[index] == 0,
                "events_uploaded": uploaded[index],
                "events_failed": failed[index],
            });
            if let Some(error) = &last_error[index] {
                payload["error"] = json!(error.error);
            }
            results.success(request.id.clone(), payload);
        }

        tracing::info!(
            uploaded = uploaded.iter().sum::<usize>(),
            failed = failed.iter().sum::<usize>(),
            "[TikTokBatcher] bulk conversions completed"
        );
        Ok(results)
    }

    /// Page through a list/report endpoint until `page_info.total_page` is reached
    async fn execute_standard_request(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        let path = endpoint(request_type)
            .ok_or_else(|| PlatformError::UnsupportedRequest(request_type.to_string()))?;

        tracing::info!(
            request_type = %request_type,
            request_count = requests.len(),
            "[TikTokBatcher] executing paginated request"
        );

        let first = requests.first().map(BatchRequest::params).unwrap_or_default();
        let mut base: Vec<(String, String)> = vec![
            ("advertiser_id".into(), ctx.account().to_string()),
            ("page_size".into(), PAGE_SIZE.to_string()),
        ];
        if request_type.contains("metrics") {
            let (start, end) = first.date_range().unwrap_or_else(|| {
                let today = Utc::now().date_naive();
                (
                    (today - ChronoDuration::days(30)).format("%Y-%m-%d").to_string(),
                    today.format("%Y-%m-%d").to_string(),
                )
            });
            base.push(("report_type".into(), "BASIC".into()));
            base.push(("service_type".into(), "AUCTION".into()));
            base.push(("data_level".into(), data_level(request_type).into()));
            base.push(("dimensions".into(), json!(["stat_time_day"]).to_string()));
            base.push((
                "metrics".into(),
                json!([
                    "spend",
                    "impressions",
                    "clicks",
                    "ctr",
                    "conversion",
                    "cost_per_conversion",
                    "conversion_rate"
                ])
                .to_string(),
            ));
            base.push(("start_date".into(), start));
            base.push(("end_date".into(), end));
        }

        let mut rows: Vec<Value> = Vec::new();
        let mut page: u64 = 1;
        loop {
            let mut request = Self::authorized(ApiRequest::get(Self::url(path)), ctx);
            for (k, v) in &base {
                request = request.query(k.clone(), v.clone());
            }
            request = request.query("page", page.to_string());

            let response = self.transport.send(request).await?;
            let data = ads_envelope(&response)?;
            if let Some(list) = data.get("list").and_then(Value::as_array) {
                rows.extend(list.iter().cloned());
            }
            let total_page = data
                .get("page_info")
                .and_then(|p| p.get("total_page"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            if page >= total_page {
                break;
            }
            page += 1;
            self.throttle.after_page().await;
        }

        tracing::info!(
            request_type = %request_type,
            results_count = rows.len(),
            "[TikTokBatcher] paginated request completed"
        );
        Ok(distribute_rows(requests, request_type, &rows))
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait::async_trait]
impl PlatformBatcher for TikTokBatcher {
    fn platform(&self) -> PlatformType {
        PlatformType::TikTok
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
                "Missing TikTok advertiser ID".to_string(),
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
            "get_advertisers" | "get_advertiser_info" => {
                self.get_bulk_advertiser_info(ctx, requests).await
            }
            "upload_conversions" => self.upload_bulk_conversions(ctx, requests).await,
            _ => self.execute_standard_request(ctx, request_type, requests).await,
        }
    }
}
