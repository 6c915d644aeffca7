//! Google Ads 批处理器
//!
//! 读请求：每个请求类型一条 GAQL，通过 searchStream 一次取回全部数据，再按请求过滤。
//! 写请求：`update_*` 合并为 `<resource>:mutate`，每批最多 5000 个 operation。

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use super::{ADS_API_VERSION, ADS_BASE_URL};
use crate::config::GoogleAdsSettings;
use crate::core::{
    BatchError, BatchRequest, BatchResults, PlatformConnection, PlatformError, PlatformType,
};
use crate::http::{ApiRequest, HttpTransport};
use crate::platforms::common::{distribute_rows, json_or_error, Throttle};
use crate::platforms::traits::{BatchContext, BatchStrategy, PlatformBatcher};

const MAX_BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL_SECS: u64 = 600;
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);
const MUTATE_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_MUTATE_OPERATIONS: usize = 5000;

const SUPPORTED_REQUEST_TYPES: &[&str] = &[
    "get_account",
    "get_campaigns",
    "get_ad_groups",
    "get_ads",
    "get_keywords",
    "get_campaign_metrics",
    "get_ad_group_metrics",
    "get_keyword_metrics",
    "get_assets",
    "get_extensions",
    "get_audiences",
    "get_user_lists",
    "get_conversion_actions",
    "get_conversions",
    "update_campaigns",
    "update_ad_groups",
    "update_keywords",
    "update_ads",
];

static DURING_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"segments\.date DURING LAST_\d+_DAYS").expect("valid regex"));

fn query_template(request_type: &str) -> Option<&'static str> {
    let query = match request_type {
        "get_account" => {
            "SELECT customer.id, customer.descriptive_name, customer.currency_code, \
             customer.time_zone, customer.test_account \
             FROM customer"
        }
        "get_campaigns" => {
            "SELECT campaign.id, campaign.name, campaign.status, \
             campaign.advertising_channel_type, campaign.bidding_strategy_type, \
             campaign.campaign_budget, campaign.start_date, campaign.end_date, \
             metrics.impressions, metrics.clicks, metrics.cost_micros, metrics.conversions \
             FROM campaign \
             WHERE campaign.status != 'REMOVED' \
             ORDER BY campaign.id DESC"
        }
        "get_ad_groups" => {
            "SELECT ad_group.id, ad_group.name, ad_group.status, ad_group.type, \
             ad_group.campaign, ad_group.cpc_bid_micros, \
             metrics.impressions, metrics.clicks, metrics.cost_micros \
             FROM ad_group \
             WHERE ad_group.status != 'REMOVED' \
             ORDER BY ad_group.id DESC"
        }
        "get_ads" => {
            "SELECT ad_group_ad.ad.id, ad_group_ad.ad.type, ad_group_ad.ad.final_urls, \
             ad_group_ad.ad.responsive_search_ad.headlines, \
             ad_group_ad.ad.responsive_search_ad.descriptions, \
             ad_group_ad.status, ad_group_ad.ad_group, \
             metrics.impressions, metrics.clicks, metrics.cost_micros \
             FROM ad_group_ad \
             WHERE ad_group_ad.status != 'REMOVED'"
        }
        "get_keywords" => {
            "SELECT ad_group_criterion.criterion_id, ad_group_criterion.keyword.text, \
             ad_group_criterion.keyword.match_type, ad_group_criterion.status, \
             ad_group_criterion.cpc_bid_micros, ad_group_criterion.ad_group, \
             metrics.impressions, metrics.clicks, metrics.cost_micros, metrics.conversions \
             FROM ad_group_criterion \
             WHERE ad_group_criterion.type = 'KEYWORD' \
             AND ad_group_criterion.status != 'REMOVED'"
        }
        "get_campaign_metrics" => {
            "SELECT campaign.id, campaign.name, segments.date, \
             metrics.impressions, metrics.clicks, metrics.cost_micros, \
             metrics.conversions, metrics.conversions_value, metrics.ctr, \
             metrics.average_cpc, metrics.average_cpm \
             FROM campaign \
             WHERE segments.date DURING LAST_30_DAYS \
             AND campaign.status != 'REMOVED' \
             ORDER BY segments.date DESC"
        }
        "get_ad_group_metrics" => {
            "SELECT ad_group.id, ad_group.name, ad_group.campaign, segments.date, \
             metrics.impressions, metrics.clicks, metrics.cost_micros, \
             metrics.conversions, metrics.ctr, metrics.average_cpc \
             FROM ad_group \
             WHERE segments.date DURING LAST_30_DAYS \
             AND ad_group.status != 'REMOVED' \
             ORDER BY segments.date DESC"
        }
        "get_keyword_metrics" => {
            "SELECT ad_group_criterion.criterion_id, ad_group_criterion.keyword.text, \
             ad_group_criterion.ad_group, segments.date, \
             metrics.impressions, metrics.clicks, metrics.cost_micros, \
             metrics.conversions, metrics.ctr, metrics.average_cpc \
             FROM keyword_view \
             WHERE segments.date DURING LAST_30_DAYS \
             ORDER BY segments.date DESC"
        }
        "get_assets" => {
            "SELECT asset.id, asset.name, asset.type, asset.final_urls, \
             asset.image_asset.full_size.url, asset.youtube_video_asset.youtube_video_id, \
             asset.text_asset.text \
             FROM asset"
        }
        "get_extensions" => {
            "SELECT campaign_asset.campaign, campaign_asset.asset, campaign_asset.field_type, \
             campaign_asset.status, asset.id, asset.name, asset.type, \
             asset.sitelink_asset.link_text, asset.callout_asset.callout_text \
             FROM campaign_asset \
             WHERE campaign_asset.status != 'REMOVED'"
        }
        "get_audiences" => {
            "SELECT user_list.id, user_list.name, user_list.type, \
             user_list.size_for_display, user_list.size_for_search, \
             user_list.membership_status \
             FROM user_list \
             WHERE user_list.membership_status != 'CLOSED'"
        }
        "get_user_lists" => {
            "SELECT user_list.id, user_list.name, user_list.description, user_list.type, \
             user_list.membership_life_span, user_list.size_for_display, \
             user_list.size_for_search, user_list.eligible_for_search \
             FROM user_list"
        }
        "get_conversion_actions" => {
            "SELECT conversion_action.id, conversion_action.name, \
             conversion_action.category, conversion_action.type, \
             conversion_action.status, metrics.all_conversions, \
             metrics.all_conversions_value \
             FROM conversion_action \
             WHERE conversion_action.status = 'ENABLED'"
        }
        "get_conversions" => {
            "SELECT campaign.id, campaign.name, segments.date, \
             segments.conversion_action_name, metrics.conversions, \
             metrics.conversions_value, metrics.all_conversions \
             FROM campaign \
             WHERE segments.date DURING LAST_30_DAYS \
             ORDER BY segments.date DESC"
        }
        _ => return None,
    };
    Some(query)
}

fn mutate_resource(request_type: &str) -> Option<&'static str> {
    match request_type {
        "update_campaigns" => Some("campaigns"),
        "update_ad_groups" => Some("adGroups"),
        "update_keywords" => Some("adGroupCriteria"),
        "update_ads" => Some("adGroupAds"),
        _ => None,
    }
}

fn valid_date(value: &str) -> bool {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

/// Build the GAQL for a group, using date range and limit from its first request
pub fn build_query(request_type: &str, requests: &[BatchRequest]) -> Result<String, PlatformError> {
    let template = query_template(request_type)
        .ok_or_else(|| PlatformError::UnsupportedRequest(request_type.to_string()))?;
    let params = requests.first().map(BatchRequest::params).unwrap_or_default();

    let mut query = template.to_string();
    if let (Some(start), Some(end)) = (params.str("start_date"), params.str("end_date")) {
        if !valid_date(&start) || !valid_date(&end) {
            return Err(PlatformError::Validation(format!(
                "Invalid date range {} .. {} (expected YYYY-MM-DD)",
                start, end
            )));
        }
        let clause = format!("segments.date BETWEEN '{}' AND '{}'", start, end);
        query = DURING_CLAUSE.replace(&query, clause.as_str()).into_owned();
    }
    if let Some(limit) = params.u64("limit") {
        query = format!("{} LIMIT {}", query, limit);
    }
    Ok(query)
}

/// Flatten a searchStream body: an array of result batches, or a single object
pub fn parse_stream_response(body: &Value) -> Vec<Value> {
    if let Some(rows) = body.get("results").and_then(Value::as_array) {
        return rows.clone();
    }
    body.as_array()
        .map(|batches| {
            batches
                .iter()
                .filter_map(|b| b.get("results").and_then(Value::as_array))
                .flatten()
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Google Ads batcher
pub struct GoogleBatcher {
    transport: Arc<dyn HttpTransport>,
    settings: GoogleAdsSettings,
    throttle: Throttle,
}

impl GoogleBatcher {
    pub fn new(transport: Arc<dyn HttpTransport>, settings: GoogleAdsSettings) -> Self {
        Self {
            transport,
            settings,
            throttle: Throttle::millis(100, 100),
        }
    }

    pub fn without_throttle(mut self) -> Self {
        self.throttle = Throttle::none();
        self
    }

    fn customer_url(&self, customer_id: &str, suffix: &str) -> String {
        format!(
            "{}/{}/customers/{}/{}",
            ADS_BASE_URL, ADS_API_VERSION, customer_id, suffix
        )
    }

    fn authorized(&self, request: ApiRequest, ctx: &BatchContext) -> ApiRequest {
        let mut request = request.bearer(ctx.token());
        if let Some(token) = self.settings.developer_token.as_deref() {
            request = request.header("developer-token", token);
        }
        let login = self
            .settings
            .login_customer_id
            .as_deref()
            .map(|id| id.replace('-', ""))
            .unwrap_or_else(|| ctx.account().to_string());
        request.header("login-customer-id", login)
    }

    async fn execute_search_stream(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_type = %request_type,
            request_count = requests.len(),
            "[GoogleBatcher] using searchStream"
        );

        let query = build_query(request_type, requests)?;
        let url = self.customer_url(ctx.account(), "googleAds:searchStream");
        let request = self
            .authorized(ApiRequest::post(url), ctx)
            .json(&json!({ "query": query }))
            .timeout(STREAM_TIMEOUT);

        let response = self.transport.send(request).await?;
        let body = json_or_error(&response, "Google Ads")?;
        let rows = parse_stream_response(&body);

        tracing::info!(
            request_type = %request_type,
            results_count = rows.len(),
            "[GoogleBatcher] searchStream completed"
        );

        Ok(distribute_rows(requests, request_type, &rows))
    }

    async fn execute_batch_mutate(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        let resource = mutate_resource(request_type)
            .ok_or_else(|| PlatformError::UnsupportedRequest(request_type.to_string()))?;

        tracing::info!(
            request_type = %request_type,
            request_count = requests.len(),
            "[GoogleBatcher] using batch mutate"
        );

        let mut results = BatchResults::new();
        let mut operations: Vec<(String, Value)> = Vec::new();
        for request in requests {
            match request.params().get("operation") {
                Some(op) if !op.is_null() => operations.push((request.id.clone(), op.clone())),
                _ => {
                    results.failure(request.id.clone(), BatchError::new("No operation provided"));
                }
            }
        }
        if operations.is_empty() {
            return Ok(results);
        }

        let url = self.customer_url(ctx.account(), &format!("{}:mutate", resource));
        let chunks: Vec<_> = operations.chunks(MAX_MUTATE_OPERATIONS).collect();
        let chunk_count = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let ops: Vec<&Value> = chunk.iter().map(|(_, op)| op).collect();
            let request = self
                .authorized(ApiRequest::post(url.clone()), ctx)
                .json(&json!({ "operations": ops }))
                .timeout(MUTATE_TIMEOUT);

            let outcome = match self.transport.send(request).await {
                Ok(response) => json_or_error(&response, "Google Ads"),
                Err(e) => Err(e.into()),
            };

            match outcome {
                Ok(body) => {
                    let mutate_results = body
                        .get("results")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    for (position, (request_id, _)) in chunk.iter().enumerate() {
                        match mutate_results.get(position) {
                            Some(result) => {
                                results.success(
                                    request_id.clone(),
                                    json!({
                                        "success": true,
                                        "resource_name": result.get("resourceName").cloned().unwrap_or(Value::Null),
                                    }),
                                );
                            }
                            None => {
                                results.failure(
                                    request_id.clone(),
                                    BatchError::new("No result for operation"),
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        request_type = %request_type,
                        "[GoogleBatcher] mutate chunk {} failed: {}",
                        index + 1,
                        e
                    );
                    let error = e.to_batch_error();
                    results.fail_all(chunk.iter().map(|(id, _)| id.as_str()), &error);
                }
            }

            if index + 1 < chunk_count {
                self.throttle.after_chunk().await;
            }
        }

        Ok(results)
    }
}

#[async_trait::async_trait]
impl PlatformBatcher for GoogleBatcher {
    fn platform(&self) -> PlatformType {
        PlatformType::Google
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
        BatchStrategy::SearchStream
    }

    fn prepare(&self, connection: PlatformConnection) -> Result<BatchContext, PlatformError> {
        let customer_id = connection
            .account()
            .map(|id| id.replace('-', ""))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PlatformError::Connection("Missing Google Ads customer ID".to_string()))?;
        if self.settings.developer_token.is_none() {
            tracing::warn!("[GoogleBatcher] developer token is not configured");
        }
        let mut ctx = BatchContext::new(connection);
        ctx.account_id = Some(customer_id);
        Ok(ctx)
    }

    async fn execute_by_type(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        if request_type.starts_with("update_") {
            self.execute_batch_mutate(ctx, request_type, requests).await
        } else {
            self.execute_search_stream(ctx, request_type, requests).await
        }
    }
}
