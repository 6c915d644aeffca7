//! LinkedIn 批处理器
//!
//! - 分析类请求：一次 pivot=CAMPAIGN 查询，所有请求共享结果
//! - 线索：按 form_id 去重后逐个表单翻页
//! - 其他类型：start / count 翻页直到 paging.total

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::{json, Value};

use super::{restli, BASE_URL};
use crate::core::{BatchError, BatchRequest, BatchResults, PlatformError, PlatformType};
use crate::http::{ApiRequest, HttpTransport};
use crate::platforms::common::{distribute_rows, json_or_error, unique_ids, Throttle};
use crate::platforms::traits::{BatchContext, BatchStrategy, PlatformBatcher};

const MAX_BATCH_SIZE: usize = 50;
// 每日配额很低，刷新间隔保守
const FLUSH_INTERVAL_SECS: u64 = 1800;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const PAGE_SIZE: u64 = 100;

const ANALYTICS_FIELDS: &str = "impressions,clicks,costInLocalCurrency,conversions,\
externalWebsiteConversions,leadGenerationMailContactInfoShares";

const SUPPORTED_REQUEST_TYPES: &[&str] = &[
    "get_ad_accounts",
    "get_campaigns",
    "get_campaign_groups",
    "get_creatives",
    "get_analytics",
    "get_campaign_analytics",
    "get_audiences",
    "get_targeting_facets",
    "get_conversions",
    "get_lead_gen_forms",
    "get_leads",
];

fn endpoint(request_type: &str) -> Option<&'static str> {
    match request_type {
        "get_ad_accounts" => Some("/adAccounts"),
        "get_campaigns" => Some("/adCampaigns"),
        "get_campaign_groups" => Some("/adCampaignGroups"),
        "get_creatives" => Some("/creatives"),
        "get_analytics" | "get_campaign_analytics" => Some("/adAnalytics"),
        "get_audiences" => Some("/dmpSegments"),
        "get_targeting_facets" => Some("/adTargetingFacets"),
        "get_conversions" => Some("/conversions"),
        "get_lead_gen_forms" => Some("/leadForms"),
        "get_leads" => Some("/leadFormResponses"),
        _ => None,
    }
}

fn sponsored_account(account_id: &str) -> String {
    format!("urn:li:sponsoredAccount:{}", account_id)
}

fn parse_day(value: &str) -> Result<NaiveDate, PlatformError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        PlatformError::Validation(format!("Invalid date {:?}, expected YYYY-MM-DD", value))
    })
}

/// Rest.li `dateRange` literal
pub fn restli_date_range(start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "(start:(day:{},month:{},year:{}),end:(day:{},month:{},year:{}))",
        start.day(),
        start.month(),
        start.year(),
        end.day(),
        end.month(),
        end.year()
    )
}

/// LinkedIn Marketing API batcher
pub struct LinkedInBatcher {
    transport: Arc<dyn HttpTransport>,
    throttle: Throttle,
}

impl LinkedInBatcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            throttle: Throttle::millis(200, 100),
        }
    }

    pub fn without_throttle(mut self) -> Self {
        self.throttle = Throttle::none();
        self
    }

    fn get(path: &str, ctx: &BatchContext) -> ApiRequest {
        restli(ApiRequest::get(format!("{}{}", BASE_URL, path)), ctx.token()).timeout(REQUEST_TIMEOUT)
    }

    /// One analytics query for the whole group, dated from the first request
    async fn get_analytics_with_pivot(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_type = %request_type,
            request_count = requests.len(),
            "[LinkedInBatcher] getting analytics with pivot"
        );

        let first = requests.first().map(BatchRequest::params).unwrap_or_default();
        let today = Utc::now().date_naive();
        let start = match first.str("start_date") {
            Some(s) => parse_day(&s)?,
            None => today - ChronoDuration::days(30),
        };
        let end = match first.str("end_date") {
            Some(s) => parse_day(&s)?,
            None => today,
        };

        let mut request = Self::get("/adAnalytics", ctx)
            .query("q", "analytics")
            .query("pivot", "CAMPAIGN")
            .query("dateRange", restli_date_range(start, end))
            .query("timeGranularity", "DAILY")
            .query("fields", ANALYTICS_FIELDS);
        if let Some(account) = ctx.account_id.as_deref() {
            request = request.query("accounts", sponsored_account(account));
        }

        let response = self.transport.send(request).await?;
        let data = json_or_error(&response, "LinkedIn")?;
        let elements = data
            .get("elements")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        tracing::info!(
            elements_count = elements.len(),
            "[LinkedInBatcher] analytics completed"
        );
        Ok(distribute_rows(requests, "analytics", &elements))
    }

    async fn fetch_form_leads(
        &self,
        ctx: &BatchContext,
        form_id: &str,
    ) -> Result<Vec<Value>, PlatformError> {
        let mut leads = Vec::new();
        let mut start: u64 = 0;
        loop {
            let request = Self::get("/leadFormResponses", ctx)
                .query("q", "form")
                .query("form", format!("urn:li:leadGenForm:{}", form_id))
                .query("start", start.to_string())
                .query("count", PAGE_SIZE.to_string());
            let response = self.transport.send(request).await?;
            let data = json_or_error(&response, "LinkedIn")?;
            let elements = data
                .get("elements")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let page_len = elements.len() as u64;
            leads.extend(elements);

            // 满页才可能还有下一页
            if page_len < PAGE_SIZE {
                break;
            }
            start += page_len;
            self.throttle.after_page().await;
        }
        Ok(leads)
    }

    /// Leads per distinct form; each request receives the leads of its own form
    async fn get_batch_leads(
        &self,
        ctx: &BatchContext,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_count = requests.len(),
            "[LinkedInBatcher] getting batch leads"
        );

        let mut results = BatchResults::new();
        let form_ids = unique_ids(requests.iter().filter_map(|r| r.params().str("form_id")));
        if form_ids.is_empty() {
            results.fail_all(
                requests.iter().map(|r| r.id.as_str()),
                &BatchError::new("No form IDs provided"),
            );
            return Ok(results);
        }

        let mut by_form: HashMap<String, Result<Vec<Value>, BatchError>> = HashMap::new();
        for (index, form_id) in form_ids.iter().enumerate() {
            let outcome = self
                .fetch_form_leads(ctx, form_id)
                .await
                .map_err(|e| {
                    tracing::warn!("[LinkedInBatcher] leads for form {} failed: {}", form_id, e);
                    e.to_batch_error()
                });
            by_form.insert(form_id.clone(), outcome);
            if index + 1 < form_ids.len() {
                self.throttle.after_chunk().await;
            }
        }

        for request in requests {
            let outcome = request
                .params()
                .str("form_id")
                .and_then(|form_id| by_form.get(&form_id));
            match outcome {
                Some(Ok(leads)) => {
                    results.success(request.id.clone(), json!({ "leads": leads }));
                }
                Some(Err(error)) => {
                    results.failure(request.id.clone(), error.clone());
                }
                None => {
                    results.success(request.id.clone(), json!({ "leads": [] }));
                }
            }
        }

        tracing::info!(
            forms_processed = by_form.len(),
            "[LinkedInBatcher] batch leads completed"
        );
        Ok(results)
    }

    /// start / count pagination until `paging.total` is reached
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
            "[LinkedInBatcher] executing standard request"
        );

        let mut rows: Vec<Value> = Vec::new();
        let mut start: u64 = 0;
        loop {
            let mut request = Self::get(path, ctx)
                .query("q", "search")
                .query("start", start.to_string())
                .query("count", PAGE_SIZE.to_string());
            if let Some(account) = ctx.account_id.as_deref() {
                request = request.query("account", sponsored_account(account));
            }

            let response = self.transport.send(request).await?;
            let data = json_or_error(&response, "LinkedIn")?;
            let elements = data
                .get("elements")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let page_len = elements.len() as u64;
            rows.extend(elements);

            let total = data
                .get("paging")
                .and_then(|p| p.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or(start + page_len);
            start += PAGE_SIZE;
            if page_len == 0 || start >= total {
                break;
            }
            self.throttle.after_page().await;
        }

        tracing::info!(
            request_type = %request_type,
            results_count = rows.len(),
            "[LinkedInBatcher] standard request completed"
        );
        Ok(distribute_rows(requests, request_type, &rows))
    }
}

#[async_trait::async_trait]
impl PlatformBatcher for LinkedInBatcher {
    fn platform(&self) -> PlatformType {
        PlatformType::LinkedIn
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
        BatchStrategy::Pagination
    }

    async fn execute_by_type(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        match request_type {
            "get_analytics" | "get_campaign_analytics" => {
                self.get_analytics_with_pivot(ctx, request_type, requests)
                    .await
            }
            "get_leads" => self.get_batch_leads(ctx, requests).await,
            _ => {
                self.execute_standard_request(ctx, request_type, requests)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectionStatus, PlatformConnection};
    use crate::http::{ApiResponse, ScriptedTransport};
    use serde_json::Map;

    fn connection() -> PlatformConnection {
        PlatformConnection {
            id: "li".into(),
            org_id: "org".into(),
            platform: PlatformType::LinkedIn,
            access_token: Some("tok".into()),
            account_id: Some("5005".into()),
            credentials: Map::new(),
            status: ConnectionStatus::Active,
        }
    }

    fn batcher(transport: Arc<ScriptedTransport>) -> LinkedInBatcher {
        LinkedInBatcher::new(transport).without_throttle()
    }

    #[test]
    fn test_restli_date_range_literal() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            restli_date_range(start, end),
            "(start:(day:5,month:1,year:2024),end:(day:29,month:2,year:2024))"
        );
    }

    #[tokio::test]
    async fn test_analytics_single_call_shared_by_group() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            assert_eq!(req.header_value("LinkedIn-Version"), Some("202312"));
            assert_eq!(req.query_value("pivot"), Some("CAMPAIGN"));
            assert_eq!(
                req.query_value("dateRange"),
                Some("(start:(day:1,month:3,year:2024),end:(day:31,month:3,year:2024))")
            );
            assert_eq!(req.query_value("accounts"), Some("urn:li:sponsoredAccount:5005"));
            Ok(ApiResponse::json_body(
                200,
                &json!({"elements": [{"impressions": 10}, {"impressions": 20}]}),
            ))
        }));
        let requests = vec![
            BatchRequest::new(
                "a",
                "get_analytics",
                json!({"start_date": "2024-03-01", "end_date": "2024-03-31"}),
            ),
            BatchRequest::new("b", "get_analytics", json!({})),
        ];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;

        assert_eq!(transport.call_count(), 1);
        for id in ["a", "b"] {
            let payload = results.get(id).unwrap().payload().unwrap();
            assert_eq!(payload["analytics"].as_array().unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_invalid_date_fails_group_without_calls() {
        let transport = Arc::new(ScriptedTransport::unreachable());
        let requests = vec![BatchRequest::new(
            "a",
            "get_campaign_analytics",
            json!({"start_date": "March 1st"}),
        )];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;
        assert!(results.get("a").unwrap().error().unwrap().error.contains("YYYY-MM-DD"));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_standard_request_paginates_to_total() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            let start: usize = req.query_value("start").unwrap().parse().unwrap();
            let count = if start < 200 { 100 } else { 30 };
            let elements: Vec<Value> = (start..start + count).map(|i| json!({"id": i})).collect();
            Ok(ApiResponse::json_body(
                200,
                &json!({"elements": elements, "paging": {"start": start, "count": 100, "total": 230}}),
            ))
        }));
        let requests = vec![BatchRequest::new("a", "get_campaigns", json!({}))];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;

        assert_eq!(transport.call_count(), 3);
        let rows = results.get("a").unwrap().payload().unwrap()["get_campaigns"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(rows.len(), 230);
        assert_eq!(rows[229]["id"], 229);
        let unique: std::collections::HashSet<u64> =
            rows.iter().filter_map(|row| row["id"].as_u64()).collect();
        assert_eq!(unique.len(), rows.len());
    }

    #[tokio::test]
    async fn test_leads_fetched_once_per_form() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            let form = req.query_value("form").unwrap().to_string();
            if form.ends_with(":bad") {
                return Ok(ApiResponse::json_body(
                    403,
                    &json!({"message": "Not enough permissions", "status": 403}),
                ));
            }
            Ok(ApiResponse::json_body(
                200,
                &json!({"elements": [{"form": form}]}),
            ))
        }));
        let requests = vec![
            BatchRequest::new("a", "get_leads", json!({"form_id": "f1"})),
            BatchRequest::new("b", "get_leads", json!({"form_id": "f1"})),
            BatchRequest::new("c", "get_leads", json!({"form_id": 77})),
            BatchRequest::new("d", "get_leads", json!({"form_id": "bad"})),
            BatchRequest::new("e", "get_leads", json!({})),
        ];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;

        assert_eq!(transport.call_count(), 3);
        assert_eq!(
            results.get("b").unwrap().payload().unwrap()["leads"][0]["form"],
            "urn:li:leadGenForm:f1"
        );
        assert_eq!(
            results.get("c").unwrap().payload().unwrap()["leads"][0]["form"],
            "urn:li:leadGenForm:77"
        );
        assert_eq!(results.get("d").unwrap().error().unwrap().code, Some(403));
        assert_eq!(results.get("e").unwrap().payload().unwrap(), &json!({"leads": []}));
    }
}
