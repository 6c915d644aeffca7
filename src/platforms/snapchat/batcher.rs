//! Snapchat 批处理器
//!
//! - 组织：一次取回全部组织，并为每个组织附上广告账户
//! - 统计：汇总所有 entity_ids（为空则先列出账户下全部实体），每批 100 个
//! - 其他类型：跟随 paging.next_link 中的 cursor 翻页

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::{json, Value};

use super::{API_VERSION, BASE_URL};
use crate::core::{BatchRequest, BatchResults, PlatformError, PlatformType};
use crate::http::{ApiRequest, HttpTransport};
use crate::platforms::common::{distribute_rows, json_or_error, unique_ids, Throttle};
use crate::platforms::traits::{BatchContext, BatchStrategy, PlatformBatcher};

const MAX_BATCH_SIZE: usize = 200;
const FLUSH_INTERVAL_SECS: u64 = 600;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const STATS_CHUNK_SIZE: usize = 100;
const PAGE_SIZE: u32 = 100;

const STATS_FIELDS: &str = "impressions,swipes,spend,video_views,screen_time_millis,\
quartile_1,quartile_2,quartile_3,view_completion";

const SUPPORTED_REQUEST_TYPES: &[&str] = &[
    "get_organizations",
    "get_ad_accounts",
    "get_campaigns",
    "get_ad_squads",
    "get_ads",
    "get_creatives",
    "get_media",
    "get_targeting_options",
    "get_audiences",
    "get_audience_segments",
    "get_campaign_stats",
    "get_ad_squad_stats",
    "get_ad_stats",
    "get_pixels",
    "get_pixel_events",
];

/// (path below the ad account, response collection key)
fn listing(request_type: &str) -> Option<(&'static str, &'static str)> {
    match request_type {
        "get_campaigns" => Some(("campaigns", "campaigns")),
        "get_ad_squads" => Some(("adsquads", "adsquads")),
        "get_ads" => Some(("ads", "ads")),
        "get_creatives" => Some(("creatives", "creatives")),
        "get_media" => Some(("media", "media")),
        "get_audiences" => Some(("audiences", "audiences")),
        "get_audience_segments" => Some(("segments", "segments")),
        "get_pixels" => Some(("pixels", "pixels")),
        "get_pixel_events" => Some(("pixel/stats", "data")),
        _ => None,
    }
}

/// (entity collection, singular wrapper key)
fn stats_entity(request_type: &str) -> (&'static str, &'static str) {
    match request_type {
        "get_ad_squad_stats" => ("adsquads", "adsquad"),
        "get_ad_stats" => ("ads", "ad"),
        _ => ("campaigns", "campaign"),
    }
}

/// `cursor` query value of a `paging.next_link` URL
pub fn next_cursor(next_link: &str) -> Option<String> {
    let url = url::Url::parse(next_link).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "cursor")
        .map(|(_, v)| v.into_owned())
        .filter(|c| !c.is_empty())
}

/// Entity id of a stats row, wrapped (`timeseries_stat.id`) or flat (`id`)
fn stat_entity_id(stat: &Value) -> Option<&str> {
    stat.get("id")
        .or_else(|| stat.get("timeseries_stat").and_then(|s| s.get("id")))
        .or_else(|| stat.get("total_stat").and_then(|s| s.get("id")))
        .and_then(Value::as_str)
}

/// Snapchat Marketing API batcher
pub struct SnapchatBatcher {
    transport: Arc<dyn HttpTransport>,
    throttle: Throttle,
}

impl SnapchatBatcher {
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

    fn url(path: &str) -> String {
        format!("{}/{}/{}", BASE_URL, API_VERSION, path.trim_start_matches('/'))
    }

    async fn get_json(&self, ctx: &BatchContext, request: ApiRequest) -> Result<Value, PlatformError> {
        let request = request.bearer(ctx.token()).timeout(REQUEST_TIMEOUT);
        let response = self.transport.send(request).await?;
        json_or_error(&response, "Snapchat")
    }

    fn ad_account(ctx: &BatchContext) -> Result<&str, PlatformError> {
        ctx.account_id
            .as_deref()
            .ok_or_else(|| PlatformError::Configuration("Ad account ID required".to_string()))
    }

    async fn fetch_ad_accounts(
        &self,
        ctx: &BatchContext,
        organization_id: &str,
    ) -> Result<Vec<Value>, PlatformError> {
        let path = format!("organizations/{}/adaccounts", organization_id);
        let data = self.get_json(ctx, ApiRequest::get(Self::url(&path))).await?;
        Ok(data
            .get("adaccounts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// All organizations, each enriched with its ad accounts
    async fn get_organizations_with_includes(
        &self,
        ctx: &BatchContext,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_count = requests.len(),
            "[SnapchatBatcher] getting organizations with includes"
        );

        let data = self
            .get_json(ctx, ApiRequest::get(Self::url("me/organizations")))
            .await?;
        let organizations = data
            .get("organizations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut enriched = Vec::with_capacity(organizations.len());
        for mut org in organizations {
            let Some(org_id) = org
                .get("organization")
                .and_then(|o| o.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                continue;
            };
            match self.fetch_ad_accounts(ctx, &org_id).await {
                Ok(accounts) => org["ad_accounts"] = Value::Array(accounts),
                Err(e) => {
                    tracing::warn!(
                        "[SnapchatBatcher] ad accounts for organization {} failed: {}",
                        org_id,
                        e
                    );
                }
            }
            enriched.push(org);
            self.throttle.after_chunk().await;
        }

        tracing::info!(
            org_count = enriched.len(),
            "[SnapchatBatcher] organizations fetched"
        );
        let payload = json!({ "organizations": enriched });
        let mut results = BatchResults::new();
        for request in requests {
            results.success(request.id.clone(), payload.clone());
        }
        Ok(results)
    }

    async fn get_ad_accounts_with_includes(
        &self,
        ctx: &BatchContext,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        let organization_id = ctx
            .connection
            .credential("organization_id")
            .ok_or_else(|| PlatformError::Configuration("Organization ID required".to_string()))?;

        tracing::info!(
            request_count = requests.len(),
            "[SnapchatBatcher] getting ad accounts with includes"
        );
        let accounts = self.fetch_ad_accounts(ctx, &organization_id).await?;
        tracing::info!(
            account_count = accounts.len(),
            "[SnapchatBatcher] ad accounts fetched"
        );
        Ok(distribute_rows(requests, "ad_accounts", &accounts))
    }

    /// Every entity id of the given kind under the ad account
    async fn list_entity_ids(
        &self,
        ctx: &BatchContext,
        account: &str,
        collection: &str,
        singular: &str,
    ) -> Result<Vec<String>, PlatformError> {
        let path = format!("adaccounts/{}/{}", account, collection);
        let data = self.get_json(ctx, ApiRequest::get(Self::url(&path))).await?;
        Ok(data
            .get(collection)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|e| e.get(singular).and_then(|s| s.get("id")).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Stats for every requested entity, 100 ids per call, filtered per request
    async fn get_combined_stats(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        let account = Self::ad_account(ctx)?;
        let (collection, singular) = stats_entity(request_type);

        tracing::info!(
            request_type = %request_type,
            request_count = requests.len(),
            "[SnapchatBatcher] getting combined stats"
        );

        let mut entity_ids =
            unique_ids(requests.iter().flat_map(|r| r.params().list("entity_ids")));
        if entity_ids.is_empty() {
            entity_ids = self
                .list_entity_ids(ctx, account, collection, singular)
                .await?;
        }

        let mut results = BatchResults::new();
        if entity_ids.is_empty() {
            for request in requests {
                results.success(request.id.clone(), json!({ "stats": [] }));
            }
            return Ok(results);
        }

        let first = requests.first().map(BatchRequest::params).unwrap_or_default();
        let now = Utc::now();
        let start_time = first.str("start_time").unwrap_or_else(|| {
            (now - ChronoDuration::days(7)).to_rfc3339_opts(SecondsFormat::Secs, true)
        });
        let end_time = first
            .str("end_time")
            .unwrap_or_else(|| now.to_rfc3339_opts(SecondsFormat::Secs, true));

        let mut stats: Vec<Value> = Vec::new();
        let chunks: Vec<&[String]> = entity_ids.chunks(STATS_CHUNK_SIZE).collect();
        let chunk_count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let path = format!("adaccounts/{}/{}/stats", account, collection);
            let request = ApiRequest::get(Self::url(&path))
                .query("ids", chunk.join(","))
                .query("granularity", "DAY")
                .query("start_time", start_time.clone())
                .query("end_time", end_time.clone())
                .query("fields", STATS_FIELDS);
            let data = self.get_json(ctx, request).await?;
            let rows = data
                .get("timeseries_stats")
                .or_else(|| data.get("total_stats"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            stats.extend(rows);
            if index + 1 < chunk_count {
                self.throttle.after_chunk().await;
            }
        }

        for request in requests {
            let wanted = request.params().list("entity_ids");
            let matched: Vec<Value> = if wanted.is_empty() {
                stats.clone()
            } else {
                stats
                    .iter()
                    .filter(|s| stat_entity_id(s).is_some_and(|id| wanted.iter().any(|w| w == id)))
                    .cloned()
                    .collect()
            };
            results.success(request.id.clone(), json!({ "stats": matched }));
        }

        tracing::info!(
            stats_count = stats.len(),
            "[SnapchatBatcher] combined stats completed"
        );
        Ok(results)
    }

    /// Cursor pagination through `paging.next_link`
    async fn execute_standard_request(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        let (url, key) = if request_type == "get_targeting_options" {
            (Self::url("targeting/options"), "data")
        } else {
            let (path, key) = listing(request_type)
                .ok_or_else(|| PlatformError::UnsupportedRequest(request_type.to_string()))?;
            let account = Self::ad_account(ctx)?;
            (Self::url(&format!("adaccounts/{}/{}", account, path)), key)
        };

        tracing::info!(
            request_type = %request_type,
            request_count = requests.len(),
            "[SnapchatBatcher] executing standard request"
        );

        let mut rows: Vec<Value> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut request = ApiRequest::get(url.clone()).query("limit", PAGE_SIZE.to_string());
            if let Some(cursor) = &cursor {
                request = request.query("cursor", cursor.clone());
            }
            let data = self.get_json(ctx, request).await?;
            if let Some(items) = data.get(key).and_then(Value::as_array) {
                rows.extend(items.iter().cloned());
            }
            cursor = data
                .get("paging")
                .and_then(|p| p.get("next_link"))
                .and_then(Value::as_str)
                .and_then(next_cursor);
            if cursor.is_none() {
                break;
            }
            self.throttle.after_page().await;
        }

        tracing::info!(
            request_type = %request_type,
            results_count = rows.len(),
            "[SnapchatBatcher] standard request completed"
        );
        Ok(distribute_rows(requests, request_type, &rows))
    }
}

#[async_trait::async_trait]
impl PlatformBatcher for SnapchatBatcher {
    fn platform(&self) -> PlatformType {
        PlatformType::Snapchat
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

    async fn execute_by_type(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        match request_type {
            "get_organizations" => self.get_organizations_with_includes(ctx, requests).await,
            "get_ad_accounts" => self.get_ad_accounts_with_includes(ctx, requests).await,
            "get_campaign_stats" | "get_ad_squad_stats" | "get_ad_stats" => {
                self.get_combined_stats(ctx, request_type, requests).await
            }
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
        let mut credentials = Map::new();
        credentials.insert("organization_id".into(), json!("org-1"));
        PlatformConnection {
            id: "sc".into(),
            org_id: "org".into(),
            platform: PlatformType::Snapchat,
            access_token: Some("tok".into()),
            account_id: Some("acc-1".into()),
            credentials,
            status: ConnectionStatus::Active,
        }
    }

    fn batcher(transport: Arc<ScriptedTransport>) -> SnapchatBatcher {
        SnapchatBatcher::new(transport).without_throttle()
    }

    #[test]
    fn test_next_cursor_from_link() {
        assert_eq!(
            next_cursor("https://adsapi.snapchat.com/v1/adaccounts/a/campaigns?cursor=abc%3D&limit=100")
                .as_deref(),
            Some("abc=")
        );
        assert_eq!(next_cursor("https://adsapi.snapchat.com/v1/x?limit=1"), None);
        assert_eq!(next_cursor("not a url"), None);
    }

    #[tokio::test]
    async fn test_stats_chunked_by_hundred() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            let rows: Vec<Value> = req
                .query_value("ids")
                .unwrap()
                .split(',')
                .map(|id| json!({"timeseries_stat": {"id": id, "type": "CAMPAIGN"}}))
                .collect();
            Ok(ApiResponse::json_body(200, &json!({"timeseries_stats": rows})))
        }));
        let ids: Vec<String> = (0..250).map(|i| format!("c{}", i)).collect();
        let requests = vec![
            BatchRequest::new("all", "get_campaign_stats", json!({"entity_ids": ids})),
            BatchRequest::new("one", "get_campaign_stats", json!({"entity_ids": ["c7"]})),
        ];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;

        let sizes: Vec<usize> = transport
            .requests()
            .iter()
            .map(|r| r.query_value("ids").unwrap().split(',').count())
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(
            results.get("all").unwrap().payload().unwrap()["stats"].as_array().unwrap().len(),
            250
        );
        let one = &results.get("one").unwrap().payload().unwrap()["stats"];
        assert_eq!(one.as_array().unwrap().len(), 1);
        assert_eq!(one[0]["timeseries_stat"]["id"], "c7");
    }

    #[tokio::test]
    async fn test_stats_without_ids_lists_account_entities_first() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            if req.url.ends_with("/adaccounts/acc-1/adsquads") {
                return Ok(ApiResponse::json_body(
                    200,
                    &json!({"adsquads": [{"adsquad": {"id": "s1"}}, {"adsquad": {"id": "s2"}}]}),
                ));
            }
            assert_eq!(req.query_value("ids"), Some("s1,s2"));
            Ok(ApiResponse::json_body(200, &json!({"total_stats": [{"id": "s1"}, {"id": "s2"}]})))
        }));
        let requests = vec![BatchRequest::new("a", "get_ad_squad_stats", json!({}))];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;
        assert_eq!(transport.call_count(), 2);
        assert_eq!(
            results.get("a").unwrap().payload().unwrap()["stats"].as_array().unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_organizations_enriched_with_ad_accounts() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            if req.url.ends_with("/me/organizations") {
                return Ok(ApiResponse::json_body(
                    200,
                    &json!({"organizations": [
                        {"organization": {"id": "o1"}},
                        {"organization": {"id": "o2"}}
                    ]}),
                ));
            }
            if req.url.contains("/o2/") {
                return Ok(ApiResponse::json_body(500, &json!({"request_status": "ERROR"})));
            }
            Ok(ApiResponse::json_body(200, &json!({"adaccounts": [{"adaccount": {"id": "a1"}}]})))
        }));
        let requests = vec![BatchRequest::new("a", "get_organizations", json!({}))];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;

        assert_eq!(transport.call_count(), 3);
        let orgs = results.get("a").unwrap().payload().unwrap()["organizations"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(orgs.len(), 2);
        assert_eq!(orgs[0]["ad_accounts"][0]["adaccount"]["id"], "a1");
        assert!(orgs[1].get("ad_accounts").is_none());
    }

    #[tokio::test]
    async fn test_paging_follows_next_link() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            let body = match req.query_value("cursor") {
                None => json!({
                    "campaigns": [{"campaign": {"id": "1"}}],
                    "paging": {"next_link": "https://adsapi.snapchat.com/v1/adaccounts/acc-1/campaigns?cursor=n2"}
                }),
                _ => json!({"campaigns": [{"campaign": {"id": "2"}}], "paging": {}}),
            };
            Ok(ApiResponse::json_body(200, &body))
        }));
        let requests = vec![BatchRequest::new("a", "get_campaigns", json!({}))];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;
        assert_eq!(transport.call_count(), 2);
        assert_eq!(transport.requests()[1].query_value("cursor"), Some("n2"));
        assert_eq!(
            results.get("a").unwrap().payload().unwrap()["get_campaigns"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_ad_accounts_require_organization() {
        let transport = Arc::new(ScriptedTransport::unreachable());
        let mut conn = connection();
        conn.credentials.clear();
        let requests = vec![
            BatchRequest::new("a", "get_ad_accounts", json!({})),
            BatchRequest::new("b", "get_unknown", json!({})),
        ];
        let results = batcher(transport.clone())
            .execute_for_connection(conn, &requests)
            .await;
        assert_eq!(
            results.get("a").unwrap().error().unwrap().error,
            "Organization ID required"
        );
        assert_eq!(
            results.get("b").unwrap().error().unwrap().error,
            "Unsupported request type: get_unknown"
        );
        assert_eq!(transport.call_count(), 0);
    }
}
