//! Meta Marketing API 批处理器
//!
//! 读请求：嵌套字段展开（campaign -> adsets -> ads）一次取回，跟随 paging.next 翻页。
//! 实体查询与更新：Graph Batch API，每批最多 50 个子请求，按位置映射回请求。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use super::graph_url;
use crate::core::{
    BatchError, BatchRequest, BatchResults, PlatformConnection, PlatformError, PlatformType,
};
use crate::http::{ApiRequest, HttpTransport};
use crate::platforms::common::{
    distribute_rows, extract_error, json_or_error, unique_ids, Throttle,
};
use crate::platforms::traits::{BatchContext, BatchStrategy, PlatformBatcher};

const MAX_BATCH_SIZE: usize = 50;
const FLUSH_INTERVAL_SECS: u64 = 300;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Graph Batch API limit
const GRAPH_BATCH_LIMIT: usize = 50;
const PAGE_LIMIT: u32 = 100;

const SUPPORTED_REQUEST_TYPES: &[&str] = &[
    "get_account",
    "get_campaigns",
    "get_ad_sets",
    "get_ads",
    "get_creatives",
    "get_audiences",
    "get_pixels",
    "get_insights",
    "get_campaign_insights",
    "get_ad_set_insights",
    "get_ad_insights",
    "get_entities",
    "update_campaigns",
    "update_ad_sets",
    "update_ads",
];

const INSIGHT_FIELDS: &str = "campaign_id,campaign_name,adset_id,adset_name,ad_id,ad_name,\
impressions,reach,clicks,spend,ctr,cpc,cpm,actions,conversions,date_start,date_stop";

/// (edge below the ad account, expanded field list)
fn read_edge(request_type: &str) -> Option<(&'static str, &'static str)> {
    match request_type {
        "get_campaigns" => Some((
            "campaigns",
            "id,name,status,effective_status,objective,daily_budget,lifetime_budget,\
start_time,stop_time,adsets.limit(100){id,name,status,daily_budget,targeting,\
ads.limit(100){id,name,status,creative{id,name,thumbnail_url}}}",
        )),
        "get_ad_sets" => Some((
            "adsets",
            "id,name,status,campaign_id,daily_budget,lifetime_budget,optimization_goal,\
billing_event,targeting,ads.limit(100){id,name,status,creative{id}}",
        )),
        "get_ads" => Some((
            "ads",
            "id,name,status,adset_id,campaign_id,\
creative{id,name,title,body,image_url,thumbnail_url,object_story_spec}",
        )),
        "get_creatives" => Some((
            "adcreatives",
            "id,name,title,body,image_url,thumbnail_url,object_story_spec,call_to_action_type",
        )),
        "get_audiences" => Some((
            "customaudiences",
            "id,name,subtype,approximate_count_lower_bound,approximate_count_upper_bound,delivery_status",
        )),
        "get_pixels" => Some(("adspixels", "id,name,last_fired_time,is_unavailable")),
        _ => None,
    }
}

fn insights_level(request_type: &str) -> &'static str {
    match request_type {
        "get_campaign_insights" => "campaign",
        "get_ad_set_insights" => "adset",
        "get_ad_insights" => "ad",
        _ => "account",
    }
}

/// `application/x-www-form-urlencoded` body for a batched POST
fn form_encode(updates: &Map<String, Value>) -> String {
    updates
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}={}", urlencoding::encode(key), urlencoding::encode(&value))
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Outcome of one Graph batch sub-request
fn batch_item_outcome(item: &Value) -> Result<Value, BatchError> {
    if item.is_null() {
        return Err(BatchError::new("Batch sub-request timed out"));
    }
    let code = item.get("code").and_then(Value::as_i64).unwrap_or(500);
    let body = item
        .get("body")
        .and_then(Value::as_str)
        .and_then(|b| serde_json::from_str::<Value>(b).ok())
        .unwrap_or(Value::Null);
    if (200..300).contains(&code) {
        return Ok(body);
    }
    let (message, platform_code) = extract_error(&body);
    let code = platform_code
        .and_then(|c| c.parse::<i64>().ok())
        .unwrap_or(code);
    Err(BatchError::with_code(
        message.unwrap_or_else(|| "Batch sub-request failed".to_string()),
        code,
    ))
}

/// Meta Marketing API batcher
pub struct MetaBatcher {
    transport: Arc<dyn HttpTransport>,
    throttle: Throttle,
}

impl MetaBatcher {
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

    /// Follow `paging.next` until exhausted, collecting `data`
    async fn fetch_all_pages(
        &self,
        ctx: &BatchContext,
        first: ApiRequest,
    ) -> Result<Vec<Value>, PlatformError> {
        let mut rows = Vec::new();
        let mut request = first;
        loop {
            let response = self
                .transport
                .send(request.bearer(ctx.token()).timeout(REQUEST_TIMEOUT))
                .await?;
            let data = json_or_error(&response, "Meta")?;
            if let Some(items) = data.get("data").and_then(Value::as_array) {
                rows.extend(items.iter().cloned());
            }
            // next 链接已包含全部查询参数
            match data
                .get("paging")
                .and_then(|p| p.get("next"))
                .and_then(Value::as_str)
            {
                Some(next) if !next.is_empty() => {
                    request = ApiRequest::get(next);
                    self.throttle.after_page().await;
                }
                _ => break,
            }
        }
        Ok(rows)
    }

    /// One expanded read per group
    async fn execute_field_expansion(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_type = %request_type,
            request_count = requests.len(),
            "[MetaBatcher] executing field expansion"
        );
        let first = requests.first().map(BatchRequest::params).unwrap_or_default();

        let rows = match request_type {
            "get_account" => {
                let fields = first.fields_or(&[
                    "id",
                    "name",
                    "account_status",
                    "currency",
                    "timezone_name",
                    "amount_spent",
                    "balance",
                    "spend_cap",
                ]);
                let request = ApiRequest::get(graph_url(ctx.account()))
                    .query("fields", fields.join(","))
                    .bearer(ctx.token())
                    .timeout(REQUEST_TIMEOUT);
                let response = self.transport.send(request).await?;
                vec![json_or_error(&response, "Meta")?]
            }
            t if t.ends_with("insights") => {
                let mut request = ApiRequest::get(graph_url(&format!("{}/insights", ctx.account())))
                    .query("level", insights_level(t))
                    .query("fields", INSIGHT_FIELDS)
                    .query("time_increment", "1")
                    .query("limit", PAGE_LIMIT.to_string());
                request = match first.date_range() {
                    Some((since, until)) => request.query(
                        "time_range",
                        json!({ "since": since, "until": until }).to_string(),
                    ),
                    None => request.query("date_preset", "last_30d"),
                };
                self.fetch_all_pages(ctx, request).await?
            }
            t => {
                let (edge, default_fields) = read_edge(t)
                    .ok_or_else(|| PlatformError::UnsupportedRequest(t.to_string()))?;
                let fields = first
                    .str("fields")
                    .unwrap_or_else(|| default_fields.to_string());
                let request = ApiRequest::get(graph_url(&format!("{}/{}", ctx.account(), edge)))
                    .query("fields", fields)
                    .query("limit", PAGE_LIMIT.to_string());
                self.fetch_all_pages(ctx, request).await?
            }
        };

        tracing::info!(
            request_type = %request_type,
            results_count = rows.len(),
            "[MetaBatcher] field expansion completed"
        );
        Ok(distribute_rows(requests, request_type, &rows))
    }

    /// POST one Graph batch and return the per-item outcomes in order
    async fn send_graph_batch(
        &self,
        ctx: &BatchContext,
        items: &[Value],
    ) -> Result<Vec<Result<Value, BatchError>>, PlatformError> {
        let request = ApiRequest::post(graph_url(""))
            .bearer(ctx.token())
            .form(vec![
                ("batch".into(), Value::Array(items.to_vec()).to_string()),
                ("include_headers".into(), "false".into()),
            ])
            .timeout(REQUEST_TIMEOUT);
        let response = self.transport.send(request).await?;
        let data = json_or_error(&response, "Meta")?;
        let responses = data.as_array().cloned().unwrap_or_default();
        Ok((0..items.len())
            .map(|i| match responses.get(i) {
                Some(item) => batch_item_outcome(item),
                None => Err(BatchError::new("Missing batch response")),
            })
            .collect())
    }

    /// Distinct entity lookups through the Batch API
    async fn get_entities(
        &self,
        ctx: &BatchContext,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        let ids_of = |request: &BatchRequest| {
            let params = request.params();
            let mut ids = params.list("entity_ids");
            ids.extend(params.str("entity_id"));
            ids
        };
        let entity_ids = unique_ids(requests.iter().flat_map(ids_of));

        tracing::info!(
            request_count = requests.len(),
            entity_count = entity_ids.len(),
            "[MetaBatcher] batch entity lookup"
        );

        let mut results = BatchResults::new();
        if entity_ids.is_empty() {
            results.fail_all(
                requests.iter().map(|r| r.id.as_str()),
                &BatchError::new("No entity IDs provided"),
            );
            return Ok(results);
        }

        let fields = requests
            .first()
            .map(BatchRequest::params)
            .unwrap_or_default()
            .fields_or(&["id", "name", "status"])
            .join(",");

        let mut outcomes: HashMap<String, Result<Value, BatchError>> = HashMap::new();
        let chunks: Vec<&[String]> = entity_ids.chunks(GRAPH_BATCH_LIMIT).collect();
        let chunk_count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let items: Vec<Value> = chunk
                .iter()
                .map(|id| {
                    json!({
                        "method": "GET",
                        "relative_url": format!(
                            "{}?fields={}",
                            urlencoding::encode(id),
                            urlencoding::encode(&fields)
                        ),
                    })
                })
                .collect();
            match self.send_graph_batch(ctx, &items).await {
                Ok(chunk_outcomes) => {
                    for (id, outcome) in chunk.iter().zip(chunk_outcomes) {
                        outcomes.insert(id.clone(), outcome);
                    }
                }
                Err(e) => {
                    tracing::warn!("[MetaBatcher] batch chunk {} failed: {}", index + 1, e);
                    let error = e.to_batch_error();
                    for id in chunk {
                        outcomes.insert(id.clone(), Err(error.clone()));
                    }
                }
            }
            if index + 1 < chunk_count {
                self.throttle.after_chunk().await;
            }
        }

        for request in requests {
            let ids = ids_of(request);
            let mut entities = Vec::with_capacity(ids.len());
            let mut failure = None;
            for id in &ids {
                match outcomes.get(id) {
                    Some(Ok(entity)) => entities.push(entity.clone()),
                    Some(Err(error)) => {
                        failure = Some(error.clone());
                        break;
                    }
                    None => {}
                }
            }
            match failure {
                Some(error) => results.failure(request.id.clone(), error),
                None => results.success(request.id.clone(), json!({ "entities": entities })),
            };
        }
        Ok(results)
    }

    /// One batched POST per request (`entity_id` + `updates`)
    async fn execute_updates(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        tracing::info!(
            request_type = %request_type,
            request_count = requests.len(),
            "[MetaBatcher] executing batch updates"
        );

        let mut results = BatchResults::new();
        let mut pending: Vec<(&BatchRequest, String, Value)> = Vec::new();
        for request in requests {
            let params = request.params();
            let Some(entity_id) = params.str("entity_id") else {
                results.failure(request.id.clone(), BatchError::new("No entity ID provided"));
                continue;
            };
            let Some(updates) = params.object("updates").filter(|u| !u.is_empty()) else {
                results.failure(request.id.clone(), BatchError::new("No updates provided"));
                continue;
            };
            let item = json!({
                "method": "POST",
                "relative_url": urlencoding::encode(&entity_id),
                "body": form_encode(updates),
            });
            pending.push((request, entity_id, item));
        }

        let chunks: Vec<_> = pending.chunks(GRAPH_BATCH_LIMIT).collect();
        let chunk_count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let items: Vec<Value> = chunk.iter().map(|(_, _, item)| item.clone()).collect();
            match self.send_graph_batch(ctx, &items).await {
                Ok(outcomes) => {
                    for ((request, entity_id, _), outcome) in chunk.iter().zip(outcomes) {
                        match outcome {
                            Ok(body) => {
                                let success = body.get("success").and_then(Value::as_bool).unwrap_or(true);
                                results.success(
                                    request.id.clone(),
                                    json!({ "success": success, "id": entity_id }),
                                );
                            }
                            Err(error) => {
                                results.failure(request.id.clone(), error);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("[MetaBatcher] update chunk {} failed: {}", index + 1, e);
                    let error = e.to_batch_error();
                    results.fail_all(chunk.iter().map(|(r, _, _)| r.id.as_str()), &error);
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
impl PlatformBatcher for MetaBatcher {
    fn platform(&self) -> PlatformType {
        PlatformType::Meta
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
        BatchStrategy::FieldExpansion
    }

    /// Ad account ids are addressed as `act_<id>`
    fn prepare(&self, connection: PlatformConnection) -> Result<BatchContext, PlatformError> {
        let account = connection.account().ok_or_else(|| {
            PlatformError::Connection("Missing Meta ad account ID".to_string())
        })?;
        let mut ctx = BatchContext::new(connection);
        if !account.starts_with("act_") {
            ctx.account_id = Some(format!("act_{}", account));
        }
        Ok(ctx)
    }

    async fn execute_by_type(
        &self,
        ctx: &BatchContext,
        request_type: &str,
        requests: &[BatchRequest],
    ) -> Result<BatchResults, PlatformError> {
        match request_type {
            "get_entities" => self.get_entities(ctx, requests).await,
            t if t.starts_with("update_") => self.execute_updates(ctx, t, requests).await,
            t => self.execute_field_expansion(ctx, t, requests).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConnectionStatus;
    use crate::http::{ApiResponse, Method, ScriptedTransport};

    fn connection() -> PlatformConnection {
        PlatformConnection {
            id: "m".into(),
            org_id: "org".into(),
            platform: PlatformType::Meta,
            access_token: Some("tok".into()),
            account_id: Some("123".into()),
            credentials: Map::new(),
            status: ConnectionStatus::Active,
        }
    }

    fn batcher(transport: Arc<ScriptedTransport>) -> MetaBatcher {
        MetaBatcher::new(transport).without_throttle()
    }

    fn batch_items(req: &ApiRequest) -> Vec<Value> {
        serde_json::from_str(req.form_value("batch").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_field_expansion_follows_paging_next() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            if req.url.ends_with("/act_123/campaigns") {
                assert!(req.query_value("fields").unwrap().contains("adsets.limit(100)"));
                return Ok(ApiResponse::json_body(
                    200,
                    &json!({
                        "data": [{"id": "1", "status": "ACTIVE"}],
                        "paging": {"next": "https://graph.facebook.com/v21.0/act_123/campaigns?after=x"}
                    }),
                ));
            }
            Ok(ApiResponse::json_body(
                200,
                &json!({"data": [{"id": "2", "status": "PAUSED"}], "paging": {}}),
            ))
        }));
        let requests = vec![
            BatchRequest::new("a", "get_campaigns", json!({})),
            BatchRequest::new("b", "get_campaigns", json!({"filters": {"status": "PAUSED"}})),
        ];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;

        assert_eq!(transport.call_count(), 2);
        assert_eq!(
            results.get("a").unwrap().payload().unwrap()["get_campaigns"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            results.get("b").unwrap().payload().unwrap()["get_campaigns"][0]["id"],
            "2"
        );
    }

    #[tokio::test]
    async fn test_updates_use_graph_batch_and_map_by_position() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            assert_eq!(req.method, Method::Post);
            let items = batch_items(req);
            assert_eq!(items[0]["relative_url"], "ad1");
            assert_eq!(items[0]["body"], "status=PAUSED");
            Ok(ApiResponse::json_body(
                200,
                &json!([
                    {"code": 200, "body": "{\"success\":true}"},
                    {"code": 400, "body": "{\"error\":{\"message\":\"Invalid parameter\",\"code\":100}}"}
                ]),
            ))
        }));
        let requests = vec![
            BatchRequest::new("u1", "update_ads", json!({"entity_id": "ad1", "updates": {"status": "PAUSED"}})),
            BatchRequest::new("u2", "update_ads", json!({"entity_id": "ad2", "updates": {"daily_budget": 500}})),
            BatchRequest::new("u3", "update_ads", json!({"updates": {"status": "PAUSED"}})),
        ];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;

        assert_eq!(transport.call_count(), 1);
        assert_eq!(results.get("u1").unwrap().payload().unwrap()["id"], "ad1");
        assert_eq!(
            results.get("u2").unwrap().error().unwrap(),
            &BatchError::with_code("Invalid parameter", 100)
        );
        assert_eq!(
            results.get("u3").unwrap().error().unwrap().error,
            "No entity ID provided"
        );
    }

    #[tokio::test]
    async fn test_entity_lookup_chunks_at_fifty() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            let items = batch_items(req);
            let responses: Vec<Value> = items
                .iter()
                .map(|item| {
                    let id = item["relative_url"].as_str().unwrap().split('?').next().unwrap();
                    json!({"code": 200, "body": json!({"id": id}).to_string()})
                })
                .collect();
            Ok(ApiResponse::json_body(200, &Value::Array(responses)))
        }));
        let ids: Vec<String> = (0..120).map(|i| format!("e{}", i)).collect();
        let requests = vec![
            BatchRequest::new("all", "get_entities", json!({"entity_ids": ids})),
            BatchRequest::new("one", "get_entities", json!({"entity_id": "e99"})),
        ];
        let results = batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;

        let sizes: Vec<usize> = transport.requests().iter().map(|r| batch_items(r).len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(
            results.get("all").unwrap().payload().unwrap()["entities"].as_array().unwrap().len(),
            120
        );
        assert_eq!(
            results.get("one").unwrap().payload().unwrap()["entities"][0]["id"],
            "e99"
        );
    }

    #[tokio::test]
    async fn test_batch_relative_urls_encode_ids_and_fields() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            let responses: Vec<Value> = batch_items(req)
                .iter()
                .map(|_| json!({"code": 200, "body": "{\"success\":true}"}))
                .collect();
            Ok(ApiResponse::json_body(200, &Value::Array(responses)))
        }));
        let requests = vec![
            BatchRequest::new(
                "lookup",
                "get_entities",
                json!({"entity_id": "123?fields=access_token&x=1", "fields": ["id", "name"]}),
            ),
            BatchRequest::new(
                "update",
                "update_ads",
                json!({"entity_id": "ad1&debug=all", "updates": {"status": "PAUSED"}}),
            ),
        ];
        batcher(transport.clone())
            .execute_for_connection(connection(), &requests)
            .await;

        let urls: Vec<String> = transport
            .requests()
            .iter()
            .flat_map(batch_items)
            .map(|item| item["relative_url"].as_str().unwrap().to_string())
            .collect();
        assert!(urls.contains(&"123%3Ffields%3Daccess_token%26x%3D1?fields=id%2Cname".to_string()));
        assert!(urls.contains(&"ad1%26debug%3Dall".to_string()));
    }

    #[tokio::test]
    async fn test_insights_level_and_time_range() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            assert!(req.url.ends_with("/act_123/insights"));
            assert_eq!(req.query_value("level"), Some("adset"));
            assert_eq!(
                req.query_value("time_range"),
                Some(r#"{"since":"2024-01-01","until":"2024-01-31"}"#)
            );
            Ok(ApiResponse::json_body(200, &json!({"data": [{"spend": "1.00"}]})))
        }));
        let requests = vec![BatchRequest::new(
            "a",
            "get_ad_set_insights",
            json!({"start_date": "2024-01-01", "end_date": "2024-01-31"}),
        )];
        let results = batcher(transport)
            .execute_for_connection(connection(), &requests)
            .await;
        assert!(results.get("a").unwrap().is_success());
    }

    #[tokio::test]
    async fn test_missing_ad_account_fails_without_calls() {
        let transport = Arc::new(ScriptedTransport::unreachable());
        let mut conn = connection();
        conn.account_id = None;
        let requests = vec![BatchRequest::new("a", "get_ads", json!({}))];
        let results = batcher(transport.clone())
            .execute_for_connection(conn, &requests)
            .await;
        assert_eq!(
            results.get("a").unwrap().error().unwrap().error,
            "Missing Meta ad account ID"
        );
        assert_eq!(transport.call_count(), 0);
    }
}
