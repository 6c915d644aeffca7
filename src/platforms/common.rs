// Shared helpers for batchers and publishers
// 批处理器与发布器共用的工具：分组、过滤、节流、轮询、错误解析

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::core::{
    BatchError, BatchRequest, BatchResults, ErrorCategory, PlatformError, PublishResult,
};
use crate::http::ApiResponse;

pub const NO_RESULT: &str = "No result for request";

// ============================================================================
// 分组与结果整理
// ============================================================================

/// Group requests by type, keeping first-seen order
pub fn group_by_type(requests: &[BatchRequest]) -> IndexMap<String, Vec<BatchRequest>> {
    let mut groups: IndexMap<String, Vec<BatchRequest>> = IndexMap::new();
    for request in requests {
        groups
            .entry(request.request_type.clone())
            .or_default()
            .push(request.clone());
    }
    groups
}

pub fn request_ids(requests: &[BatchRequest]) -> impl Iterator<Item = &str> {
    requests.iter().map(|r| r.id.as_str())
}

/// Rebuild the result map so its key set is exactly the submitted ids,
/// in submission order. Unknown ids are dropped, missing ids back-filled.
pub fn finalize_results(requests: &[BatchRequest], produced: BatchResults) -> BatchResults {
    let mut finalized = BatchResults::new();
    let mut by_id = produced.into_inner();
    for request in requests {
        if finalized.contains(&request.id) {
            continue;
        }
        match by_id.shift_remove(&request.id) {
            Some(result) => {
                finalized.insert(request.id.clone(), result);
            }
            None => {
                tracing::warn!("[Batch] no result produced for request {}", request.id);
                finalized.failure(request.id.clone(), BatchError::new(NO_RESULT));
            }
        }
    }
    if !by_id.is_empty() {
        tracing::warn!(
            "[Batch] dropping {} results for ids that were not submitted",
            by_id.len()
        );
    }
    finalized
}

/// Same rows for every request of a group under `key`, each post-filtered
/// by its own `filters`
pub fn distribute_rows(requests: &[BatchRequest], key: &str, rows: &[Value]) -> BatchResults {
    let mut results = BatchResults::new();
    for request in requests {
        let params = request.params();
        let filtered = match params.object("filters") {
            Some(filters) if !filters.is_empty() => filter_rows(rows, filters),
            _ => rows.to_vec(),
        };
        results.success(request.id.clone(), keyed(key, Value::Array(filtered)));
    }
    results
}

/// `{key: value}`
pub fn keyed(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

// ============================================================================
// 客户端过滤
// ============================================================================

/// Value at a dot-separated path (`campaign.status`)
pub fn dot_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => {
            a == &b.to_string()
        }
        (actual, Value::Array(options)) => options.iter().any(|o| loosely_equal(actual, o)),
        (a, b) => a == b,
    }
}

/// Keep rows whose dot-path values equal every filter value.
/// An array filter value matches any of its members.
pub fn filter_rows(rows: &[Value], filters: &Map<String, Value>) -> Vec<Value> {
    rows.iter()
        .filter(|row| {
            filters.iter().all(|(path, expected)| {
                dot_get(row, path)
                    .map(|actual| loosely_equal(actual, expected))
                    .unwrap_or(false)
            })
        })
        .cloned()
        .collect()
}

/// Distinct ids, first-seen order
pub fn unique_ids<I>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

// ============================================================================
// 节流
// ============================================================================

/// Fixed sleeps between successive calls to the same platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub page_delay: Duration,
    pub chunk_delay: Duration,
}

impl Throttle {
    pub fn new(page_delay: Duration, chunk_delay: Duration) -> Self {
        Self {
            page_delay,
            chunk_delay,
        }
    }

    pub fn millis(page_ms: u64, chunk_ms: u64) -> Self {
        Self::new(Duration::from_millis(page_ms), Duration::from_millis(chunk_ms))
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn enabled_or_none(self, enabled: bool) -> Self {
        if enabled {
            self
        } else {
            Self::none()
        }
    }

    pub async fn after_page(&self) {
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
    }

    pub async fn after_chunk(&self) {
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
    }
}

// ============================================================================
// 轮询
// ============================================================================

/// Bounded wait: `max_attempts` checks, `interval` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn secs(interval_secs: u64, max_attempts: u32) -> Self {
        Self::new(Duration::from_secs(interval_secs), max_attempts)
    }

    pub fn total_wait(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Outcome of one readiness check
#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    Ready(T),
    Pending,
    Failed(String),
}

/// Run `check` until it reports ready, fails, or attempts run out
pub async fn poll_until<T, F, Fut>(
    config: &PollConfig,
    what: &str,
    mut check: F,
) -> Result<T, PlatformError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollState<T>, PlatformError>>,
{
    for attempt in 1..=config.max_attempts {
        match check(attempt).await? {
            PollState::Ready(value) => {
                tracing::debug!("[Poll] {} ready after {} attempt(s)", what, attempt);
                return Ok(value);
            }
            PollState::Failed(reason) => {
                tracing::warn!("[Poll] {} failed: {}", what, reason);
                return Err(PlatformError::ProcessingFailed(reason));
            }
            PollState::Pending => {
                if attempt < config.max_attempts && !config.interval.is_zero() {
                    tokio::time::sleep(config.interval).await;
                }
            }
        }
    }
    tracing::warn!(
        "[Poll] {} not ready after {} attempts",
        what,
        config.max_attempts
    );
    Err(PlatformError::ProcessingTimeout(format!(
        "Timed out waiting for {} to finish processing (waited {}s)",
        what,
        config.total_wait().as_secs()
    )))
}

// ============================================================================
// 远程错误解析
// ============================================================================

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Message and code from the common error envelopes
/// (`error.message`, `errors[0].message`, `message`, `error_description`, `detail`)
pub fn extract_error(body: &Value) -> (Option<String>, Option<String>) {
    let error = body.get("error");
    let first = body
        .get("errors")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first());

    let message = error
        .and_then(|e| e.get("message"))
        .and_then(scalar)
        .or_else(|| error.and_then(scalar))
        .or_else(|| first.and_then(|e| e.get("message")).and_then(scalar))
        .or_else(|| first.and_then(|e| e.get("detail")).and_then(scalar))
        .or_else(|| body.get("error_description").and_then(scalar))
        .or_else(|| body.get("message").and_then(scalar))
        .or_else(|| body.get("detail").and_then(scalar));

    let code = error
        .and_then(|e| e.get("code"))
        .and_then(scalar)
        .or_else(|| first.and_then(|e| e.get("code")).and_then(scalar))
        .or_else(|| body.get("code").and_then(scalar))
        .or_else(|| body.get("serviceErrorCode").and_then(scalar));

    (message, code)
}

/// Parse a 2xx body as JSON, or turn the response into a RemoteApi error.
/// An empty 2xx body is Null; a non-JSON 2xx body is a transport error.
pub fn json_or_error(response: &ApiResponse, platform: &str) -> Result<Value, PlatformError> {
    if !response.is_success() {
        return Err(remote_error(response, platform));
    }
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    response.parse::<Value>().map_err(|e| {
        tracing::warn!("[{}] HTTP {} 响应不是合法 JSON: {}", platform, response.status, e);
        PlatformError::Transport(format!(
            "Invalid JSON response from {} (HTTP {}): {}",
            platform, response.status, e
        ))
    })
}

pub fn remote_error(response: &ApiResponse, platform: &str) -> PlatformError {
    let body = response.json();
    let (message, code) = extract_error(&body);
    let message = message.unwrap_or_else(|| {
        let text = response.text();
        if text.trim().is_empty() || text.len() > 300 {
            format!("{} API error (HTTP {})", platform, response.status)
        } else {
            text
        }
    });
    PlatformError::remote(message, response.status, code)
}

// ============================================================================
// 发布错误翻译
// ============================================================================

/// Static per-platform lookup of error codes / message fragments
pub struct ErrorTable {
    pub platform: &'static str,
    pub codes: HashMap<&'static str, ErrorCategory>,
    pub fragments: Vec<(&'static str, ErrorCategory)>,
}

impl ErrorTable {
    pub fn new(platform: &'static str) -> Self {
        Self {
            platform,
            codes: HashMap::new(),
            fragments: Vec::new(),
        }
    }

    pub fn code(mut self, code: &'static str, category: ErrorCategory) -> Self {
        self.codes.insert(code, category);
        self
    }

    pub fn fragment(mut self, fragment: &'static str, category: ErrorCategory) -> Self {
        self.fragments.push((fragment, category));
        self
    }

    pub fn categorize(&self, status: u16, code: Option<&str>, message: &str) -> ErrorCategory {
        if let Some(category) = code.and_then(|c| self.codes.get(c)) {
            return *category;
        }
        let lower = message.to_lowercase();
        if let Some((_, category)) = self.fragments.iter().find(|(f, _)| lower.contains(f)) {
            return *category;
        }
        match status {
            401 => ErrorCategory::TokenExpired,
            403 => ErrorCategory::PermissionDenied,
            429 => ErrorCategory::RateLimited,
            _ => ErrorCategory::Unknown,
        }
    }

    /// User-facing message for a publish failure
    pub fn translate(&self, error: &PlatformError) -> String {
        match error {
            PlatformError::RemoteApi {
                message,
                status,
                code,
            } => match self.categorize(*status, code.as_deref(), message) {
                ErrorCategory::Unknown => {
                    if message.trim().is_empty() {
                        format!("{} API error (HTTP {})", self.platform, status)
                    } else {
                        format!("{} API error (HTTP {}): {}", self.platform, status, message)
                    }
                }
                category => category.user_message(self.platform),
            },
            PlatformError::Transport(message) => {
                format!("Could not reach {}: {}", self.platform, message)
            }
            other => other.to_string(),
        }
    }
}

/// Message for a publisher that has no usable connection
pub fn not_connected_message(platform: &str) -> String {
    format!(
        "No active {} connection found. Please reconnect your {} account.",
        platform, platform
    )
}

/// Turn a publish workflow outcome into a PublishResult, translating errors
pub fn finish_publish(
    table: &ErrorTable,
    outcome: Result<(String, Option<String>), PlatformError>,
) -> PublishResult {
    match outcome {
        Ok((post_id, permalink)) => {
            tracing::info!("[Publish] {} post published: {}", table.platform, post_id);
            PublishResult::published(post_id, permalink)
        }
        Err(e) => {
            tracing::error!("[Publish] {} publish failed: {}", table.platform, e);
            PublishResult::failed(table.translate(&e))
        }
    }
}

/// Convert a whole-group error into per-request entries
pub fn fail_group(results: &mut BatchResults, requests: &[BatchRequest], error: &PlatformError) {
    results.fail_all(request_ids(requests), &error.to_batch_error());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn req(id: &str, ty: &str, params: Value) -> BatchRequest {
        BatchRequest::new(id, ty, params)
    }

    #[test]
    fn test_group_by_type_keeps_order() {
        let requests = vec![
            req("1", "get_ads", json!({})),
            req("2", "get_campaigns", json!({})),
            req("3", "get_ads", json!({})),
        ];
        let groups = group_by_type(&requests);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["get_ads", "get_campaigns"]);
        assert_eq!(groups["get_ads"].len(), 2);
    }

    #[test]
    fn test_finalize_backfills_and_drops_unknown() {
        let requests = vec![req("a", "t", json!({})), req("b", "t", json!({}))];
        let mut produced = BatchResults::new();
        produced.success("b", json!(1));
        produced.success("zzz", json!(2));
        let finalized = finalize_results(&requests, produced);
        assert_eq!(finalized.ids().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(finalized.get("a").unwrap().error().unwrap().error, NO_RESULT);
    }

    #[test]
    fn test_filter_rows_dot_path() {
        let rows = vec![
            json!({"campaign": {"status": "ENABLED", "id": "1"}}),
            json!({"campaign": {"status": "PAUSED", "id": "2"}}),
        ];
        let mut filters = Map::new();
        filters.insert("campaign.status".into(), json!("ENABLED"));
        assert_eq!(filter_rows(&rows, &filters).len(), 1);

        let mut by_id = Map::new();
        by_id.insert("campaign.id".into(), json!([2, 3]));
        let matched = filter_rows(&rows, &by_id);
        assert_eq!(matched[0]["campaign"]["status"], "PAUSED");
    }

    #[test]
    fn test_extract_error_shapes() {
        assert_eq!(
            extract_error(&json!({"error": {"message": "bad token", "code": 190}})),
            (Some("bad token".into()), Some("190".into()))
        );
        assert_eq!(
            extract_error(&json!({"errors": [{"message": "dup", "code": 187}]})),
            (Some("dup".into()), Some("187".into()))
        );
        assert_eq!(
            extract_error(&json!({"message": "Unauthorized", "serviceErrorCode": 65600})),
            (Some("Unauthorized".into()), Some("65600".into()))
        );
    }

    #[test]
    fn test_json_or_error_rejects_non_json_success_body() {
        let html = ApiResponse::new(200, "<html>proxy error</html>");
        let err = json_or_error(&html, "Google").unwrap_err();
        assert!(matches!(err, PlatformError::Transport(_)));
        assert!(err.to_string().contains("Invalid JSON response from Google"));

        assert_eq!(json_or_error(&ApiResponse::new(204, ""), "Google").unwrap(), Value::Null);
        assert_eq!(
            json_or_error(&ApiResponse::json_body(200, &json!({"ok": true})), "Google").unwrap()["ok"],
            true
        );
    }

    #[test]
    fn test_error_table_translation() {
        let table = ErrorTable::new("Meta")
            .code("190", ErrorCategory::TokenExpired)
            .fragment("rate limit", ErrorCategory::RateLimited);

        let expired = PlatformError::remote("Session has expired", 400, Some("190".into()));
        assert!(table.translate(&expired).contains("expired"));

        let limited = PlatformError::remote("User rate limit hit", 400, None);
        assert!(table.translate(&limited).contains("rate limit"));

        let unknown = PlatformError::remote("", 500, Some("1".into()));
        assert_eq!(table.translate(&unknown), "Meta API error (HTTP 500)");
    }

    #[tokio::test]
    async fn test_poll_until_times_out_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let config = PollConfig::new(Duration::ZERO, 3);
        let result: Result<(), _> = poll_until(&config, "container", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(PollState::Pending) }
        })
        .await;
        assert!(matches!(result, Err(PlatformError::ProcessingTimeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_ready_and_failed() {
        let config = PollConfig::new(Duration::ZERO, 5);
        let ready = poll_until(&config, "upload", |attempt| async move {
            Ok(if attempt == 2 {
                PollState::Ready(attempt)
            } else {
                PollState::Pending
            })
        })
        .await
        .unwrap();
        assert_eq!(ready, 2);

        let failed: Result<(), _> = poll_until(&config, "upload", |_| async {
            Ok(PollState::Failed("corrupt".into()))
        })
        .await;
        assert!(matches!(failed, Err(PlatformError::ProcessingFailed(_))));
    }
}
