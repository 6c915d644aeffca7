// Batch result aggregation
// 批处理结果汇总：每个请求 id 恰好对应一个结果

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-request error payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl BatchError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(error: impl Into<String>, code: i64) -> Self {
        Self {
            error: error.into(),
            code: Some(code),
        }
    }
}

/// Either the platform payload or an error for one request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchResult {
    Success(Value),
    Failure(BatchError),
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchResult::Success(_))
    }

    pub fn error(&self) -> Option<&BatchError> {
        match self {
            BatchResult::Failure(e) => Some(e),
            BatchResult::Success(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            BatchResult::Success(v) => Some(v),
            BatchResult::Failure(_) => None,
        }
    }
}

/// Ordered request id -> result map; the first write for an id wins
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BatchResults {
    entries: IndexMap<String, BatchResult>,
}

impl BatchResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and keeps the existing entry) if the id is already present
    pub fn insert(&mut self, id: impl Into<String>, result: BatchResult) -> bool {
        let id = id.into();
        if self.entries.contains_key(&id) {
            tracing::warn!("[Batch] duplicate result for request {} ignored", id);
            return false;
        }
        self.entries.insert(id, result);
        true
    }

    pub fn success(&mut self, id: impl Into<String>, payload: Value) -> bool {
        self.insert(id, BatchResult::Success(payload))
    }

    pub fn failure(&mut self, id: impl Into<String>, error: BatchError) -> bool {
        self.insert(id, BatchResult::Failure(error))
    }

    /// Record the same error for every id that has no entry yet
    pub fn fail_all<'a, I>(&mut self, ids: I, error: &BatchError)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for id in ids {
            if !self.entries.contains_key(id) {
                self.entries
                    .insert(id.to_string(), BatchResult::Failure(error.clone()));
            }
        }
    }

    /// Merge another result set; returns the number of duplicate ids dropped
    pub fn merge(&mut self, other: BatchResults) -> usize {
        let mut duplicates = 0;
        for (id, result) in other.entries {
            if !self.insert(id, result) {
                duplicates += 1;
            }
        }
        duplicates
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&BatchResult> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BatchResult)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn into_inner(self) -> IndexMap<String, BatchResult> {
        self.entries
    }
}
