// Typed view over request_params
// request_params 的类型化读取（数字或字符串形式的 id 都接受）

use serde_json::{Map, Value};

/// Read-only accessor for the loosely shaped `request_params` object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParams {
    raw: Map<String, Value>,
}

impl RequestParams {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self { raw: map.clone() },
            _ => Self::default(),
        }
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// String value; numbers are stringified, blanks are None
    pub fn str(&self, key: &str) -> Option<String> {
        scalar_to_string(self.raw.get(key)?)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        match self.raw.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.raw.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// List of ids; accepts an array or a single scalar
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.raw.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
            Some(other) => scalar_to_string(other).into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// First non-empty string among several accepted key names
    pub fn first_str(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.str(k))
    }

    pub fn object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.raw.get(key)?.as_object()
    }

    /// Requested field list, falling back to the given defaults
    pub fn fields_or(&self, defaults: &[&str]) -> Vec<String> {
        let fields = self.list("fields");
        if fields.is_empty() {
            defaults.iter().map(|f| f.to_string()).collect()
        } else {
            fields
        }
    }

    pub fn date_range(&self) -> Option<(String, String)> {
        let start = self.first_str(&["start_date", "date_from", "since"])?;
        let end = self.first_str(&["end_date", "date_to", "until"])?;
        Some((start, end))
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
