// Scripted transport for tests: a closure answers every request and all
// requests are recorded for later assertions.
#![cfg(any(test, feature = "test-export-mocks"))]

use std::sync::Mutex;

use async_trait::async_trait;

use super::{ApiRequest, ApiResponse, HttpTransport, TransportError};

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync;

pub struct ScriptedTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fails the test if any request is sent
    pub fn unreachable() -> Self {
        Self::new(|req| {
            Err(TransportError::Other(format!(
                "unexpected request {} {}",
                req.method.as_str(),
                req.url
            )))
        })
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Requests whose URL contains the given fragment
    pub fn calls_to(&self, fragment: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let result = (self.handler)(&request);
        if let Ok(mut log) = self.requests.lock() {
            log.push(request);
        }
        result
    }
}
