use crate::graphql::parse;
use crate::models::{MockedRequest, PortMessage};
use crate::panel::{ListenerId, PanelTransport};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const DEFAULT_CAPACITY: usize = 500;

/// One mocked call as shown in the panel's request list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedRequest {
    pub id: String,
    pub url: String,
    pub operation_name: String,
    pub request_body: String,
    /// Pretty-printed response that was served
    pub response_body: String,
    pub status_code: u16,
    pub timestamp: i64,
}

impl From<MockedRequest> for LoggedRequest {
    fn from(req: MockedRequest) -> Self {
        let operation_name = parse(&req.body)
            .into_operation()
            .map(|parsed| parsed.operation_name)
            .unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_name,
            response_body: serde_json::to_string_pretty(&req.response).unwrap_or_default(),
            url: req.url,
            request_body: req.body,
            status_code: req.status_code,
            timestamp: req.timestamp,
        }
    }
}

/// Bounded, oldest-first list of mocked calls reported to a panel.
pub struct MockedRequestLog {
    entries: Mutex<VecDeque<LoggedRequest>>,
    capacity: usize,
    total: Mutex<u64>,
}

impl Default for MockedRequestLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MockedRequestLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
            total: Mutex::new(0),
        }
    }

    /// Start recording `MOCKED_REQUEST` messages arriving on `transport`.
    pub fn attach(self: &Arc<Self>, transport: &PanelTransport) -> ListenerId {
        let log = Arc::clone(self);
        transport.on_message(move |message| {
            if let PortMessage::MockedRequest { payload } = message {
                log.record(payload.clone());
            }
        })
    }

    pub fn record(&self, request: MockedRequest) -> LoggedRequest {
        let entry = LoggedRequest::from(request);
        let mut entries = self.entries.lock().expect("request log mutex poisoned");
        entries.push_back(entry.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        *self.total.lock().expect("request log mutex poisoned") += 1;
        tracing::debug!(url = %entry.url, status = entry.status_code, "mocked request logged");
        entry
    }

    pub fn entries(&self) -> Vec<LoggedRequest> {
        self.entries
            .lock()
            .expect("request log mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<LoggedRequest> {
        self.entries
            .lock()
            .expect("request log mutex poisoned")
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("request log mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Everything ever recorded, including entries evicted since.
    pub fn total_recorded(&self) -> u64 {
        *self.total.lock().expect("request log mutex poisoned")
    }

    /// Entries whose URL or operation name contains `needle`
    /// (case-insensitive).
    pub fn filter(&self, needle: &str) -> Vec<LoggedRequest> {
        let needle = needle.to_ascii_lowercase();
        self.entries
            .lock()
            .expect("request log mutex poisoned")
            .iter()
            .filter(|entry| {
                entry.url.to_ascii_lowercase().contains(&needle)
                    || entry.operation_name.to_ascii_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("request log mutex poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mocked(op: &str, status: u16) -> MockedRequest {
        MockedRequest {
            url: "https://api.example.com/graphql".into(),
            body: format!(r#"{{"operationName":"{op}","variables":{{}}}}"#),
            response: json!({"data": {"op": op}}),
            status_code: status,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn entries_are_pretty_and_named() {
        let log = MockedRequestLog::default();
        let entry = log.record(mocked("GetUser", 200));
        assert_eq!(entry.operation_name, "GetUser");
        assert!(entry.response_body.contains("\n  \"data\""));
        assert_eq!(log.get(&entry.id), Some(entry));
    }

    #[test]
    fn ring_is_bounded() {
        let log = MockedRequestLog::with_capacity(3);
        for i in 0..5 {
            log.record(mocked(&format!("Op{i}"), 200));
        }
        let names: Vec<_> = log.entries().into_iter().map(|e| e.operation_name).collect();
        assert_eq!(names, ["Op2", "Op3", "Op4"]);
        assert_eq!(log.total_recorded(), 5);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.total_recorded(), 5);
    }

    #[test]
    fn filter_matches_operation_or_url() {
        let log = MockedRequestLog::default();
        log.record(mocked("GetUser", 200));
        log.record(mocked("ListOrders", 500));
        assert_eq!(log.filter("orders").len(), 1);
        assert_eq!(log.filter("API.EXAMPLE").len(), 2);
        assert!(log.filter("nothing").is_empty());
    }
}
