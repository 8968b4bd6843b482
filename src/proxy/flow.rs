//! Flow data model.
//!
//! A [`Flow`] is the captured record of a single proxied HTTP transaction:
//! the request snapshot, the response snapshot once headers arrive, and the
//! lifecycle state in between. Flows are shared behind an [`FlowRef`] between
//! the engine, the store, and subscribers; all mutable record fields live
//! behind an internal lock so hooks and observers never race the handler.

use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

/// Lifecycle stage of a flow.
///
/// States advance monotonically along `active -> complete` or
/// `active -> error`; `intercepted` is a pause overlay that returns to
/// `active` before a terminal state is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Active,
    Intercepted,
    Complete,
    Error,
}

/// Snapshot of an HTTP request as it arrived at the proxy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub method: String,
    /// Origin-form URL as received (path plus query).
    pub url: String,
    pub path: String,
    pub host: String,
    #[serde(with = "header_map")]
    pub headers: HeaderMap,
    #[serde(with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    pub proto: String,
    pub body_truncated: bool,
}

/// Snapshot of the upstream's response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResponse {
    pub status_code: u16,
    #[serde(with = "header_map")]
    pub headers: HeaderMap,
    #[serde(with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    pub proto: String,
    pub body_truncated: bool,
}

/// Wall-clock markers along the flow lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamps {
    pub created: DateTime<Utc>,
    pub request_done: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_done: Option<DateTime<Utc>>,
}

/// Mutable record fields of a flow, guarded by the flow's lock.
#[derive(Debug)]
pub struct FlowData {
    pub request: CapturedRequest,
    pub response: Option<CapturedResponse>,
    pub error: Option<String>,
    pub state: FlowState,
    pub tags: Vec<String>,
    pub timestamps: Timestamps,
}

#[derive(Debug, Default)]
struct Gate {
    intercepted: bool,
    killed: bool,
}

/// One proxied HTTP transaction.
///
/// `id` and `upstream` are fixed at creation; everything else is reached
/// through [`Flow::read`] / [`Flow::write`]. The intercept gate sits outside
/// the data lock so a parked handler never blocks readers.
#[derive(Debug)]
pub struct Flow {
    pub id: String,
    pub upstream: String,
    data: RwLock<FlowData>,
    gate: Mutex<Gate>,
    resume: Notify,
}

/// Shared handle to a flow.
pub type FlowRef = std::sync::Arc<Flow>;

impl Flow {
    /// Create a new flow in the `active` state with a fresh id.
    pub fn new(upstream: impl Into<String>, request: CapturedRequest) -> Flow {
        let now = Utc::now();
        Flow {
            id: Uuid::new_v4().to_string(),
            upstream: upstream.into(),
            data: RwLock::new(FlowData {
                request,
                response: None,
                error: None,
                state: FlowState::Active,
                tags: Vec::new(),
                timestamps: Timestamps {
                    created: now,
                    request_done: now,
                    response_start: None,
                    response_done: None,
                },
            }),
            gate: Mutex::new(Gate::default()),
            resume: Notify::new(),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FlowData> {
        self.data.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, FlowData> {
        self.data.write().unwrap()
    }

    /// Elapsed time from creation to response completion, or to now if the
    /// flow is still in flight.
    pub fn duration(&self) -> Duration {
        let data = self.read();
        let elapsed = match data.timestamps.response_done {
            Some(done) => done - data.timestamps.created,
            None => Utc::now() - data.timestamps.created,
        };
        elapsed.to_std().unwrap_or_default()
    }

    /// Pause the flow until [`Flow::resume`] or [`Flow::kill`] is called.
    ///
    /// Only meaningful from an `on_request` hook: the engine parks the
    /// serving task on the gate after the hook chain returns. There is no
    /// gate timeout; a hook that intercepts and never resumes pins one
    /// handler.
    pub fn intercept(&self) {
        let mut gate = self.gate.lock().unwrap();
        if gate.killed {
            return;
        }
        gate.intercepted = true;
        drop(gate);
        self.write().state = FlowState::Intercepted;
    }

    /// Release an intercepted flow back to `active`.
    pub fn resume(&self) {
        let mut gate = self.gate.lock().unwrap();
        if gate.killed {
            return;
        }
        gate.intercepted = false;
        drop(gate);
        self.write().state = FlowState::Active;
        self.resume.notify_waiters();
    }

    /// Terminate the flow. An intercepted flow is unblocked; the serving
    /// task answers the client with 502.
    pub fn kill(&self) {
        let mut gate = self.gate.lock().unwrap();
        gate.killed = true;
        gate.intercepted = false;
        drop(gate);
        {
            let mut data = self.write();
            data.state = FlowState::Error;
            data.error = Some("flow killed".to_string());
        }
        self.resume.notify_waiters();
    }

    pub fn is_killed(&self) -> bool {
        self.gate.lock().unwrap().killed
    }

    /// Wait until the flow is neither intercepted nor alive-and-gated.
    /// Returns immediately for flows that were never intercepted.
    pub(crate) async fn wait_resume(&self) {
        loop {
            let notified = self.resume.notified();
            {
                let gate = self.gate.lock().unwrap();
                if !gate.intercepted || gate.killed {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Serializable copy of the flow's current record.
    pub fn snapshot(&self) -> FlowSnapshot {
        let data = self.read();
        FlowSnapshot {
            id: self.id.clone(),
            upstream: self.upstream.clone(),
            request: data.request.clone(),
            response: data.response.clone(),
            error: data.error.clone(),
            state: data.state,
            tags: data.tags.clone(),
            timestamps: data.timestamps.clone(),
        }
    }
}

/// Point-in-time copy of a flow, in the JSON shape observers consume.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSnapshot {
    pub id: String,
    pub upstream: String,
    pub request: CapturedRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CapturedResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub state: FlowState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub timestamps: Timestamps,
}

/// Kind of change that occurred to a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowEventType {
    New,
    Update,
    Complete,
    Error,
}

/// A flow change notification delivered to store subscribers.
#[derive(Debug, Clone)]
pub struct FlowEvent {
    pub kind: FlowEventType,
    pub flow: FlowRef,
}

impl FlowEvent {
    pub fn snapshot(&self) -> FlowEventSnapshot {
        FlowEventSnapshot {
            kind: self.kind,
            flow: self.flow.snapshot(),
        }
    }
}

/// Serializable form of a [`FlowEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct FlowEventSnapshot {
    #[serde(rename = "type")]
    pub kind: FlowEventType,
    pub flow: FlowSnapshot,
}

mod header_map {
    use http::HeaderMap;
    use serde::ser::{SerializeMap, Serializer};

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(headers.keys_len()))?;
        for key in headers.keys() {
            let values: Vec<String> = headers
                .get_all(key)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            map.serialize_entry(key.as_str(), &values)?;
        }
        map.end()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> CapturedRequest {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.append("x-multi", "one".parse().unwrap());
        headers.append("x-multi", "two".parse().unwrap());
        CapturedRequest {
            method: "POST".to_string(),
            url: "/api/ping?q=1".to_string(),
            path: "/api/ping".to_string(),
            host: "localhost:9090".to_string(),
            headers,
            body: b"hello".to_vec(),
            proto: "HTTP/1.1".to_string(),
            body_truncated: false,
        }
    }

    #[test]
    fn snapshot_json_shape() {
        let flow = Flow::new("api", sample_request());
        let json = serde_json::to_value(flow.snapshot()).unwrap();

        assert_eq!(json["upstream"], "api");
        assert_eq!(json["state"], "active");
        assert_eq!(json["request"]["method"], "POST");
        assert_eq!(json["request"]["bodyTruncated"], false);
        // Bodies travel base64-encoded.
        assert_eq!(json["request"]["body"], "aGVsbG8=");
        // Header multimaps serialize as key -> [values].
        assert_eq!(json["request"]["headers"]["x-multi"][0], "one");
        assert_eq!(json["request"]["headers"]["x-multi"][1], "two");
        // Unset optional fields are omitted entirely.
        assert!(json.get("response").is_none());
        assert!(json.get("error").is_none());
        assert!(json["timestamps"].get("responseDone").is_none());
        // Timestamps render as ISO-8601.
        let created = json["timestamps"]["created"].as_str().unwrap();
        assert!(created.contains('T'), "not ISO-8601: {created}");
    }

    #[test]
    fn event_snapshot_carries_type_and_flow() {
        let flow = std::sync::Arc::new(Flow::new("api", sample_request()));
        let event = FlowEvent {
            kind: FlowEventType::Complete,
            flow: flow.clone(),
        };
        let json = serde_json::to_value(event.snapshot()).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["flow"]["id"], flow.id.as_str());
    }

    #[test]
    fn duration_uses_response_done_when_set() {
        let flow = Flow::new("api", sample_request());
        {
            let mut data = flow.write();
            let created = data.timestamps.created;
            data.timestamps.response_done = Some(created + chrono::Duration::milliseconds(250));
        }
        assert_eq!(flow.duration(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn kill_releases_intercepted_flow() {
        let flow = std::sync::Arc::new(Flow::new("api", sample_request()));
        flow.intercept();
        assert_eq!(flow.read().state, FlowState::Intercepted);

        let waiter = flow.clone();
        let handle = tokio::spawn(async move { waiter.wait_resume().await });

        // Give the waiter a chance to park on the gate.
        tokio::task::yield_now().await;
        flow.kill();
        handle.await.unwrap();

        assert!(flow.is_killed());
        assert_eq!(flow.read().state, FlowState::Error);
        assert_eq!(flow.read().error.as_deref(), Some("flow killed"));
    }

    #[tokio::test]
    async fn resume_returns_flow_to_active() {
        let flow = std::sync::Arc::new(Flow::new("api", sample_request()));
        flow.intercept();

        let waiter = flow.clone();
        let handle = tokio::spawn(async move { waiter.wait_resume().await });
        tokio::task::yield_now().await;

        flow.resume();
        handle.await.unwrap();
        assert_eq!(flow.read().state, FlowState::Active);
        assert!(!flow.is_killed());
    }
}
