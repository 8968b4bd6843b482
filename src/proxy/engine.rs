//! The proxy engine.
//!
//! # Responsibilities
//! - Accept requests on the listen address and route them to upstreams
//! - Capture bounded request/response bodies onto flows
//! - Fire the addon pipeline at each lifecycle point
//! - Publish flow events through the store
//! - Re-inject captured requests on replay
//!
//! # Design Decisions
//! - One shared hyper client; connection reuse is the transport's concern
//! - Capture never changes what the peer receives: consumed bytes are
//!   stitched back into the forwarded body
//! - Response frames stream through as they arrive past the capture window

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::routing::any;
use chrono::Utc;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper::body::Body as HttpBody;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::proxy::addon::AddonManager;
use crate::proxy::body;
use crate::proxy::flow::{
    CapturedRequest, CapturedResponse, Flow, FlowEventType, FlowRef, FlowState,
};
use crate::proxy::recorder::ResponseRecorder;
use crate::proxy::router::{Router, RouterError, Upstream};
use crate::proxy::store::FlowStore;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9090";
pub const DEFAULT_WEB_PORT: u16 = 9091;
pub const DEFAULT_MAX_FLOWS: usize = 1000;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1 << 20;

/// Time allowed for in-flight handlers to finish after shutdown fires.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Address for the proxy listener (e.g. "127.0.0.1:9090").
    pub listen_addr: String,
    /// Port for the external web inspection UI. 0 disables it.
    pub web_port: u16,
    /// Routing table.
    pub upstreams: Vec<Upstream>,
    /// Ring-buffer capacity of the flow store.
    pub max_flows: usize,
    /// Maximum bytes captured per request/response body.
    pub max_body_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            web_port: DEFAULT_WEB_PORT,
            upstreams: Vec::new(),
            max_flows: DEFAULT_MAX_FLOWS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl Options {
    fn normalized(mut self) -> Options {
        if self.listen_addr.is_empty() {
            self.listen_addr = DEFAULT_LISTEN_ADDR.to_string();
        }
        if self.max_flows == 0 {
            self.max_flows = DEFAULT_MAX_FLOWS;
        }
        if self.max_body_size == 0 {
            self.max_body_size = DEFAULT_MAX_BODY_SIZE;
        }
        self
    }
}

/// Error returned when a replay cannot be dispatched. No flow is created
/// for any of these.
#[derive(Debug)]
pub enum ReplayError {
    NotFound(String),
    InvalidRequest { id: String, reason: String },
    NoRoute { path: String },
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::NotFound(id) => write!(f, "flow {:?} not found", id),
            ReplayError::InvalidRequest { id, reason } => {
                write!(f, "flow {:?} has an unreplayable request: {}", id, reason)
            }
            ReplayError::NoRoute { path } => write!(f, "no upstream for path {:?}", path),
        }
    }
}

impl std::error::Error for ReplayError {}

/// The core proxy: routes requests, captures flows, and dispatches them
/// through the addon pipeline. All mutable state lives in the engine's
/// store and addon manager; multiple engines may coexist in one process.
pub struct Engine {
    store: Arc<FlowStore>,
    addons: AddonManager,
    router: Router,
    client: Client<HttpConnector, Body>,
    opts: Options,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

impl Engine {
    /// Create an engine with the given options, validating the routing
    /// table up front.
    pub fn new(opts: Options) -> Result<Engine, RouterError> {
        let opts = opts.normalized();
        let router = Router::new(opts.upstreams.clone())?;
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Ok(Engine {
            store: Arc::new(FlowStore::new(opts.max_flows)),
            addons: AddonManager::new(),
            router,
            client,
            opts,
        })
    }

    /// Resolved options the engine was created with.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Flow store, for observers.
    pub fn store(&self) -> &FlowStore {
        &self.store
    }

    /// Addon manager, for registration.
    pub fn addons(&self) -> &AddonManager {
        &self.addons
    }

    /// Router, for display of the configured upstreams.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Run the proxy on `listener` until `shutdown` fires, then allow a
    /// fixed grace period for in-flight handlers before returning.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, upstreams = self.router.upstreams().len(), "proxy listening");

        let app = axum::Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(AppState {
                engine: self.clone(),
            })
            .layer(TraceLayer::new_for_http());

        let mut drain = shutdown.resubscribe();
        let graceful = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .into_future();

        tokio::select! {
            result = graceful => result,
            _ = async {
                let _ = drain.recv().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                tracing::warn!("shutdown grace period elapsed, dropping in-flight handlers");
                Ok(())
            }
        }
    }

    /// Proxy one request. This is the serialization point of the design:
    /// every exchange passes through here exactly once.
    pub async fn handle(&self, req: Request<Body>, remote_addr: String) -> Response<Body> {
        let path = req.uri().path().to_string();
        let Some(route) = self.router.match_route(&path) else {
            tracing::debug!(path = %path, "no upstream matched");
            return text_response(StatusCode::BAD_GATEWAY, "no upstream matched");
        };

        let flow: FlowRef = Arc::new(new_flow(&req, route.upstream()));
        tracing::debug!(
            flow = %flow.id,
            method = %req.method(),
            path = %path,
            upstream = %route.upstream().name,
            "flow started"
        );
        self.store.add(flow.clone());

        let (mut parts, raw_body) = req.into_parts();
        let body_empty = HttpBody::size_hint(&raw_body).exact() == Some(0);
        let mut truncated_replacement = None;
        if !body_empty {
            match body::capture(raw_body, self.opts.max_body_size).await {
                Ok(captured) => {
                    let mut data = flow.write();
                    data.request.body = captured.bytes.to_vec();
                    data.request.body_truncated = captured.truncated;
                    if captured.truncated {
                        truncated_replacement = Some(captured.replacement);
                    }
                }
                Err(e) => {
                    {
                        let mut data = flow.write();
                        data.state = FlowState::Error;
                        data.error = Some(format!("capture request: {e}"));
                        data.timestamps.response_done = Some(Utc::now());
                    }
                    self.store.update(flow.clone(), FlowEventType::Error);
                    return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal proxy error");
                }
            }
        }
        flow.write().timestamps.request_done = Utc::now();

        self.addons.fire_request(&flow);
        flow.wait_resume().await;
        if flow.is_killed() {
            return text_response(StatusCode::BAD_GATEWAY, "flow killed");
        }

        // Rebuild the outgoing request. A fully captured body is re-emitted
        // from the recorded bytes (request hooks may have rewritten them);
        // a truncated one streams the original payload through untouched.
        let outbound_body = if let Some(replacement) = truncated_replacement {
            replacement
        } else if body_empty {
            Body::empty()
        } else {
            let bytes = flow.read().request.body.clone();
            parts
                .headers
                .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));
            Body::from(bytes)
        };
        let mut outbound = Request::from_parts(parts, outbound_body);

        strip_hop_by_hop(outbound.headers_mut());
        if let Err(e) = route.rewrite(&mut outbound, &remote_addr) {
            {
                let mut data = flow.write();
                data.state = FlowState::Error;
                data.error = Some(format!("rewrite request: {e}"));
                data.timestamps.response_done = Some(Utc::now());
            }
            self.store.update(flow.clone(), FlowEventType::Error);
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal proxy error");
        }

        self.dispatch(flow, outbound).await
    }

    /// Re-send the captured request of flow `flow_id` through the proxy.
    /// The replayed exchange is stored as a new flow, which is returned.
    pub async fn replay(&self, flow_id: &str) -> Result<FlowRef, ReplayError> {
        let original = self
            .store
            .get(flow_id)
            .ok_or_else(|| ReplayError::NotFound(flow_id.to_string()))?;
        let request = original.read().request.clone();

        let method: http::Method =
            request
                .method
                .parse()
                .map_err(|_| ReplayError::InvalidRequest {
                    id: flow_id.to_string(),
                    reason: format!("bad method {:?}", request.method),
                })?;
        let uri: Uri = request
            .url
            .parse()
            .map_err(|e| ReplayError::InvalidRequest {
                id: flow_id.to_string(),
                reason: format!("bad url {:?}: {e}", request.url),
            })?;
        let path = uri.path().to_string();
        let Some(route) = self.router.match_route(&path) else {
            return Err(ReplayError::NoRoute { path });
        };

        let flow: FlowRef = Arc::new(Flow::new(route.upstream().name.clone(), request.clone()));
        {
            let mut data = flow.write();
            data.tags.push("replay".to_string());
            data.tags.push(format!("replay:{flow_id}"));
        }
        tracing::debug!(flow = %flow.id, origin = %flow_id, "replaying flow");
        self.store.add(flow.clone());

        flow.write().timestamps.request_done = Utc::now();
        self.addons.fire_request(&flow);
        flow.wait_resume().await;
        if flow.is_killed() {
            return Ok(flow);
        }

        let body_bytes = flow.read().request.body.clone();
        let mut outbound = Request::new(Body::from(body_bytes.clone()));
        *outbound.method_mut() = method;
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = request.headers.clone();
        outbound
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(body_bytes.len() as u64));

        strip_hop_by_hop(outbound.headers_mut());
        route
            .rewrite(&mut outbound, "127.0.0.1")
            .map_err(|e| ReplayError::InvalidRequest {
                id: flow_id.to_string(),
                reason: format!("rewrite request: {e}"),
            })?;

        let response = self.dispatch(flow.clone(), outbound).await;
        // Drain into the in-memory recorder; the operator reads the flow,
        // not the bytes.
        if let Err(e) = ResponseRecorder::record(response).await {
            tracing::debug!(flow = %flow.id, error = %e, "replay response drain failed");
        }

        Ok(flow)
    }

    /// Forward `req` upstream and run the response or error side of the
    /// flow lifecycle. Shared by the live handler and replay.
    async fn dispatch(&self, flow: FlowRef, req: Request<Body>) -> Response<Body> {
        match self.client.request(req).await {
            Ok(response) => self.on_upstream_response(flow, response).await,
            Err(e) => self.on_upstream_error(flow, e.to_string()),
        }
    }

    async fn on_upstream_response(
        &self,
        flow: FlowRef,
        response: Response<hyper::body::Incoming>,
    ) -> Response<Body> {
        flow.write().timestamps.response_start = Some(Utc::now());

        let (mut parts, raw_body) = response.into_parts();
        {
            let mut data = flow.write();
            data.response = Some(CapturedResponse {
                status_code: parts.status.as_u16(),
                headers: parts.headers.clone(),
                body: Vec::new(),
                proto: format!("{:?}", parts.version),
                body_truncated: false,
            });
        }

        let outbound_body = match body::capture(Body::new(raw_body), self.opts.max_body_size).await
        {
            Ok(captured) => {
                {
                    let mut data = flow.write();
                    if let Some(response) = data.response.as_mut() {
                        response.body = captured.bytes.to_vec();
                        response.body_truncated = captured.truncated;
                    }
                }
                if !captured.truncated {
                    parts
                        .headers
                        .insert(CONTENT_LENGTH, HeaderValue::from(captured.bytes.len() as u64));
                }
                captured.replacement
            }
            Err(e) => {
                // Capture failure hides the body from the record but must
                // not fail the client response.
                tracing::warn!(flow = %flow.id, error = %e, "response body capture failed");
                if let Some(response) = flow.write().response.as_mut() {
                    response.body_truncated = true;
                }
                parts.headers.remove(CONTENT_LENGTH);
                Body::empty()
            }
        };

        {
            let mut data = flow.write();
            data.timestamps.response_done = Some(Utc::now());
            data.state = FlowState::Complete;
        }
        self.addons.fire_response(&flow);
        self.addons.fire_complete(&flow);
        self.store.update(flow.clone(), FlowEventType::Complete);
        tracing::debug!(flow = %flow.id, status = parts.status.as_u16(), "flow complete");

        strip_hop_by_hop(&mut parts.headers);
        Response::from_parts(parts, outbound_body)
    }

    fn on_upstream_error(&self, flow: FlowRef, reason: String) -> Response<Body> {
        {
            let mut data = flow.write();
            data.state = FlowState::Error;
            data.error = Some(reason.clone());
            data.timestamps.response_done = Some(Utc::now());
        }
        self.addons.fire_error(&flow, &reason);
        self.store.update(flow.clone(), FlowEventType::Error);
        tracing::debug!(flow = %flow.id, error = %reason, "flow failed");

        text_response(StatusCode::BAD_GATEWAY, &format!("upstream error: {reason}"))
    }
}

async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    state.engine.handle(req, addr.to_string()).await
}

/// Build a flow skeleton from an incoming request. Headers are cloned so
/// later mutation by the transport cannot alter the record.
fn new_flow<B>(req: &Request<B>, upstream: &Upstream) -> Flow {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    Flow::new(
        upstream.name.clone(),
        CapturedRequest {
            method: req.method().to_string(),
            url: req.uri().to_string(),
            path: req.uri().path().to_string(),
            host,
            headers: req.headers().clone(),
            body: Vec::new(),
            proto: format!("{:?}", req.version()),
            body_truncated: false,
        },
    )
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{message}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers before forwarding. The captured record keeps
/// them; only the wire copy is cleaned.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| token.trim().parse::<HeaderName>().ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_upstream() -> Engine {
        Engine::new(Options {
            upstreams: vec![Upstream {
                name: "default".to_string(),
                prefix: "/".to_string(),
                target: "http://127.0.0.1:1".to_string(),
            }],
            ..Options::default()
        })
        .unwrap()
    }

    #[test]
    fn options_normalize_zero_values() {
        let engine = Engine::new(Options {
            listen_addr: String::new(),
            max_flows: 0,
            max_body_size: 0,
            upstreams: vec![Upstream {
                name: "d".to_string(),
                prefix: "/".to_string(),
                target: "http://127.0.0.1:1".to_string(),
            }],
            ..Options::default()
        })
        .unwrap();
        assert_eq!(engine.options().listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(engine.options().max_flows, DEFAULT_MAX_FLOWS);
        assert_eq!(engine.options().max_body_size, DEFAULT_MAX_BODY_SIZE);
    }

    #[test]
    fn strip_hop_by_hop_removes_connection_named_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "close, x-session-token".parse().unwrap());
        headers.insert("x-session-token", "abc".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());

        strip_hop_by_hop(&mut headers);
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-session-token").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert_eq!(headers["content-type"], "text/plain");
    }

    #[test]
    fn new_flow_records_request_line_fields() {
        let req = Request::builder()
            .method("PUT")
            .uri("/api/thing?x=1")
            .header(HOST, "localhost:9090")
            .body(())
            .unwrap();
        let upstream = Upstream {
            name: "api".to_string(),
            prefix: "/api".to_string(),
            target: "http://127.0.0.1:8081".to_string(),
        };
        let flow = new_flow(&req, &upstream);
        let data = flow.read();
        assert_eq!(data.request.method, "PUT");
        assert_eq!(data.request.url, "/api/thing?x=1");
        assert_eq!(data.request.path, "/api/thing");
        assert_eq!(data.request.host, "localhost:9090");
        assert_eq!(data.request.proto, "HTTP/1.1");
        drop(data);
        assert_eq!(flow.upstream, "api");
    }

    #[tokio::test]
    async fn replay_unknown_flow_is_an_error() {
        let engine = engine_with_upstream();
        let err = engine.replay("no-such-id").await.unwrap_err();
        assert!(matches!(err, ReplayError::NotFound(_)));
        assert_eq!(engine.store().count(), 0);
    }
}
