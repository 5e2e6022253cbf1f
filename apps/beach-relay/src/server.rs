use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    client_ip::client_ip,
    config::{CorsConfig, RelayConfig},
    connection::PeerConnection,
    frame::{CallRequest, CallResponse},
    policy::{AllowAll, IpAllowList, IpPolicy},
    router::Relay,
    session::{run_session, CallHandler},
};

const SHUTDOWN_REASON: &str = "server shutting down";

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub policy: Arc<dyn IpPolicy>,
    pub config: Arc<RelayConfig>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, policy: Arc<dyn IpPolicy>, config: RelayConfig) -> Self {
        Self {
            relay,
            policy,
            config: Arc::new(config),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PrometheusHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct UpgradeQuery {
    #[serde(rename = "peerId", default)]
    pub peer_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub active_peers: usize,
    pub active_connections: usize,
    pub calls_in_flight: usize,
    pub peers: Vec<PeerStatsEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeerStatsEntry {
    pub peer_id: String,
    pub connections: usize,
}

pub fn build_router(state: AppState) -> Router {
    let cors = state.config.cors.enabled.then(|| cors_layer(&state.config.cors));
    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        // Peers that receive calls hold a socket here.
        .route("/ws", get(ws_handler))
        // Anonymous one-shot calls to a registered peer.
        .route("/call", post(call_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    match cors {
        Some(layer) => router.layer(layer),
        None => router,
    }
}

/// Build the CORS layer. With credentials allowed, wildcards mirror the
/// request instead of answering `*`, which is invalid on credentialed
/// responses.
fn cors_layer(cors: &CorsConfig) -> CorsLayer {
    let credentials = cors.allow_credentials;

    let origin = if is_wildcard(&cors.allow_origins) {
        if credentials {
            AllowOrigin::mirror_request()
        } else {
            AllowOrigin::any()
        }
    } else {
        AllowOrigin::list(parsed(&cors.allow_origins, |o| HeaderValue::from_str(o).ok()))
    };
    let headers = if is_wildcard(&cors.allow_headers) {
        if credentials {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::any()
        }
    } else {
        AllowHeaders::list(parsed(&cors.allow_headers, header_name))
    };
    let methods = if is_wildcard(&cors.allow_methods) {
        if credentials {
            AllowMethods::mirror_request()
        } else {
            AllowMethods::any()
        }
    } else {
        AllowMethods::list(parsed(&cors.allow_methods, |m| Method::from_bytes(m.as_bytes()).ok()))
    };

    let layer = CorsLayer::new()
        .allow_origin(origin)
        .allow_headers(headers)
        .allow_methods(methods)
        .allow_credentials(credentials);
    if cors.expose_headers.is_empty() {
        layer
    } else if is_wildcard(&cors.expose_headers) {
        if credentials {
            warn!("ignoring `*` CORS expose headers with credentials allowed");
            layer
        } else {
            layer.expose_headers(ExposeHeaders::any())
        }
    } else {
        layer.expose_headers(ExposeHeaders::list(parsed(&cors.expose_headers, header_name)))
    }
}

fn is_wildcard(entries: &[String]) -> bool {
    entries.is_empty() || entries.iter().any(|entry| entry == "*")
}

fn header_name(name: &str) -> Option<HeaderName> {
    HeaderName::from_bytes(name.as_bytes()).ok()
}

fn parsed<T>(entries: &[String], parse: impl Fn(&str) -> Option<T>) -> Vec<T> {
    entries
        .iter()
        .filter_map(|entry| {
            let value = parse(entry);
            if value.is_none() {
                warn!(entry = %entry, "ignoring invalid CORS entry");
            }
            value
        })
        .collect()
}

/// Run the relay until ctrl-c, then close every peer and wait out the grace
/// period.
pub async fn serve(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let relay = Relay::shared(config.call_timeout);

    let mut reloader = None;
    let policy: Arc<dyn IpPolicy> = if config.allowlist.enabled {
        let list = Arc::new(
            IpAllowList::new(&config.allowlist).context("failed to load IP allow-list")?,
        );
        info!(entries = list.len(), "IP allow-list enabled");
        reloader = list.spawn_reloader(config.allowlist_reload);
        list
    } else {
        Arc::new(AllowAll)
    };

    let listen_addr = config.listen_addr;
    let shutdown_grace = config.shutdown_grace;
    let mut state = AppState::new(relay.clone(), policy, config);
    if let Some(metrics) = metrics {
        state = state.with_metrics(metrics);
    }

    let listener = TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-relay listening on {}", listen_addr);

    serve_on(listener, state, shutdown_signal())
        .await
        .context("server shutdown with error")?;

    let closed = relay.registry().close_all(SHUTDOWN_REASON);
    info!(
        grace_seconds = shutdown_grace.as_secs(),
        closed_connections = closed,
        "shutdown signal received; sleeping for graceful period"
    );
    if let Some(handle) = reloader {
        handle.abort();
    }
    tokio::time::sleep(shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_on<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.relay.registry();
    let peers: Vec<PeerStatsEntry> = registry
        .snapshot()
        .into_iter()
        .map(|entry| PeerStatsEntry {
            peer_id: entry.peer_id,
            connections: entry.connections,
        })
        .collect();
    Json(StatsResponse {
        active_peers: peers.len(),
        active_connections: peers.iter().map(|entry| entry.connections).sum(),
        calls_in_flight: state.relay.correlator().in_flight(),
        peers,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    query: Option<Query<UpgradeQuery>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    // An unparsable query counts as a missing peerId.
    let peer_id = query.map(|Query(query)| query.peer_id).unwrap_or_default();
    let client_ip = client_ip(&headers, remote_addr);

    // Refuse before upgrading so a rejected peer leaves no trace.
    if peer_id.is_empty() {
        warn!(client_ip = %client_ip, "upgrade without peerId; redirecting");
        counter!("beach_relay_upgrades_rejected_total", "reason" => "missing_peer_id").increment(1);
        return reject(&state);
    }
    if !state.policy.is_allowed(&client_ip) {
        warn!(client_ip = %client_ip, peer_id = %peer_id, "client not allow-listed; redirecting");
        counter!("beach_relay_upgrades_rejected_total", "reason" => "not_allowed").increment(1);
        return reject(&state);
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(error = %rejection, "request to /ws is not a websocket upgrade");
            return rejection.into_response();
        }
    };

    let captured = capture_headers(&headers);
    let max_frame_bytes = state.config.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let (conn, outbound) = PeerConnection::new(peer_id, state.config.outbound_depth);
            let conn = Arc::new(
                conn.with_headers(captured)
                    .with_addresses(remote_addr, client_ip),
            );
            let (sink, stream) = socket.split();
            let handler: Arc<dyn CallHandler> = state.relay.clone();
            run_session(stream, sink, conn, outbound, state.relay.clone(), handler).await;
        })
}

async fn call_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match CallRequest::from_bytes(&body) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "undecodable call body");
            return call_response(StatusCode::INTERNAL_SERVER_ERROR, &CallResponse::malformed());
        }
    };

    match state.relay.on_call(request).await {
        Ok(response) => call_response(StatusCode::OK, &response),
        Err(err) => {
            debug!(error = %err, "call failed");
            call_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_response())
        }
    }
}

fn call_response(status: StatusCode, response: &CallResponse) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        response.to_bytes(),
    )
        .into_response()
}

fn reject(state: &AppState) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, state.config.reject_redirect.clone())],
    )
        .into_response()
}

fn capture_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut captured: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        captured
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    captured
}
