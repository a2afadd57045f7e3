//! HTTP and WebSocket transport.
//!
//! A thin shell over the core: handlers translate between the wire and
//! [`Gateway`] calls, map the error taxonomy to status codes, and fan
//! gateway events out to WebSocket subscribers. No routing, budgeting, or
//! caching logic lives here.
//!
//! ## Endpoints
//!
//! - `POST /api/query` — process a query
//! - `GET  /api/health` — provider health, uptime, client counts
//! - `GET  /api/analytics` / `GET /api/analytics/events` — analytics
//! - `GET  /api/budget` — period statuses, emergency flag, spend buckets
//! - `GET  /api/cache` / `POST /api/cache/clear` — cache inspection
//! - `GET  /api/artifacts` / `GET /api/artifacts/:query_id` — artifacts
//! - `GET  /api/manager-view` — one aggregated snapshot
//! - `GET  /metrics` — Prometheus text format
//! - `GET  /ws` — event fan-out (subscribe/unsubscribe, 30 s pings)

use crate::artifacts::ArtifactKind;
use crate::config::GatewayConfig;
use crate::events::{Channel, ChannelSubscription};
use crate::orchestrator::{Gateway, QueryOptions};
use crate::provider::ChatMessage;
use crate::router::Strategy;
use crate::{epoch_ms, GatewayError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// New WebSocket connections allowed per source IP per minute.
const WS_CONNECTS_PER_MINUTE: u32 = 10;
/// Block length once the per-minute allowance is exhausted.
const WS_BLOCK: Duration = Duration::from_secs(5 * 60);
/// Server ping cadence.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
/// A client that has not answered a ping within this window is dropped.
const WS_PONG_DEADLINE: Duration = Duration::from_secs(75);

struct AppState {
    gateway: Arc<Gateway>,
    started: Instant,
    ws_clients: AtomicUsize,
    ws_limiter: WsRateLimiter,
}

/// Start serving. Runs until the listener fails.
pub async fn start_server(
    config: &GatewayConfig,
    gateway: Arc<Gateway>,
) -> Result<(), GatewayError> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("bind {addr}: {e}")))?;
    info!(addr = addr.as_str(), "gateway listening");

    let app = build_router(config, gateway);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| GatewayError::Internal(format!("server error: {e}")))
}

/// Build the router; split from [`start_server`] so tests can bind their
/// own listener.
pub fn build_router(config: &GatewayConfig, gateway: Arc<Gateway>) -> Router {
    let cors = if config.server.cors.origin == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        match HeaderValue::from_str(&config.server.cors.origin) {
            Ok(origin) => CorsLayer::new().allow_origin(origin).allow_methods(Any).allow_headers(Any),
            Err(_) => {
                warn!(origin = config.server.cors.origin.as_str(), "invalid CORS origin, allowing any");
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            }
        }
    };

    let state = Arc::new(AppState {
        gateway,
        started: Instant::now(),
        ws_clients: AtomicUsize::new(0),
        ws_limiter: WsRateLimiter::new(WS_CONNECTS_PER_MINUTE, WS_BLOCK),
    });

    Router::new()
        .route("/api/query", post(query_handler))
        .route("/api/health", get(health_handler))
        .route("/api/analytics", get(analytics_handler))
        .route("/api/analytics/events", get(analytics_events_handler))
        .route("/api/budget", get(budget_handler))
        .route("/api/cache", get(cache_handler))
        .route("/api/cache/clear", post(cache_clear_handler))
        .route("/api/artifacts", get(artifacts_handler))
        .route("/api/artifacts/:query_id", get(artifacts_by_query_handler))
        .route("/api/manager-view", get(manager_view_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

// ── Error mapping ──────────────────────────────────────────────────────

/// Wire error body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Short error label.
    pub error: String,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status, repeated in the body.
    pub status_code: u16,
    /// Kind-specific details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&GatewayError> for ApiError {
    fn from(e: &GatewayError) -> Self {
        let details = match e {
            GatewayError::BudgetExceeded { spent, limit } => {
                Some(json!({ "spent": spent, "limit": limit }))
            }
            GatewayError::Provider { provider, model, status, retry_after_ms, .. } => Some(json!({
                "provider": provider,
                "model": model,
                "upstreamStatus": status,
                "retryAfterMs": retry_after_ms,
            })),
            _ => None,
        };
        ApiError {
            error: e.code().to_lowercase().replace('_', " "),
            code: e.code().to_string(),
            message: e.to_string(),
            status_code: e.status_code(),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

fn api_error(e: GatewayError) -> ApiError {
    ApiError::from(&e)
}

// ── Query endpoint ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    conversation_history: Vec<ChatMessage>,
    #[serde(default)]
    strategy: Option<Strategy>,
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let content = body
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| api_error(GatewayError::InvalidInput("missing content".into())))?;

    let opts = QueryOptions {
        system_prompt: body.system_prompt,
        conversation_history: body.conversation_history,
        max_tokens: body.max_tokens,
        temperature: body.temperature,
        strategy: body.strategy,
        cache_ttl_ms: None,
    };

    let response =
        state.gateway.process_query(&content, opts).await.map_err(api_error)?;

    Ok(Json(json!({
        "id": response.id,
        "content": response.content,
        "provider": response.provider,
        "model": response.model,
        "cacheHit": response.cache_hit,
        "similarity": response.similarity,
        "cost": response.cost,
        "tokens": {
            "input": response.tokens.input,
            "output": response.tokens.output,
            "total": response.tokens.total,
        },
        "responseTimeMs": response.total_time_ms,
        "citations": response.citations,
        "classification": response.classification,
        "routing": response.routing,
    })))
}

// ── Inspection endpoints ───────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "providers": state.gateway.provider_health(),
        "wsClients": state.ws_clients.load(Ordering::Relaxed),
        "uptime": state.started.elapsed().as_secs(),
        "timestamp": epoch_ms(),
    }))
}

async fn analytics_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!(state.gateway.analytics().summary()))
}

async fn analytics_events_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit = param_usize(&params, "limit").unwrap_or(50);
    let offset = param_usize(&params, "offset").unwrap_or(0);
    let (events, total) = state.gateway.analytics().events(limit, offset);
    Json(json!({ "events": events, "total": total }))
}

async fn budget_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let budget = state.gateway.budget();
    Json(json!({
        "statuses": budget.statuses(),
        "emergencyMode": budget.is_emergency_mode(),
        "byProvider": budget.spend_by_provider(),
        "byModel": budget.spend_by_model(),
    }))
}

async fn cache_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cache = state.gateway.cache();
    let stats = cache.stats().await;
    let entries = cache.entries_snapshot(100).await;
    Json(json!({ "stats": stats, "entries": entries }))
}

async fn cache_clear_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.gateway.cache().clear().await;
    Json(json!({ "message": "cache cleared" }))
}

async fn artifacts_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let store = state.gateway.artifacts();
    let limit = param_usize(&params, "limit").unwrap_or(50);
    let artifacts = if let Some(kind) = params.get("type").and_then(|t| ArtifactKind::parse(t)) {
        store.get_by_kind(kind, limit)
    } else if let Some(tag) = params.get("tag") {
        store.get_by_tag(tag, limit)
    } else {
        store.get_recent(limit)
    };
    Json(json!({ "artifacts": artifacts, "summary": store.summary() }))
}

async fn artifacts_by_query_handler(
    State(state): State<Arc<AppState>>,
    Path(query_id): Path<String>,
) -> Json<serde_json::Value> {
    let artifacts = state.gateway.artifacts().get_by_query_id(&query_id);
    Json(json!({ "artifacts": artifacts }))
}

async fn manager_view_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let gateway = &state.gateway;
    let budget = gateway.budget();
    Json(json!({
        "providers": gateway.provider_health(),
        "budget": {
            "statuses": budget.statuses(),
            "emergencyMode": budget.is_emergency_mode(),
        },
        "cache": gateway.cache().stats().await,
        "analytics": gateway.analytics().summary(),
        "artifacts": gateway.artifacts().summary(),
        "recentArtifacts": gateway.artifacts().get_recent(10),
        "uptime": state.started.elapsed().as_secs(),
    }))
}

async fn metrics_handler() -> Response {
    let text = crate::metrics::gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        text,
    )
        .into_response()
}

fn param_usize(params: &HashMap<String, String>, key: &str) -> Option<usize> {
    params.get(key).and_then(|v| v.parse().ok())
}

// ── WebSocket fan-out ──────────────────────────────────────────────────

/// Wire envelope; JSON serialisation of event payloads happens only here.
#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: T,
    timestamp: u64,
}

fn envelope_text<T: Serialize>(kind: &str, data: T) -> String {
    serde_json::to_string(&Envelope { kind, data, timestamp: epoch_ms() })
        .unwrap_or_else(|_| format!("{{\"type\":\"{kind}\"}}"))
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    // Bearer token from the Authorization header or `?token=`. Tokens are
    // opaque here; an upstream proxy owns their meaning.
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| params.get("token").cloned());
    if token.is_none() {
        tracing::debug!(ip = %addr.ip(), "websocket connection without token");
    }

    if !state.ws_limiter.allow(addr.ip()) {
        let body = ApiError {
            error: "rate limited".to_string(),
            code: "RATE_LIMITED".to_string(),
            message: "too many connection attempts, try again later".to_string(),
            status_code: 429,
            details: None,
        };
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }
    ws.on_upgrade(move |socket| ws_session(state, socket))
}

/// Channels the client is currently subscribed to; shared with the
/// forwarder tasks which filter against it.
type ActiveChannels = Arc<std::sync::RwLock<std::collections::HashSet<Channel>>>;

/// Forward one channel's hub events into the session outbox as envelope
/// text. Exits when the outbox closes (session over) or the hub is gone.
async fn forward_channel(
    mut sub: ChannelSubscription,
    active: ActiveChannels,
    outbox: tokio::sync::mpsc::Sender<String>,
) {
    while let Some(event) = sub.recv().await {
        let channel = sub.channel();
        let subscribed = active.read().map(|set| set.contains(&channel)).unwrap_or(false);
        if !subscribed {
            continue;
        }
        let mut text = envelope_text(channel.as_str(), &event);
        let dropped = sub.dropped();
        if dropped > 0 {
            // Make back-pressure loss visible to the subscriber.
            text = envelope_text(channel.as_str(), json!({ "event": event, "dropped": dropped }));
        }
        if outbox.send(text).await.is_err() {
            break;
        }
    }
}

async fn ws_session(state: Arc<AppState>, mut socket: WebSocket) {
    state.ws_clients.fetch_add(1, Ordering::Relaxed);
    let hub = state.gateway.hub();

    // Default subscription: every channel.
    let active: ActiveChannels =
        Arc::new(std::sync::RwLock::new(Channel::ALL.iter().copied().collect()));
    let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::channel::<String>(64);
    let forwarders: Vec<tokio::task::JoinHandle<()>> = Channel::ALL
        .iter()
        .map(|ch| {
            tokio::spawn(forward_channel(hub.subscribe(*ch), active.clone(), outbox_tx.clone()))
        })
        .collect();
    drop(outbox_tx);

    let _ = socket
        .send(Message::Text(envelope_text(
            "connected",
            json!({ "channels": ["event", "health", "budget", "cache"] }),
        )))
        .await;

    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            forwarded = outbox_rx.recv() => {
                match forwarded {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > WS_PONG_DEADLINE {
                    warn!("websocket client missed pong deadline, dropping");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &active, &mut socket, &mut last_pong).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    for task in forwarders {
        task.abort();
    }
    state.ws_clients.fetch_sub(1, Ordering::Relaxed);
}

async fn handle_client_message(
    text: &str,
    active: &ActiveChannels,
    socket: &mut WebSocket,
    last_pong: &mut Instant,
) {
    let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
        let _ = socket
            .send(Message::Text(envelope_text("error", json!({ "message": "malformed message" }))))
            .await;
        return;
    };

    match msg.kind.as_str() {
        "pong" => *last_pong = Instant::now(),
        "ping" => {
            let _ = socket.send(Message::Text(envelope_text("pong", json!({})))).await;
        }
        "subscribe" | "unsubscribe" => {
            let Some(channel) = msg.channel.as_deref().and_then(Channel::parse) else {
                let _ = socket
                    .send(Message::Text(envelope_text(
                        "error",
                        json!({ "message": "unknown channel" }),
                    )))
                    .await;
                return;
            };
            let subscribing = msg.kind == "subscribe";
            if let Ok(mut set) = active.write() {
                if subscribing {
                    set.insert(channel);
                } else {
                    set.remove(&channel);
                }
            }
            let confirmation = if subscribing { "subscribed" } else { "unsubscribed" };
            let _ = socket
                .send(Message::Text(envelope_text(
                    confirmation,
                    json!({ "channel": channel.as_str() }),
                )))
                .await;
        }
        other => {
            let _ = socket
                .send(Message::Text(envelope_text(
                    "error",
                    json!({ "message": format!("unknown message type {other:?}") }),
                )))
                .await;
        }
    }
}

// ── WebSocket rate limiting ────────────────────────────────────────────

struct IpWindow {
    window_start: Instant,
    count: u32,
    blocked_until: Option<Instant>,
}

/// Fixed-window per-IP limiter with a block once the window overflows.
struct WsRateLimiter {
    per_minute: u32,
    block: Duration,
    windows: DashMap<IpAddr, IpWindow>,
}

impl WsRateLimiter {
    fn new(per_minute: u32, block: Duration) -> Self {
        Self { per_minute, block, windows: DashMap::new() }
    }

    fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(ip).or_insert_with(|| IpWindow {
            window_start: now,
            count: 0,
            blocked_until: None,
        });

        if let Some(until) = entry.blocked_until {
            if now < until {
                return false;
            }
            entry.blocked_until = None;
            entry.window_start = now;
            entry.count = 0;
        }

        if now.duration_since(entry.window_start) >= Duration::from_secs(60) {
            entry.window_start = now;
            entry.count = 0;
        }

        entry.count += 1;
        if entry.count > self.per_minute {
            entry.blocked_until = Some(now + self.block);
            warn!(ip = %ip, "websocket connection rate exceeded, blocking");
            return false;
        }
        true
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
