//! Gateway HTTP + WebSocket server (single port).

use crate::channels::{StreamConnector, WebhookResponse};
use crate::config::{self, Config};
use crate::gateway::protocol::{error_response, ErrorBody, HealthResponse};
use crate::manager::{GatewayError, GatewayManager, SendMarkdownParams, SendReceipt, SendTextParams};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;

/// Shared state for the gateway routes.
#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<GatewayManager>,
    /// When Some, `/send/*` and `/events` require this bearer token.
    pub required_token: Option<String>,
    /// Port reported by the health endpoint.
    pub port: u16,
    /// Fired once on shutdown so open event sockets close.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl GatewayState {
    pub fn new(manager: Arc<GatewayManager>) -> Self {
        let required_token = config::resolve_gateway_token(manager.config());
        let port = manager.config().gateway.port;
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            manager,
            required_token,
            port,
            shutdown_tx,
        }
    }
}

/// Routes: health and push webhook are open; send and events sit behind the token check.
pub fn router(state: GatewayState) -> Router {
    let protected = Router::new()
        .route("/send/text", post(send_text))
        .route("/send/markdown", post(send_markdown))
        .route("/events", get(events_ws))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));
    Router::new()
        .route("/", get(health_http))
        .route("/dingtalk/webhook", post(dingtalk_webhook))
        .merge(protected)
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` completes, then close event
/// sockets and stop the manager.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: GatewayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let manager = state.manager.clone();
    let shutdown_tx = state.shutdown_tx.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = shutdown_tx.send(());
            manager.stop().await;
        })
        .await
        .context("gateway server exited")?;
    Ok(())
}

/// Start the manager and serve until Ctrl+C / SIGTERM, or until stream mode fails.
/// A stream failure is returned as an error so the process exits non-zero.
pub async fn run_gateway(config: Config, connector: Option<Arc<dyn StreamConnector>>) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    let port = config.gateway.port;
    if !config::is_loopback_bind(&bind) && config::resolve_gateway_token(&config).is_none() {
        log::warn!(
            "gateway bound to {} without a token; /send and /events are open (set gateway.token or GATEWAY_TOKEN)",
            bind
        );
    }

    let mut manager = GatewayManager::new(Arc::new(config));
    if let Some(connector) = connector {
        manager = manager.with_stream_connector(connector);
    }
    let manager = Arc::new(manager);
    manager.start().await.context("starting gateway manager")?;

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {} ({} mode)", bind_addr, manager.mode());

    let stream_failure = Arc::new(OnceLock::new());
    let stop = {
        let manager = manager.clone();
        let stream_failure = stream_failure.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => {},
                msg = manager.wait_stream_failure() => {
                    let _ = stream_failure.set(msg);
                }
            }
        }
    };
    serve(listener, GatewayState::new(manager), stop).await?;

    if let Some(msg) = stream_failure.get() {
        anyhow::bail!("stream mode failed: {}", msg);
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing event sockets and stopping channel");
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Bearer header, or `?token=` for WebSocket clients that cannot set headers.
async fn require_token(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let Some(required) = state.required_token.as_deref() else {
        return next.run(req).await;
    };
    let query_token = Query::<TokenQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.token);
    let provided = bearer_token(req.headers()).or(query_token.as_deref());
    if provided == Some(required) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::new("missing or invalid gateway token", "unauthorized")),
        )
            .into_response()
    }
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        runtime: "running".to_string(),
        channel: "dingtalk".to_string(),
        mode: state.manager.mode().to_string(),
        port: state.port,
    })
}

#[derive(Debug, Default, Deserialize)]
struct SignatureQuery {
    timestamp: Option<String>,
    sign: Option<String>,
    signature: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// POST /dingtalk/webhook: push-mode callback. Always 200; the body carries the outcome.
async fn dingtalk_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    query: Option<Query<SignatureQuery>>,
    body: Bytes,
) -> Json<WebhookResponse> {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let timestamp = header_str(&headers, "timestamp").or(query.timestamp).unwrap_or_default();
    // Platform callbacks use `sign`; `signature` is accepted as an alias.
    let sign = header_str(&headers, "sign")
        .or_else(|| header_str(&headers, "signature"))
        .or(query.sign)
        .or(query.signature)
        .unwrap_or_default();
    let body: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("dingtalk webhook: invalid JSON body: {}", e);
            return Json(WebhookResponse::err(e.to_string()));
        }
    };
    match state.manager.handle_webhook(body, &sign, &timestamp).await {
        Ok(res) => Json(res),
        Err(e) => Json(WebhookResponse::err(e.to_string())),
    }
}

fn send_result(result: Result<SendReceipt, GatewayError>) -> Response {
    match result {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => {
            log::warn!("gateway: send failed: {}", e);
            let (status, body) = error_response(&e);
            (status, Json(body)).into_response()
        }
    }
}

/// POST /send/text
async fn send_text(
    State(state): State<GatewayState>,
    Json(params): Json<SendTextParams>,
) -> Response {
    send_result(state.manager.send_text(params).await)
}

/// POST /send/markdown
async fn send_markdown(
    State(state): State<GatewayState>,
    Json(params): Json<SendMarkdownParams>,
) -> Response {
    send_result(state.manager.send_markdown(params).await)
}

/// GET /events upgrades to WebSocket; each inbound event is one JSON text frame.
async fn events_ws(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(mut socket: WebSocket, state: GatewayState) {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let mut sub = state.manager.register_listener().await;
    log::debug!("events client connected as {}", sub.id());

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            event = sub.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(t) => t,
                    Err(e) => {
                        log::error!("events: failed to encode event {}: {}", event.msg_id, e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.manager.unregister_listener(sub.id()).await;
    log::debug!("events client {} disconnected", sub.id());
}
