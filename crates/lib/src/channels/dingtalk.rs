//! DingTalk channel client: inbound normalization, signature checks, and outbound delivery.
//!
//! Outbound text prefers the per-conversation session webhook (reply shows inline in the
//! chat) and falls back to the work-notification API, which needs an access token. Rich
//! (markdown) content always goes through the work-notification API.

use crate::channels::inbound::{ChatbotMessage, InboundEvent, OutboundRequest};
use crate::channels::routes::{now_ms, DeliveryRouteCache};
use crate::channels::stream::{
    StreamAck, StreamConnector, StreamCredential, StreamError, StreamHandler, CHATBOT_TOPIC,
};
use crate::channels::token::{AuthError, OapiTokenFetcher, TokenCache, TokenFetcher};
use crate::config::DingTalkCredentials;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Fixed timeout for every upstream request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const WORK_NOTIFICATION_PATH: &str = "/topapi/message/corpconversation/asyncsend_v2";

/// Upstream errcodes meaning the access token is invalid or expired.
const TOKEN_ERRCODES: [i64; 2] = [40014, 42001];

/// Called once per accepted inbound event, on whatever thread delivered it.
pub type InboundCallback = Arc<dyn Fn(InboundEvent) + Send + Sync>;

/// How inbound events reach the client. Chosen at construction and fixed for its lifetime.
pub enum DeliveryMode {
    /// Persistent connection through a vendor connector; HTTP callbacks are refused.
    Stream {
        connector: Option<Arc<dyn StreamConnector>>,
    },
    /// Signed HTTP callbacks; `webhook_secret` of None disables signature checks.
    Push { webhook_secret: Option<String> },
}

impl DeliveryMode {
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryMode::Stream { .. } => "stream",
            DeliveryMode::Push { .. } => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendErrorKind {
    Timeout,
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send timed out")]
    Timeout,
    #[error("send message failed: {message}")]
    Rejected { code: Option<i64>, message: String },
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl SendError {
    pub fn kind(&self) -> SendErrorKind {
        match self {
            SendError::Timeout => SendErrorKind::Timeout,
            SendError::Auth(e) if e.is_timeout() => SendErrorKind::Timeout,
            SendError::Rejected { .. } | SendError::Auth(_) => SendErrorKind::Rejected,
        }
    }
}

fn transport_error(e: reqwest::Error) -> SendError {
    if e.is_timeout() {
        SendError::Timeout
    } else {
        SendError::Rejected {
            code: None,
            message: e.to_string(),
        }
    }
}

/// Push-mode callback outcome: `{"success": bool, "error"?: string}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamReply {
    errcode: Option<i64>,
    #[serde(default)]
    errmsg: Option<String>,
}

/// Settings the client needs beyond the delivery mode.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub credentials: DingTalkCredentials,
    pub api_base: String,
    pub request_timeout: Duration,
}

impl ChannelSettings {
    pub fn new(credentials: DingTalkCredentials, api_base: impl Into<String>) -> Self {
        Self {
            credentials,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Sign `"{timestamp}\n{secret}"` with HMAC-SHA256 keyed by `secret`; base64 of the digest.
pub fn webhook_signature(secret: &str, timestamp: &str) -> String {
    let string_to_sign = format!("{}\n{}", timestamp, secret);
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(string_to_sign.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}

/// Client for one DingTalk application.
pub struct ChannelClient {
    credentials: DingTalkCredentials,
    api_base: String,
    mode: DeliveryMode,
    http: reqwest::Client,
    tokens: TokenCache,
    routes: Arc<DeliveryRouteCache>,
    on_inbound: InboundCallback,
}

impl ChannelClient {
    pub fn new(
        settings: ChannelSettings,
        mode: DeliveryMode,
        on_inbound: InboundCallback,
    ) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        let fetcher = OapiTokenFetcher::new(
            settings.api_base.clone(),
            settings.credentials.client_id.clone(),
            settings.credentials.client_secret.clone(),
            http.clone(),
        );
        let client_id = &settings.credentials.client_id;
        log::info!(
            "dingtalk: client initialized with client_id {}... ({} mode)",
            client_id.chars().take(10).collect::<String>(),
            mode.name()
        );
        Ok(Self {
            credentials: settings.credentials,
            api_base: settings.api_base,
            mode,
            http,
            tokens: TokenCache::new(Arc::new(fetcher)),
            routes: Arc::new(DeliveryRouteCache::new()),
            on_inbound,
        })
    }

    /// Replace the token source (e.g. a different credential flow).
    pub fn with_token_fetcher(mut self, fetcher: Arc<dyn TokenFetcher>) -> Self {
        self.tokens = TokenCache::new(fetcher);
        self
    }

    pub fn mode(&self) -> &DeliveryMode {
        &self.mode
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    pub fn routes(&self) -> &Arc<DeliveryRouteCache> {
        &self.routes
    }

    /// Open the stream connection and run it until the connector gives up.
    /// No-op in push mode. Fails when no connector is available or the connection fails.
    pub async fn start(self: Arc<Self>) -> Result<(), StreamError> {
        let DeliveryMode::Stream { connector } = &self.mode else {
            log::warn!("dingtalk: stream mode is disabled");
            return Ok(());
        };
        let Some(connector) = connector.clone() else {
            log::error!("dingtalk: no stream connector available for stream mode");
            return Err(StreamError::Unavailable(
                "no stream connector configured".to_string(),
            ));
        };
        let credential = StreamCredential {
            client_id: self.credentials.client_id.clone(),
            client_secret: self.credentials.client_secret.clone(),
        };
        log::info!("dingtalk: starting stream connection");
        let handler = self.stream_handler();
        connector
            .run(credential, CHATBOT_TOPIC, handler)
            .await
            .map_err(|e| {
                log::error!("dingtalk: stream connection failed: {}", e);
                e
            })
    }

    /// Handler handed to the stream connector. Holds a strong reference to the client.
    pub fn stream_handler(self: &Arc<Self>) -> StreamHandler {
        let client = Arc::clone(self);
        Arc::new(move |data: serde_json::Value| client.handle_stream_callback(data))
    }

    /// Parse one raw stream callback and forward it. Never panics into the caller.
    pub fn handle_stream_callback(&self, data: serde_json::Value) -> StreamAck {
        match serde_json::from_value::<ChatbotMessage>(data) {
            Ok(msg) => match self.dispatch(&msg) {
                Ok(()) => StreamAck::Ok,
                Err(e) => StreamAck::SystemException(e),
            },
            Err(e) => {
                log::error!("dingtalk: error processing stream message: {}", e);
                StreamAck::SystemException(e.to_string())
            }
        }
    }

    fn dispatch(&self, msg: &ChatbotMessage) -> Result<(), String> {
        let Some(event) = self.accept_inbound(msg) else {
            return Ok(());
        };
        log::info!(
            "dingtalk: received message from {}: {}",
            event.sender_name,
            preview(&event.content)
        );
        let on_inbound = &self.on_inbound;
        std::panic::catch_unwind(AssertUnwindSafe(|| on_inbound(event))).map_err(|_| {
            log::error!("dingtalk: inbound callback panicked");
            "inbound callback panicked".to_string()
        })
    }

    /// Normalize a raw payload. Group messages that do not address the bot are dropped.
    /// When the payload carries a session webhook it is remembered for the sender.
    pub fn accept_inbound(&self, msg: &ChatbotMessage) -> Option<InboundEvent> {
        let is_group = msg.is_group();
        let at_me = msg.is_in_at_list.unwrap_or(false);
        if is_group && !at_me {
            log::debug!("dingtalk: group message without mention, skipping");
            return None;
        }

        let sender = msg.sender();
        if let Some(webhook) = msg.session_webhook.as_deref().filter(|s| !s.is_empty()) {
            if !sender.is_empty() {
                self.routes.remember(
                    sender.clone(),
                    webhook,
                    msg.session_webhook_expired_time.unwrap_or(0),
                    msg.conversation_id.clone(),
                );
                log::debug!("dingtalk: cached session webhook for {}", sender);
            }
        }

        let sender_name = msg
            .sender_nick
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| sender.clone());
        Some(InboundEvent {
            msg_id: msg.msg_id.clone(),
            sender,
            sender_name,
            receiver: self.credentials.client_id.clone(),
            content: msg.content().to_string(),
            is_group,
            timestamp: now_ms(),
            room_id: if is_group {
                msg.conversation_id.clone()
            } else {
                None
            },
            room_name: msg.conversation_title.clone(),
            at_me: is_group.then_some(at_me),
        })
    }

    /// Check a push-mode signature. Always true when no secret is configured.
    pub fn verify_signature(&self, timestamp: &str, signature: &str) -> bool {
        match &self.mode {
            DeliveryMode::Push {
                webhook_secret: Some(secret),
            } => webhook_signature(secret, timestamp) == signature,
            _ => true,
        }
    }

    /// Verify and accept one push-mode callback body.
    pub fn handle_webhook(
        &self,
        body: serde_json::Value,
        signature: &str,
        timestamp: &str,
    ) -> WebhookResponse {
        if matches!(self.mode, DeliveryMode::Stream { .. }) {
            log::warn!("dingtalk: received webhook request but stream mode is enabled");
            return WebhookResponse::err("webhook_disabled");
        }
        if !self.verify_signature(timestamp, signature) {
            log::warn!("dingtalk: invalid webhook signature");
            return WebhookResponse::err("invalid_signature");
        }
        let msg: ChatbotMessage = match serde_json::from_value(body) {
            Ok(m) => m,
            Err(e) => {
                log::error!("dingtalk: error handling webhook: {}", e);
                return WebhookResponse::err(e.to_string());
            }
        };
        match self.dispatch(&msg) {
            Ok(()) => WebhookResponse::ok(),
            Err(e) => WebhookResponse::err(e),
        }
    }

    /// Send text. Uses the cached session webhook when it is still valid; any failure there
    /// falls back to the work-notification API, whose failure is the one reported.
    pub async fn send(&self, request: &OutboundRequest) -> Result<(), SendError> {
        if let Some(webhook) = self.routes.resolve(&request.target) {
            match self.send_via_session_webhook(&webhook, request).await {
                Ok(()) => {
                    log::info!("dingtalk: message sent to chat via session webhook: {}", request.target);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "dingtalk: session webhook send failed, falling back to work notification: {}",
                        e
                    );
                }
            }
        }
        log::info!(
            "dingtalk: sending via work notification (no active session webhook for {})",
            request.target
        );
        let msg = json!({
            "msgtype": "text",
            "text": { "content": request.content },
        });
        self.send_work_notification(&request.target, msg).await
    }

    /// Send markdown through the work-notification API. No fallback.
    pub async fn send_rich(&self, target: &str, title: &str, body: &str) -> Result<(), SendError> {
        let msg = json!({
            "msgtype": "markdown",
            "markdown": { "title": title, "text": body },
        });
        self.send_work_notification(target, msg).await
    }

    async fn send_via_session_webhook(
        &self,
        webhook: &str,
        request: &OutboundRequest,
    ) -> Result<(), SendError> {
        let mut body = json!({
            "msgtype": "text",
            "text": { "content": request.content },
        });
        if let Some(at) = request.at_list.as_ref().filter(|l| !l.is_empty()) {
            body["at"] = json!({ "atUserIds": at });
        }
        let res = self
            .http
            .post(webhook)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_upstream_reply(res).await
    }

    /// POST asyncsend_v2 with the current access token.
    async fn send_work_notification(
        &self,
        target: &str,
        msg: serde_json::Value,
    ) -> Result<(), SendError> {
        let access_token = self.tokens.get_token().await?;
        let url = format!("{}{}", self.api_base, WORK_NOTIFICATION_PATH);
        let body = json!({
            "agent_id": self.credentials.agent_id,
            "userid_list": target,
            "msg": msg,
        });
        let res = self
            .http
            .post(&url)
            .query(&[("access_token", access_token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        match check_upstream_reply(res).await {
            Ok(()) => {
                log::info!("dingtalk: work notification sent to {}", target);
                Ok(())
            }
            Err(e) => {
                if let SendError::Rejected {
                    code: Some(code), ..
                } = &e
                {
                    if TOKEN_ERRCODES.contains(code) {
                        self.tokens.invalidate().await;
                    }
                }
                log::error!("dingtalk: failed to send message to {}: {}", target, e);
                Err(e)
            }
        }
    }
}

/// Success means HTTP 2xx with `errcode == 0`.
async fn check_upstream_reply(res: reqwest::Response) -> Result<(), SendError> {
    let status = res.status();
    let text = res.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(SendError::Rejected {
            code: None,
            message: format!("{} {}", status, text),
        });
    }
    let reply: UpstreamReply = serde_json::from_str(&text).map_err(|e| SendError::Rejected {
        code: None,
        message: format!("invalid upstream response: {}", e),
    })?;
    match reply.errcode {
        Some(0) => Ok(()),
        code => Err(SendError::Rejected {
            code,
            message: reply.errmsg.unwrap_or_default(),
        }),
    }
}
