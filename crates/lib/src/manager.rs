//! Gateway manager: owns the channel client and the event broker, and exposes send/receive
//! operations to the API layer.
//!
//! The channel client reports inbound events through a synchronous callback that may run on
//! a thread outside the gateway runtime. The callback only pushes onto an unbounded queue; a
//! pump task spawned on the runtime captured at `start()` drains it into the broker. The
//! caller is never blocked and a failing publish stays inside the pump.

use crate::broker::{EventBroker, Subscription};
use crate::channels::routes::now_ms;
use crate::channels::{
    ChannelClient, ChannelSettings, DeliveryMode, DeliveryRouteCache, InboundCallback,
    InboundEvent, OutboundRequest, SendError, StreamConnector, WebhookResponse,
};
use crate::config::{self, Config};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

pub const DEFAULT_MARKDOWN_TITLE: &str = "通知";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway client not started")]
    NotStarted,
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("gateway config error: {0}")]
    Config(String),
}

/// Body of a text send: `{target, content, at_list?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTextParams {
    pub target: String,
    pub content: String,
    #[serde(default)]
    pub at_list: Option<Vec<String>>,
}

/// Body of a markdown send: `{target, title?, content}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMarkdownParams {
    pub target: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
}

/// Successful send result: `{"status": "sent"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub status: String,
}

impl SendReceipt {
    fn sent() -> Self {
        Self {
            status: "sent".to_string(),
        }
    }
}

struct Running {
    client: Arc<ChannelClient>,
    tasks: Vec<JoinHandle<()>>,
}

/// Coordinates one channel client and one broker.
pub struct GatewayManager {
    config: Arc<Config>,
    connector: Option<Arc<dyn StreamConnector>>,
    broker: Arc<EventBroker>,
    running: Mutex<Option<Running>>,
    stream_failure: watch::Sender<Option<String>>,
}

impl GatewayManager {
    pub fn new(config: Arc<Config>) -> Self {
        let broker = Arc::new(EventBroker::new(config.broker.queue_capacity));
        let (stream_failure, _) = watch::channel(None);
        Self {
            config,
            connector: None,
            broker,
            running: Mutex::new(None),
            stream_failure,
        }
    }

    /// Stream-mode connector. Without one, starting in stream mode reports a stream failure.
    pub fn with_stream_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// "stream" or "push", as configured.
    pub fn mode(&self) -> &'static str {
        if self.config.dingtalk.use_stream {
            "stream"
        } else {
            "push"
        }
    }

    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bind to the current runtime, build the client and start inbound processing.
    /// A second call while started is a no-op.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        // A failure from an earlier run must not end this one.
        self.stream_failure.send_replace(None);
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GatewayError::Config(format!("no tokio runtime: {}", e)))?;
        let credentials = config::resolve_credentials(&self.config)
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();
        let mode = if self.config.dingtalk.use_stream {
            DeliveryMode::Stream {
                connector: self.connector.clone(),
            }
        } else {
            DeliveryMode::Push {
                webhook_secret: config::resolve_webhook_secret(&self.config),
            }
        };
        let settings = ChannelSettings::new(credentials, self.config.dingtalk.api_base.clone());
        let client = ChannelClient::new(settings, mode, bridge_callback(bridge_tx))
            .map_err(|e| GatewayError::Config(format!("building http client: {}", e)))?;
        let client = Arc::new(client);

        let mut tasks = vec![runtime.spawn(pump_inbound(self.broker.clone(), bridge_rx))];
        let sweep_every = Duration::from_secs(self.config.dingtalk.route_sweep_secs.max(1));
        tasks.push(runtime.spawn(sweep_routes(client.routes().clone(), sweep_every)));

        if self.config.dingtalk.use_stream {
            let stream_client = client.clone();
            let failure = self.stream_failure.clone();
            tasks.push(runtime.spawn(async move {
                if let Err(e) = stream_client.start().await {
                    log::error!("gateway: stream mode stopped: {}", e);
                    failure.send_replace(Some(e.to_string()));
                }
            }));
        }

        log::info!(
            "gateway manager started with channel: dingtalk ({} mode)",
            client.mode().name()
        );
        *running = Some(Running { client, tasks });
        Ok(())
    }

    /// Stop inbound processing and drop the client. Safe to call when never started.
    /// In-flight sends hold their own client handle and are not cancelled.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        for task in running.tasks {
            task.abort();
        }
        log::info!("gateway manager stopped");
    }

    /// Resolves with the error message once the stream connection fails for good.
    pub async fn wait_stream_failure(&self) -> String {
        let mut rx = self.stream_failure.subscribe();
        let failure = rx
            .wait_for(|v| v.is_some())
            .await
            .map(|v| v.clone().unwrap_or_default());
        match failure {
            Ok(msg) => msg,
            // The sender lives as long as self.
            Err(_) => std::future::pending().await,
        }
    }

    pub async fn register_listener(&self) -> Subscription {
        self.broker.subscribe().await
    }

    pub async fn unregister_listener(&self, id: &str) {
        self.broker.unsubscribe(id).await;
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    async fn client(&self) -> Result<Arc<ChannelClient>, GatewayError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.client.clone())
            .ok_or(GatewayError::NotStarted)
    }

    pub async fn send_text(&self, params: SendTextParams) -> Result<SendReceipt, GatewayError> {
        let client = self.client().await?;
        let request = OutboundRequest {
            target: params.target,
            content: params.content,
            at_list: params.at_list,
        };
        client.send(&request).await?;
        Ok(SendReceipt::sent())
    }

    pub async fn send_markdown(
        &self,
        params: SendMarkdownParams,
    ) -> Result<SendReceipt, GatewayError> {
        let client = self.client().await?;
        let title = params
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MARKDOWN_TITLE.to_string());
        client
            .send_rich(&params.target, &title, &params.content)
            .await?;
        Ok(SendReceipt::sent())
    }

    /// Push-mode callback entry point.
    pub async fn handle_webhook(
        &self,
        body: serde_json::Value,
        signature: &str,
        timestamp: &str,
    ) -> Result<WebhookResponse, GatewayError> {
        let client = self.client().await?;
        Ok(client.handle_webhook(body, signature, timestamp))
    }
}

/// Callback safe to invoke from any thread: enqueues and returns immediately.
fn bridge_callback(tx: mpsc::UnboundedSender<InboundEvent>) -> InboundCallback {
    Arc::new(move |event: InboundEvent| {
        log::debug!("gateway: incoming message event {}", event.msg_id);
        if tx.send(event).is_err() {
            log::warn!("gateway: inbound bridge closed, dropping event");
        }
    })
}

async fn pump_inbound(broker: Arc<EventBroker>, mut rx: mpsc::UnboundedReceiver<InboundEvent>) {
    while let Some(event) = rx.recv().await {
        let msg_id = event.msg_id.clone();
        match AssertUnwindSafe(broker.publish(event)).catch_unwind().await {
            Ok(n) => log::debug!("gateway: event {} delivered to {} subscriber(s)", msg_id, n),
            Err(_) => log::error!("gateway: publishing event {} panicked", msg_id),
        }
    }
    log::debug!("gateway: inbound bridge drained");
}

async fn sweep_routes(routes: Arc<DeliveryRouteCache>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let removed = routes.purge_expired(now_ms());
        if removed > 0 {
            log::debug!("gateway: purged {} expired reply route(s)", removed);
        }
    }
}
