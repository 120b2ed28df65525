//! Configuration types and loading.
//!
//! Config is loaded once at process start from a JSON file (e.g. `~/.dingo/config.json`)
//! and then overridden by environment variables. Immutable after load.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_API_BASE: &str = "https://oapi.dingtalk.com";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway listen and API auth settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// DingTalk channel credentials and delivery mode.
    #[serde(default)]
    pub dingtalk: DingTalkConfig,

    /// Subscriber queue settings.
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Gateway bind, port, and API token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 8099). Overridden by GATEWAY_PORT env.
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "0.0.0.0"). Overridden by GATEWAY_HOST env.
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Bearer token required by the send and events endpoints. Overridden by GATEWAY_TOKEN env.
    pub token: Option<String>,
}

fn default_gateway_port() -> u16 {
    8099
}

fn default_gateway_bind() -> String {
    "0.0.0.0".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            token: None,
        }
    }
}

/// DingTalk application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DingTalkConfig {
    /// Application client id (appkey). Overridden by DINGTALK_CLIENT_ID env.
    pub client_id: Option<String>,
    /// Application client secret (appsecret). Overridden by DINGTALK_CLIENT_SECRET env.
    pub client_secret: Option<String>,
    /// Agent id used by the work-notification API. Overridden by DINGTALK_AGENT_ID env.
    pub agent_id: Option<String>,
    /// Stream mode when true (default); push (signed HTTP callback) mode when false.
    #[serde(default = "default_use_stream")]
    pub use_stream: bool,
    /// Shared secret for push-mode signature checks. When absent, signatures are not checked.
    pub webhook_secret: Option<String>,
    /// Base URL of the open platform API.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Interval in seconds between sweeps of expired reply routes.
    #[serde(default = "default_route_sweep_secs")]
    pub route_sweep_secs: u64,
}

fn default_use_stream() -> bool {
    true
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_route_sweep_secs() -> u64 {
    600
}

impl Default for DingTalkConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            agent_id: None,
            use_stream: default_use_stream(),
            webhook_secret: None,
            api_base: default_api_base(),
            route_sweep_secs: default_route_sweep_secs(),
        }
    }
}

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Capacity of each subscriber queue (default 256). Events for a full queue are dropped for that subscriber.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Credentials required to talk to the platform, resolved from config and env.
#[derive(Debug, Clone)]
pub struct DingTalkCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub agent_id: String,
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the gateway API token: env GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    non_empty_env("GATEWAY_TOKEN").or_else(|| non_empty(config.gateway.token.as_ref()))
}

/// Resolve the webhook secret: env DINGTALK_WEBHOOK_SECRET overrides config.
pub fn resolve_webhook_secret(config: &Config) -> Option<String> {
    non_empty_env("DINGTALK_WEBHOOK_SECRET")
        .or_else(|| non_empty(config.dingtalk.webhook_secret.as_ref()))
}

/// Resolve client id, secret and agent id. Fails when any of them is missing.
pub fn resolve_credentials(config: &Config) -> Result<DingTalkCredentials> {
    credentials_from(config, non_empty_env)
}

/// Credential resolution with an injected env lookup.
fn credentials_from(
    config: &Config,
    env: impl Fn(&str) -> Option<String>,
) -> Result<DingTalkCredentials> {
    let dt = &config.dingtalk;
    let client_id = env("DINGTALK_CLIENT_ID").or_else(|| non_empty(dt.client_id.as_ref()));
    let client_secret =
        env("DINGTALK_CLIENT_SECRET").or_else(|| non_empty(dt.client_secret.as_ref()));
    let agent_id = env("DINGTALK_AGENT_ID").or_else(|| non_empty(dt.agent_id.as_ref()));
    match (client_id, client_secret, agent_id) {
        (Some(client_id), Some(client_secret), Some(agent_id)) => Ok(DingTalkCredentials {
            client_id,
            client_secret,
            agent_id,
        }),
        (None, _, _) | (_, None, _) => {
            anyhow::bail!("dingtalk clientId and clientSecret are required")
        }
        (_, _, None) => anyhow::bail!("dingtalk agentId is required for sending messages"),
    }
}

/// True if the bind address is loopback.
pub fn is_loopback_bind(bind: &str) -> bool {
    matches!(bind.trim(), "127.0.0.1" | "::1" | "localhost")
}

/// Apply env overrides that are plain values rather than secrets (host, port, mode).
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(host) = non_empty_env("GATEWAY_HOST") {
        config.gateway.bind = host;
    }
    if let Some(port) = non_empty_env("GATEWAY_PORT") {
        config.gateway.port = port
            .parse()
            .with_context(|| format!("parsing GATEWAY_PORT={}", port))?;
    }
    if let Some(flag) = non_empty_env("DINGTALK_USE_STREAM") {
        config.dingtalk.use_stream = parse_stream_flag(&flag);
    }
    Ok(())
}

/// Only "true" (case-insensitive) enables stream mode.
pub fn parse_stream_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("DINGO_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".dingo").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Env overrides for host, port and mode are applied; secrets are resolved on demand.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config)?;
    Ok((config, path))
}
