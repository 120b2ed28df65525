//! Stream-mode collaborator: the vendor connection that pushes chatbot callbacks.
//!
//! The transport itself lives behind [`StreamConnector`]. It receives the app credential and
//! a handler; it owns reconnection and calls the handler once per callback, possibly from a
//! thread that is not part of the gateway's runtime.

use async_trait::async_trait;
use std::sync::Arc;

/// Topic the chatbot handler is registered under.
pub const CHATBOT_TOPIC: &str = "/v1.0/im/bot/messages/get";

/// App credential used to open the stream connection.
#[derive(Debug, Clone)]
pub struct StreamCredential {
    pub client_id: String,
    pub client_secret: String,
}

/// Acknowledgement returned to the connector for one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAck {
    Ok,
    SystemException(String),
}

/// Handler invoked synchronously by the connector with the raw callback `data` payload.
pub type StreamHandler = Arc<dyn Fn(serde_json::Value) -> StreamAck + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream connector unavailable: {0}")]
    Unavailable(String),
    #[error("stream connection failed: {0}")]
    Handshake(String),
}

/// Opens and runs the persistent connection. Returns only when the connection is gone for good.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn run(
        &self,
        credential: StreamCredential,
        topic: &str,
        handler: StreamHandler,
    ) -> Result<(), StreamError>;
}
