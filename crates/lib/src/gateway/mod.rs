//! Gateway: HTTP + WebSocket surface over the gateway manager.
//!
//! Single port serves health, the push-mode webhook, send endpoints and the `/events`
//! WebSocket feed of inbound messages.

mod protocol;
mod server;

pub use protocol::{error_response, ErrorBody, HealthResponse};
pub use server::{router, run_gateway, serve, GatewayState};
