//! Dingo core library: DingTalk channel client, event broker, gateway manager and the
//! HTTP/WebSocket gateway used by the CLI.

pub mod broker;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod manager;
