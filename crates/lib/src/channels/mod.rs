//! DingTalk channel: token lifecycle, reply-route cache, stream collaborator, and the client
//! that ties them together.
//!
//! Inbound payloads are normalized into [`InboundEvent`] and handed to a callback; outbound
//! sends pick the session webhook when valid and the work-notification API otherwise.

mod dingtalk;
mod inbound;
pub mod routes;
pub mod stream;
pub mod token;

pub use dingtalk::{
    webhook_signature, ChannelClient, ChannelSettings, DeliveryMode, InboundCallback, SendError,
    SendErrorKind, WebhookResponse, DEFAULT_REQUEST_TIMEOUT,
};
pub use inbound::{ChatbotMessage, ChatbotText, InboundEvent, OutboundRequest};
pub use routes::{DeliveryRouteCache, RouteCacheEntry};
pub use stream::{StreamAck, StreamConnector, StreamCredential, StreamError, StreamHandler};
pub use token::{AuthError, FetchedToken, OapiTokenFetcher, TokenCache, TokenFetcher};
