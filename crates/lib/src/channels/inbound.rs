//! Inbound and outbound message shapes shared by the channel client, broker and API.

use serde::{Deserialize, Serialize};

/// Conversation type value the platform uses for group chats ("1" is a direct chat).
pub const GROUP_CONVERSATION_TYPE: &str = "2";

/// One received message, normalized. Each broker subscriber gets its own clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub msg_id: String,
    pub sender: String,
    pub sender_name: String,
    /// Channel identity that received the message (the application client id).
    pub receiver: String,
    pub content: String,
    pub is_group: bool,
    /// Arrival time, Unix ms.
    pub timestamp: i64,
    /// Group conversation id; only set for group messages.
    pub room_id: Option<String>,
    pub room_name: Option<String>,
    /// Whether the bot was addressed; only set for group messages.
    pub at_me: Option<bool>,
}

/// Send intent from the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub target: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_list: Option<Vec<String>>,
}

/// Raw chatbot payload as delivered by the stream SDK and by HTTP robot callbacks.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotMessage {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub msgtype: Option<String>,
    #[serde(default)]
    pub text: Option<ChatbotText>,
    #[serde(default)]
    pub conversation_type: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub conversation_title: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_staff_id: Option<String>,
    #[serde(default)]
    pub sender_nick: Option<String>,
    #[serde(default)]
    pub chatbot_user_id: Option<String>,
    #[serde(default)]
    pub session_webhook: Option<String>,
    /// Unix ms after which `session_webhook` must not be used.
    #[serde(default)]
    pub session_webhook_expired_time: Option<i64>,
    #[serde(default)]
    pub is_in_at_list: Option<bool>,
    #[serde(default)]
    pub create_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatbotText {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatbotMessage {
    pub fn is_group(&self) -> bool {
        self.conversation_type.as_deref() == Some(GROUP_CONVERSATION_TYPE)
    }

    /// Staff id when present, otherwise the opaque sender id.
    pub fn sender(&self) -> String {
        self.sender_staff_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.sender_id.as_deref())
            .unwrap_or_default()
            .to_string()
    }

    pub fn content(&self) -> &str {
        self.text
            .as_ref()
            .and_then(|t| t.content.as_deref())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_payload_fields() {
        let raw = serde_json::json!({
            "msgId": "m1",
            "msgtype": "text",
            "text": { "content": " hello " },
            "conversationType": "2",
            "conversationId": "cid-1",
            "conversationTitle": "ops",
            "senderId": "$:LWCP:abc",
            "senderStaffId": "staff-7",
            "senderNick": "Ana",
            "sessionWebhook": "https://example.invalid/robot/send?session=1",
            "sessionWebhookExpiredTime": 1_700_000_000_000i64,
            "isInAtList": true
        });
        let msg: ChatbotMessage = serde_json::from_value(raw).unwrap();
        assert!(msg.is_group());
        assert_eq!(msg.sender(), "staff-7");
        assert_eq!(msg.content(), " hello ");
        assert_eq!(msg.session_webhook_expired_time, Some(1_700_000_000_000));
    }

    #[test]
    fn sender_falls_back_to_sender_id() {
        let msg = ChatbotMessage {
            sender_id: Some("opaque".into()),
            sender_staff_id: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(msg.sender(), "opaque");
        assert_eq!(msg.content(), "");
        assert!(!msg.is_group());
    }
}
