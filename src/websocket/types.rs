use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::message::message_models::{Attachment, MessageResponse};

/// Server-to-client events: `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    OnlineUsers(Vec<Uuid>),
    NewMessage(NewMessagePayload),
    MessageNotification(MessageNotificationPayload),
    MessageSent(MessageSentPayload),
    MessageError(MessageErrorPayload),
    UserTyping(TypingPayload),
    UserStopTyping(TypingPayload),
    MessagesRead(MessagesReadPayload),
    Error(ErrorPayload),
    Ping,
    Pong,
}

impl WsMessage {
    pub fn error(message: impl Into<String>) -> Self {
        WsMessage::Error(ErrorPayload {
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub message: MessageResponse,
    pub conversation_id: Uuid,
    pub temp_id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageNotificationPayload {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentPayload {
    pub temp_id: Option<Value>,
    pub message: MessageResponse,
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageErrorPayload {
    pub temp_id: Option<Value>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagesReadPayload {
    pub conversation_id: Uuid,
    pub read_by: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
}

// Client-to-server messages
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinConversation(Uuid),
    LeaveConversation(Uuid),
    SendMessage(SendMessagePayload),
    TypingStart(TypingSignal),
    TypingStop(TypingSignal),
    MarkAsRead(MarkAsReadPayload),
    Ping,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub receiver_id: Uuid,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub conversation_id: Option<Uuid>,
    pub temp_id: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: Uuid,
    pub receiver_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsReadPayload {
    pub conversation_id: Uuid,
}

/// A frame that could not be turned into a `ClientMessage`.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedFrame {
    pub reason: String,
    /// Set when the frame was recognisably a `send_message`, so the failure
    /// can be reported against the client's optimistic copy.
    pub send_temp_id: Option<Option<Value>>,
}

impl RejectedFrame {
    pub fn into_event(self) -> WsMessage {
        match self.send_temp_id {
            Some(temp_id) => WsMessage::MessageError(MessageErrorPayload {
                temp_id,
                error: self.reason,
            }),
            None => WsMessage::error(self.reason),
        }
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, RejectedFrame> {
        let raw: Value = serde_json::from_str(text).map_err(|e| RejectedFrame {
            reason: format!("Invalid message format: {}", e),
            send_temp_id: None,
        })?;

        let send_temp_id = (raw.get("event").and_then(Value::as_str) == Some("send_message"))
            .then(|| raw.get("data").and_then(|d| d.get("tempId")).cloned());

        serde_json::from_value(raw).map_err(|e| RejectedFrame {
            reason: format!("Invalid message format: {}", e),
            send_temp_id,
        })
    }
}
