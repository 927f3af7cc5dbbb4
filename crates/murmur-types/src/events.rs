use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Chat, ChatId, ConnectionId, GroupSettings, Message, MessageId, Role, UserId};

/// Events sent over the WebSocket gateway.
///
/// Delivery is per connection: a user with three live connections receives
/// each event three times.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready {
        user_id: UserId,
        username: String,
        connection_id: ConnectionId,
    },

    /// A new message was posted to a chat the receiver participates in
    NewMessage { message: Message },

    /// A message was edited or deleted
    MessageUpdated { message: Message },

    /// Sent only to the connection that submitted the message, before the
    /// fan-out, so the client can swap its optimistic copy for the real id.
    MessageCorrelationConfirmation {
        correlation_id: String,
        message_id: MessageId,
    },

    /// One of the receiver's messages was read
    MessageRead {
        chat_id: ChatId,
        message_id: MessageId,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },

    /// A user came online or went offline
    UserStatusChanged {
        user_id: UserId,
        is_online: bool,
        last_seen_at: Option<DateTime<Utc>>,
    },

    /// A user started or stopped typing
    UserTyping {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },

    ChatCreated { chat: Chat },

    MembersAdded {
        chat_id: ChatId,
        added_by: UserId,
        user_ids: Vec<UserId>,
    },

    MemberRemoved {
        chat_id: ChatId,
        user_id: UserId,
        removed_by: UserId,
    },

    MemberLeft { chat_id: ChatId, user_id: UserId },

    MemberRoleUpdated {
        chat_id: ChatId,
        user_id: UserId,
        role: Role,
    },

    OwnershipTransferred {
        chat_id: ChatId,
        previous_owner_id: UserId,
        new_owner_id: UserId,
    },

    GroupInfoUpdated {
        chat_id: ChatId,
        title: Option<String>,
        description: Option<String>,
        avatar_url: Option<String>,
    },

    GroupSettingsUpdated {
        chat_id: ChatId,
        settings: GroupSettings,
    },

    /// Sent before the group is purged so clients can still resolve it
    GroupDeleted { chat_id: ChatId },

    /// A command from this connection was rejected. `code` is one of
    /// `forbidden`, `not_found`, `invalid_state`, `invalid_input` or `internal`.
    Error {
        code: String,
        correlation_id: Option<String>,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    SendMessage {
        chat_id: ChatId,
        content: String,
        #[serde(default)]
        correlation_id: Option<String>,
    },

    MarkRead { message_id: MessageId },

    MarkReadBatch { message_ids: Vec<MessageId> },

    SetTyping { chat_id: ChatId, is_typing: bool },
}

impl GatewayCommand {
    /// Action name used for logging and handler lookup.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::SendMessage { .. } => "send_message",
            Self::MarkRead { .. } => "mark_read",
            Self::MarkReadBatch { .. } => "mark_read_batch",
            Self::SetTyping { .. } => "set_typing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_adjacent_tagging() {
        let raw = r#"{"type":"SendMessage","data":{"chat_id":"6f1c2d6e-8a2e-4a3b-9d53-0f2d6a7c9b10","content":"hi"}}"#;
        match serde_json::from_str::<GatewayCommand>(raw).unwrap() {
            GatewayCommand::SendMessage {
                content,
                correlation_id,
                ..
            } => {
                assert_eq!(content, "hi");
                assert!(correlation_id.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn status_event_shape() {
        let event = GatewayEvent::UserStatusChanged {
            user_id: 7,
            is_online: true,
            last_seen_at: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "UserStatusChanged");
        assert_eq!(json["data"]["user_id"], 7);
        assert_eq!(json["data"]["is_online"], true);
    }
}
