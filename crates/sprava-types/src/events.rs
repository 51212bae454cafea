use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ConversationId, MessageId, PresenceStatus, UserId};

/// Events sent FROM client TO server over the WebSocket.
///
/// The envelope is `{"type": <kind>, ...fields}`. Kinds this server does not
/// know about decode to [`ClientEvent::Unknown`] and are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage { receiver_id: UserId, content: String },

    Typing { receiver_id: UserId },

    StopTyping { receiver_id: UserId },

    MarkRead { conversation_id: ConversationId },

    GetOnlineFriends,

    #[serde(other)]
    Unknown,
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stop_typing",
            Self::MarkRead { .. } => "mark_read",
            Self::GetOnlineFriends => "get_online_friends",
            Self::Unknown => "unknown",
        }
    }
}

/// Events pushed FROM server TO client sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was persisted in a conversation the recipient is part of.
    NewMessage {
        message_id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        timestamp: DateTime<Utc>,
    },

    /// Ephemeral typing indicator, never persisted
    UserTyping { user_id: UserId, is_typing: bool },

    /// `user_id` has read the messages addressed to them in the conversation
    MessagesRead {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    OnlineFriends { friends: Vec<UserId> },

    FriendStatusChange {
        user_id: UserId,
        status: PresenceStatus,
    },

    /// A conversation was opened by `user_id`
    NewConversation {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    ConversationDeleted {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
    },

    /// `user_id` asked the recipient to be friends
    NewFriendRequest { user_id: UserId },

    /// `user_id` accepted the recipient's friend request
    FriendRequestAccepted { user_id: UserId },

    /// A rejected request, delivered only to the session that sent it
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Forbidden,
    NotFound,
    InvalidRequest,
    StoreFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flat_envelope() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"send_message","receiver_id":2,"content":"hi"}"#)
                .unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage {
                receiver_id: 2,
                content: "hi".into()
            }
        );

        let event: ClientEvent = serde_json::from_str(r#"{"type":"get_online_friends"}"#).unwrap();
        assert_eq!(event, ClientEvent::GetOnlineFriends);
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"wave","at":"everyone"}"#).unwrap();
        assert_eq!(event, ClientEvent::Unknown);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"typing"}"#).is_err());
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"mark_read"}"#).is_err());
    }

    #[test]
    fn server_events_use_snake_case_kinds() {
        let json = serde_json::to_value(ServerEvent::FriendStatusChange {
            user_id: 7,
            status: PresenceStatus::Offline,
        })
        .unwrap();
        assert_eq!(json["type"], "friend_status_change");
        assert_eq!(json["status"], "offline");

        let json = serde_json::to_value(ServerEvent::Error {
            code: ErrorCode::NotFound,
            message: "no such conversation".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "not_found");

        let json = serde_json::to_value(ServerEvent::FriendRequestAccepted { user_id: 3 }).unwrap();
        assert_eq!(json["type"], "friend_request_accepted");
        assert_eq!(json["user_id"], 3);
    }
}
