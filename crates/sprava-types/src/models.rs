use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable user identity, owned by the account service.
pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;

/// A one-to-one conversation. Participants are stored in canonical order,
/// so `user1_id < user2_id` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// The participant that is not `user_id`, or `None` if `user_id` is not in
    /// this conversation.
    pub fn other_participant(&self, user_id: UserId) -> Option<UserId> {
        if self.user1_id == user_id {
            Some(self.user2_id)
        } else if self.user2_id == user_id {
            Some(self.user1_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Whether the non-author participant has seen this message.
    pub is_read: bool,
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub other_user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

/// A pending friend request. At most one exists per pair of users, in
/// either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}
