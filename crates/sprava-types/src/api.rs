use serde::{Deserialize, Serialize};

use crate::models::{ConversationId, UserId};

// -- Relationships --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FriendRequestBody {
    pub receiver_id: UserId,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub user_id: UserId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    pub conversation_id: ConversationId,
    pub created: bool,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}
