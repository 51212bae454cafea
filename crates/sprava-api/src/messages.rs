use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::warn;

use sprava_gateway::Gateway;
use sprava_types::api::SendMessageRequest;
use sprava_types::events::ServerEvent;
use sprava_types::models::{ConversationId, MessageId};

use crate::middleware::AuthUser;
use crate::store_status;

const MAX_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

/// A page of messages, oldest first. Offsets shift if messages arrive
/// between page reads.
pub async fn get_messages(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let limit = query.limit.min(MAX_PAGE);
    let offset = query.offset;

    let messages = gateway
        .store(move |db| {
            db.other_participant(conversation_id, user_id)?;
            db.messages(conversation_id, limit, offset)
        })
        .await
        .map_err(store_status)?;

    Ok(Json(messages))
}

pub async fn send_message(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<ConversationId>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.content.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let content = req.content;
    let (message, receiver_id) = gateway
        .store(move |db| db.post_message(conversation_id, user_id, &content))
        .await
        .map_err(store_status)?;

    let event = ServerEvent::NewMessage {
        message_id: message.id,
        conversation_id,
        sender_id: user_id,
        receiver_id,
        content: message.content.clone(),
        timestamp: message.created_at,
    };
    if let Err(e) = gateway.router.send_to_conversation(conversation_id, event).await {
        // The message is stored; a failed publish does not undo it.
        warn!("Publishing message {} failed: {}", message.id, e);
    }

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn delete_message(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(message_id): Path<MessageId>,
) -> Result<impl IntoResponse, StatusCode> {
    let message = gateway
        .store(move |db| db.delete_message(message_id, user_id))
        .await
        .map_err(store_status)?;

    let event = ServerEvent::MessageDeleted {
        message_id,
        conversation_id: message.conversation_id,
    };
    if let Err(e) = gateway
        .router
        .send_to_conversation(message.conversation_id, event)
        .await
    {
        warn!("Publishing deletion of {} failed: {}", message_id, e);
    }

    Ok(StatusCode::NO_CONTENT)
}
