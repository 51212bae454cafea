use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use sprava_gateway::Gateway;
use sprava_types::api::{CreateConversationRequest, CreateConversationResponse, MarkReadResponse};
use sprava_types::events::ServerEvent;
use sprava_types::models::ConversationId;

use crate::middleware::AuthUser;
use crate::store_status;

/// Open a conversation with a friend. Existing conversations are returned
/// as-is; only a newly created one is announced to the other side.
pub async fn create_conversation(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let other_id = req.user_id;
    let (conversation_id, created) = gateway
        .store(move |db| db.open_conversation(user_id, other_id))
        .await
        .map_err(store_status)?;

    if created {
        gateway
            .router
            .send_to_users(
                &[user_id, other_id],
                ServerEvent::NewConversation {
                    conversation_id,
                    user_id,
                },
                Some(user_id),
            )
            .await;
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CreateConversationResponse {
            conversation_id,
            created,
        }),
    ))
}

pub async fn list_conversations(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversations = gateway
        .store(move |db| db.conversations_for(user_id))
        .await
        .map_err(store_status)?;
    Ok(Json(conversations))
}

pub async fn delete_conversation(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<ConversationId>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversation = gateway
        .store(move |db| db.delete_conversation(conversation_id, user_id))
        .await
        .map_err(store_status)?;

    gateway
        .router
        .send_to_users(
            &[conversation.user1_id, conversation.user2_id],
            ServerEvent::ConversationDeleted {
                conversation_id,
                user_id,
            },
            Some(user_id),
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_read(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<ConversationId>,
) -> Result<impl IntoResponse, StatusCode> {
    let (updated, other_id) = gateway
        .store(move |db| {
            let updated = db.mark_as_read(conversation_id, user_id)?;
            Ok((updated, db.other_participant(conversation_id, user_id)?))
        })
        .await
        .map_err(store_status)?;

    gateway
        .router
        .send_to_user(
            other_id,
            ServerEvent::MessagesRead {
                conversation_id,
                user_id,
            },
        )
        .await;

    Ok(Json(MarkReadResponse { updated }))
}
