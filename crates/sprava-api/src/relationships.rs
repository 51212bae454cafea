use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use sprava_gateway::Gateway;
use sprava_types::api::FriendRequestBody;
use sprava_types::events::ServerEvent;
use sprava_types::models::UserId;

use crate::middleware::AuthUser;
use crate::store_status;

// -- Friends --

pub async fn list_friends(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, StatusCode> {
    let friends = gateway
        .store(move |db| db.friends_of(user_id))
        .await
        .map_err(store_status)?;
    Ok(Json(friends))
}

pub async fn remove_friend(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(friend_id): Path<UserId>,
) -> Result<impl IntoResponse, StatusCode> {
    let removed = gateway
        .store(move |db| db.remove_friend(user_id, friend_id))
        .await
        .map_err(store_status)?;

    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// -- Friend requests --

/// Requests waiting for the caller to answer.
pub async fn incoming_requests(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, StatusCode> {
    let requests = gateway
        .store(move |db| db.incoming_friend_requests(user_id))
        .await
        .map_err(store_status)?;
    Ok(Json(requests))
}

pub async fn outgoing_requests(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, StatusCode> {
    let requests = gateway
        .store(move |db| db.outgoing_friend_requests(user_id))
        .await
        .map_err(store_status)?;
    Ok(Json(requests))
}

pub async fn send_request(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<FriendRequestBody>,
) -> Result<impl IntoResponse, StatusCode> {
    let receiver_id = req.receiver_id;
    gateway
        .store(move |db| db.send_friend_request(user_id, receiver_id))
        .await
        .map_err(store_status)?;

    gateway
        .router
        .send_to_user(receiver_id, ServerEvent::NewFriendRequest { user_id })
        .await;

    Ok(StatusCode::CREATED)
}

pub async fn cancel_request(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(receiver_id): Path<UserId>,
) -> Result<impl IntoResponse, StatusCode> {
    gateway
        .store(move |db| db.cancel_friend_request(user_id, receiver_id))
        .await
        .map_err(store_status)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn accept_request(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(sender_id): Path<UserId>,
) -> Result<impl IntoResponse, StatusCode> {
    gateway
        .store(move |db| db.accept_friend_request(user_id, sender_id))
        .await
        .map_err(store_status)?;

    gateway
        .router
        .send_to_user(sender_id, ServerEvent::FriendRequestAccepted { user_id })
        .await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn reject_request(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(sender_id): Path<UserId>,
) -> Result<impl IntoResponse, StatusCode> {
    gateway
        .store(move |db| db.reject_friend_request(user_id, sender_id))
        .await
        .map_err(store_status)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Blocks --

pub async fn list_blocked(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, StatusCode> {
    let blocked = gateway
        .store(move |db| db.blocked_by(user_id))
        .await
        .map_err(store_status)?;
    Ok(Json(blocked))
}

/// Block a user. Blocking also ends the friendship and drops pending
/// requests between the two.
pub async fn block_user(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(blocked_id): Path<UserId>,
) -> Result<impl IntoResponse, StatusCode> {
    gateway
        .store(move |db| db.block_user(user_id, blocked_id))
        .await
        .map_err(store_status)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unblock_user(
    State(gateway): State<Gateway>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(blocked_id): Path<UserId>,
) -> Result<impl IntoResponse, StatusCode> {
    let removed = gateway
        .store(move |db| db.unblock_user(user_id, blocked_id))
        .await
        .map_err(store_status)?;

    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
