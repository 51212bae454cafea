pub mod conversations;
pub mod messages;
pub mod middleware;
pub mod relationships;

use axum::{
    Router, middleware as axum_middleware,
    http::StatusCode,
    routing::{delete, get, post, put},
};
use tracing::error;

use sprava_db::StoreError;
use sprava_gateway::Gateway;

/// Conversation, message and relationship routes. Every route needs a
/// bearer token.
pub fn routes(gateway: Gateway) -> Router {
    Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route(
            "/conversations/{conversation_id}",
            delete(conversations::delete_conversation),
        )
        .route(
            "/conversations/{conversation_id}/read",
            put(conversations::mark_read),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/messages/{message_id}", delete(messages::delete_message))
        .route("/me/friends", get(relationships::list_friends))
        .route("/me/friends/{user_id}", delete(relationships::remove_friend))
        .route(
            "/me/friend_requests",
            get(relationships::incoming_requests).post(relationships::send_request),
        )
        .route(
            "/me/friend_requests/{user_id}",
            delete(relationships::cancel_request),
        )
        .route(
            "/me/friend_requests/{user_id}/accept",
            post(relationships::accept_request),
        )
        .route(
            "/me/friend_requests/{user_id}/reject",
            post(relationships::reject_request),
        )
        .route("/me/sent_friend_requests", get(relationships::outgoing_requests))
        .route("/me/blocked", get(relationships::list_blocked))
        .route(
            "/me/blocked/{user_id}",
            put(relationships::block_user).delete(relationships::unblock_user),
        )
        .layer(axum_middleware::from_fn_with_state(
            gateway.clone(),
            middleware::require_auth,
        ))
        .with_state(gateway)
}

pub(crate) fn store_status(err: StoreError) -> StatusCode {
    match err {
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::Forbidden => StatusCode::FORBIDDEN,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        e @ (StoreError::Sqlite(_) | StoreError::LockPoisoned | StoreError::TaskFailed(_)) => {
            error!("store failure: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    use sprava_db::Database;
    use sprava_gateway::PresenceMode;
    use sprava_gateway::registry::SessionHandle;
    use sprava_types::api::CreateConversationResponse;
    use sprava_types::events::ServerEvent;
    use sprava_types::models::{FriendRequest, Message, UserId};

    use super::*;

    struct Fixture {
        gateway: Gateway,
        db: Arc<Database>,
        alice: UserId,
        bob: UserId,
        carol: UserId,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = db.create_user("alice", "tok-alice").unwrap();
        let bob = db.create_user("bob", "tok-bob").unwrap();
        let carol = db.create_user("carol", "tok-carol").unwrap();
        db.add_friend(alice, bob).unwrap();
        Fixture {
            gateway: Gateway::new(db.clone(), PresenceMode::Edge),
            db,
            alice,
            bob,
            carol,
        }
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_or_unknown_token_is_unauthorized() {
        let f = fixture();
        let app = routes(f.gateway.clone());

        let resp = app
            .clone()
            .oneshot(request("GET", "/conversations", None, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(request("GET", "/conversations", Some("forged"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn creating_a_conversation_notifies_the_other_side() {
        let f = fixture();
        let app = routes(f.gateway.clone());
        let (bob_session, mut bob_rx) = SessionHandle::channel();
        f.gateway.registry.register(f.bob, bob_session).await;

        let body = format!(r#"{{"user_id":{}}}"#, f.bob);
        let resp = app
            .clone()
            .oneshot(request("POST", "/conversations", Some("tok-alice"), Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: CreateConversationResponse = json_body(resp).await;
        assert!(created.created);

        assert_eq!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::NewConversation {
                conversation_id: created.conversation_id,
                user_id: f.alice,
            }
        );

        // Second call finds the same conversation and stays quiet.
        let resp = app
            .oneshot(request("POST", "/conversations", Some("tok-alice"), Some(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let again: CreateConversationResponse = json_body(resp).await;
        assert_eq!(again.conversation_id, created.conversation_id);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn strangers_cannot_open_conversations() {
        let f = fixture();
        let app = routes(f.gateway.clone());
        let body = format!(r#"{{"user_id":{}}}"#, f.carol);
        let resp = app
            .oneshot(request("POST", "/conversations", Some("tok-alice"), Some(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn messages_are_private_to_participants() {
        let f = fixture();
        let app = routes(f.gateway.clone());
        let (cid, _) = f.db.get_or_create_conversation(f.alice, f.bob).unwrap();

        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/conversations/{}/messages", cid),
                Some("tok-bob"),
                Some(r#"{"content":"hello"}"#.into()),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .clone()
            .oneshot(request(
                "GET",
                &format!("/conversations/{}/messages?limit=10", cid),
                Some("tok-alice"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let messages: Vec<Message> = json_body(resp).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[0].sender_id, f.bob);

        let resp = app
            .oneshot(request(
                "GET",
                &format!("/conversations/{}/messages", cid),
                Some("tok-carol"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn only_the_author_deletes_a_message() {
        let f = fixture();
        let app = routes(f.gateway.clone());
        let (cid, _) = f.db.get_or_create_conversation(f.alice, f.bob).unwrap();
        let message = f.db.send_message(cid, f.alice, "regret").unwrap();

        let uri = format!("/messages/{}", message.id);
        let resp = app
            .clone()
            .oneshot(request("DELETE", &uri, Some("tok-bob"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .clone()
            .oneshot(request("DELETE", &uri, Some("tok-alice"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(request("DELETE", &uri, Some("tok-alice"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn send_after_block_is_refused_and_not_stored() {
        let f = fixture();
        let app = routes(f.gateway.clone());
        let (cid, _) = f.db.get_or_create_conversation(f.alice, f.bob).unwrap();
        let (alice_session, mut alice_rx) = SessionHandle::channel();
        f.gateway.registry.register(f.alice, alice_session).await;

        let resp = app
            .clone()
            .oneshot(request("PUT", &format!("/me/blocked/{}", f.alice), Some("tok-bob"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(request(
                "POST",
                &format!("/conversations/{}/messages", cid),
                Some("tok-bob"),
                Some(r#"{"content":"sneaky"}"#.into()),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(f.db.messages(cid, 50, 0).unwrap().is_empty());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn friend_request_flow_notifies_both_sides() {
        let f = fixture();
        let app = routes(f.gateway.clone());
        let (alice_session, mut alice_rx) = SessionHandle::channel();
        let (carol_session, mut carol_rx) = SessionHandle::channel();
        f.gateway.registry.register(f.alice, alice_session).await;
        f.gateway.registry.register(f.carol, carol_session).await;

        let body = format!(r#"{{"receiver_id":{}}}"#, f.carol);
        let resp = app
            .clone()
            .oneshot(request("POST", "/me/friend_requests", Some("tok-alice"), Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(
            carol_rx.try_recv().unwrap(),
            ServerEvent::NewFriendRequest { user_id: f.alice }
        );

        // A second request for the same pair is refused.
        let resp = app
            .clone()
            .oneshot(request("POST", "/me/friend_requests", Some("tok-alice"), Some(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(request("GET", "/me/friend_requests", Some("tok-carol"), None))
            .await
            .unwrap();
        let pending: Vec<FriendRequest> = json_body(resp).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sender_id, f.alice);

        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/me/friend_requests/{}/accept", f.alice),
                Some("tok-carol"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            alice_rx.try_recv().unwrap(),
            ServerEvent::FriendRequestAccepted { user_id: f.carol }
        );

        let resp = app
            .clone()
            .oneshot(request("GET", "/me/friends", Some("tok-alice"), None))
            .await
            .unwrap();
        let mut friends: Vec<UserId> = json_body(resp).await;
        friends.sort();
        assert_eq!(friends, vec![f.bob, f.carol]);

        // Now friends, they can open a conversation.
        let resp = app
            .oneshot(request(
                "POST",
                "/conversations",
                Some("tok-carol"),
                Some(format!(r#"{{"user_id":{}}}"#, f.alice)),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn unfriend_and_unblock_report_missing_edges() {
        let f = fixture();
        let app = routes(f.gateway.clone());

        let resp = app
            .clone()
            .oneshot(request("DELETE", &format!("/me/friends/{}", f.bob), Some("tok-alice"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(!f.db.are_friends(f.alice, f.bob).unwrap());

        let resp = app
            .clone()
            .oneshot(request("DELETE", &format!("/me/friends/{}", f.bob), Some("tok-alice"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(request("DELETE", &format!("/me/blocked/{}", f.carol), Some("tok-alice"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
