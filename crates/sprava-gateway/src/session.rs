//! One connection's lifecycle.
//!
//! A connection starts out CONNECTING while its token is resolved (see
//! [`crate::connection`]). [`SessionDispatcher::open`] moves it to OPEN by
//! registering it, and [`SessionDispatcher::close`] consumes the dispatcher
//! on the way to CLOSED. While open, events are handled strictly one at a
//! time in the order they arrived.

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use sprava_db::StoreError;
use sprava_types::events::{ClientEvent, ErrorCode, ServerEvent};
use sprava_types::models::{ConversationId, UserId};

use crate::registry::SessionHandle;
use crate::{Gateway, PresenceMode};

pub struct SessionDispatcher {
    gateway: Gateway,
    user_id: UserId,
    handle: SessionHandle,
    closed: bool,
}

impl SessionDispatcher {
    /// Register a new session for an authenticated user. The returned
    /// receiver carries every event addressed to this session.
    pub async fn open(
        gateway: Gateway,
        user_id: UserId,
    ) -> (Self, UnboundedReceiver<ServerEvent>) {
        let (handle, outbound) = SessionHandle::channel();
        let always_announce = gateway.presence_mode == PresenceMode::EveryConnection;
        gateway
            .router
            .session_opened(user_id, handle.clone(), always_announce)
            .await;

        info!("User {} opened session {}", user_id, handle.id());
        (
            Self {
                gateway,
                user_id,
                handle,
                closed: false,
            },
            outbound,
        )
    }

    /// Decode and handle one inbound text frame. Malformed frames are logged
    /// and dropped; the session stays open.
    pub async fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.dispatch(event).await,
            Err(e) => {
                warn!(
                    "User {} sent a bad event: {} -- raw: {}",
                    self.user_id,
                    e,
                    preview(text, 200)
                );
            }
        }
    }

    pub async fn dispatch(&self, event: ClientEvent) {
        let kind = event.kind();
        let result = match event {
            ClientEvent::SendMessage {
                receiver_id,
                content,
            } => self.send_message(receiver_id, content).await,
            ClientEvent::Typing { receiver_id } => self.typing(receiver_id, true).await,
            ClientEvent::StopTyping { receiver_id } => self.typing(receiver_id, false).await,
            ClientEvent::MarkRead { conversation_id } => self.mark_read(conversation_id).await,
            ClientEvent::GetOnlineFriends => self.online_friends().await,
            ClientEvent::Unknown => {
                debug!("User {} sent an unknown event kind, ignoring", self.user_id);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.reject(kind, e);
        }
    }

    /// Unregister the session and, if it was the user's last one, tell
    /// their friends they went offline.
    pub async fn close(mut self) {
        self.closed = true;
        let always_announce = self.gateway.presence_mode == PresenceMode::EveryConnection;
        self.gateway
            .router
            .session_closed(self.user_id, self.handle.id(), always_announce)
            .await;

        info!("User {} closed session {}", self.user_id, self.handle.id());
    }

    async fn send_message(&self, receiver_id: UserId, content: String) -> Result<(), StoreError> {
        if receiver_id <= 0 || content.is_empty() {
            return Err(StoreError::Invalid(
                "send_message needs a receiver_id and non-empty content".into(),
            ));
        }

        let sender_id = self.user_id;
        let message = self
            .gateway
            .store(move |db| db.send_direct_message(sender_id, receiver_id, &content))
            .await?;

        // Persisted; publish to both participants.
        let event = ServerEvent::NewMessage {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id,
            receiver_id,
            content: message.content,
            timestamp: message.created_at,
        };
        if let Err(e) = self
            .gateway
            .router
            .send_to_conversation(message.conversation_id, event)
            .await
        {
            // The message is stored; a failed publish does not undo it.
            warn!("Publishing message {} failed: {}", message.id, e);
        }
        Ok(())
    }

    async fn typing(&self, receiver_id: UserId, is_typing: bool) -> Result<(), StoreError> {
        if !self.gateway.store(move |db| db.user_exists(receiver_id)).await? {
            return Err(StoreError::NotFound);
        }

        self.gateway
            .router
            .send_to_user(
                receiver_id,
                ServerEvent::UserTyping {
                    user_id: self.user_id,
                    is_typing,
                },
            )
            .await;
        Ok(())
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), StoreError> {
        let reader_id = self.user_id;
        let (updated, other_id) = self
            .gateway
            .store(move |db| {
                let updated = db.mark_as_read(conversation_id, reader_id)?;
                let other_id = db.other_participant(conversation_id, reader_id)?;
                Ok((updated, other_id))
            })
            .await?;

        debug!(
            "User {} read {} messages in conversation {}",
            reader_id, updated, conversation_id
        );
        self.gateway
            .router
            .send_to_user(
                other_id,
                ServerEvent::MessagesRead {
                    conversation_id,
                    user_id: reader_id,
                },
            )
            .await;
        Ok(())
    }

    async fn online_friends(&self) -> Result<(), StoreError> {
        let user_id = self.user_id;
        let friends = self.gateway.store(move |db| db.friends_of(user_id)).await?;

        let mut online = Vec::with_capacity(friends.len());
        for friend_id in friends {
            if self.gateway.registry.is_online(friend_id).await {
                online.push(friend_id);
            }
        }

        self.reply(ServerEvent::OnlineFriends { friends: online });
        Ok(())
    }

    /// Send an event to this session only.
    fn reply(&self, event: ServerEvent) {
        if let Err(e) = self.handle.send(event) {
            debug!("Reply to user {} dropped: {}", self.user_id, e);
        }
    }

    fn reject(&self, kind: &str, err: StoreError) {
        let code = match &err {
            StoreError::NotFound => ErrorCode::NotFound,
            StoreError::Forbidden => ErrorCode::Forbidden,
            StoreError::Invalid(_) => ErrorCode::InvalidRequest,
            StoreError::Sqlite(_) | StoreError::LockPoisoned | StoreError::TaskFailed(_) => {
                ErrorCode::StoreFailure
            }
        };

        if err.is_store_failure() {
            error!("{} from user {} failed: {}", kind, self.user_id, err);
        } else {
            debug!("{} from user {} rejected: {}", kind, self.user_id, err);
        }

        self.reply(ServerEvent::Error {
            code,
            message: format!("{}: {}", kind, err),
        });
    }
}

impl Drop for SessionDispatcher {
    /// A dispatcher dropped without `close` (a panicking handler, a cancelled
    /// task) still leaves the registry; the cleanup runs on the runtime.
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                "Session {} of user {} dropped outside the runtime, left registered",
                self.handle.id(),
                self.user_id
            );
            return;
        };

        warn!(
            "Session {} of user {} dropped without close, unregistering",
            self.handle.id(),
            self.user_id
        );
        let router = self.gateway.router.clone();
        let always_announce = self.gateway.presence_mode == PresenceMode::EveryConnection;
        let (user_id, session_id) = (self.user_id, self.handle.id());
        runtime.spawn(async move {
            router.session_closed(user_id, session_id, always_announce).await;
        });
    }
}

/// At most `max` bytes of `text`, cut on a char boundary.
fn preview(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
