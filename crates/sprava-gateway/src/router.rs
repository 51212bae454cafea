use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use sprava_db::{Database, StoreResult};
use sprava_types::events::ServerEvent;
use sprava_types::models::{ConversationId, PresenceStatus, UserId};

use crate::registry::{ConnectionRegistry, SessionHandle, SessionId};
use crate::run_blocking;

/// Best-effort fan-out of events to every live session of the target users.
///
/// Nothing is queued: a user with no sessions simply misses the event. A
/// session whose send fails is pruned from the registry after every sibling
/// session has been tried. If pruning takes a user offline, their friends
/// are told.
///
/// Presence transitions and their announcements happen under one gate, so
/// friends observe a user's online/offline changes in the order the
/// registry applied them.
#[derive(Clone)]
pub struct NotificationRouter {
    registry: ConnectionRegistry,
    db: Arc<Database>,
    presence_gate: Arc<Mutex<()>>,
}

impl NotificationRouter {
    pub fn new(registry: ConnectionRegistry, db: Arc<Database>) -> Self {
        Self {
            registry,
            db,
            presence_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Register a session. Friends hear that the user came online if this is
    /// their first session, or on every call when `always_announce` is set.
    /// Returns whether the user went from offline to online.
    pub async fn session_opened(
        &self,
        user_id: UserId,
        session: SessionHandle,
        always_announce: bool,
    ) -> bool {
        let _gate = self.presence_gate.lock().await;
        let became_online = self.registry.register(user_id, session).await;
        if became_online || always_announce {
            self.announce_presence(user_id, PresenceStatus::Online).await;
        }
        became_online
    }

    /// Unregister a session; the mirror of [`Self::session_opened`].
    /// Returns whether the user's last session was removed.
    pub async fn session_closed(
        &self,
        user_id: UserId,
        session_id: SessionId,
        always_announce: bool,
    ) -> bool {
        let _gate = self.presence_gate.lock().await;
        let became_offline = self.registry.unregister(user_id, session_id).await;
        if became_offline || always_announce {
            self.announce_presence(user_id, PresenceStatus::Offline).await;
        }
        became_offline
    }

    pub async fn send_to_user(&self, user_id: UserId, event: ServerEvent) {
        if self.deliver(user_id, &event).await {
            self.settle_offline(vec![user_id]).await;
        }
    }

    /// Send to each user in `user_ids`, skipping `excluding` if given.
    pub async fn send_to_users(
        &self,
        user_ids: &[UserId],
        event: ServerEvent,
        excluding: Option<UserId>,
    ) {
        let went_offline = self.deliver_many(user_ids, &event, excluding).await;
        self.settle_offline(went_offline).await;
    }

    /// Send to both participants of a conversation, the author included, so
    /// the author's other devices see their own message.
    pub async fn send_to_conversation(
        &self,
        conversation_id: ConversationId,
        event: ServerEvent,
    ) -> StoreResult<()> {
        let conversation = run_blocking(&self.db, move |db| db.conversation(conversation_id)).await?;
        let Some(conversation) = conversation else {
            debug!("Conversation {} vanished before publish, dropping event", conversation_id);
            return Ok(());
        };

        self.send_to_users(&[conversation.user1_id, conversation.user2_id], event, None)
            .await;
        Ok(())
    }

    /// Tell `user_id`'s friends that they came online or went offline.
    /// Callers hold the presence gate.
    async fn announce_presence(&self, user_id: UserId, status: PresenceStatus) {
        let friends = match run_blocking(&self.db, move |db| db.friends_of(user_id)).await {
            Ok(friends) => friends,
            Err(e) => {
                warn!("Could not load friends of {} for presence: {}", user_id, e);
                return;
            }
        };

        debug!("User {} is {:?}, notifying {} friends", user_id, status, friends.len());
        let event = ServerEvent::FriendStatusChange { user_id, status };
        let went_offline = self.deliver_many(&friends, &event, None).await;
        self.announce_pruned(went_offline).await;
    }

    async fn settle_offline(&self, pending: Vec<UserId>) {
        if pending.is_empty() {
            return;
        }
        let _gate = self.presence_gate.lock().await;
        self.announce_pruned(pending).await;
    }

    /// Announce every user that pruning took offline. Announcing can prune
    /// further sessions, so this works through a queue instead of recursing.
    /// A user who reconnected before the gate was taken has already been
    /// announced online and is skipped. Callers hold the presence gate.
    async fn announce_pruned(&self, mut pending: Vec<UserId>) {
        while let Some(user_id) = pending.pop() {
            if self.registry.is_online(user_id).await {
                debug!("User {} reconnected before pruning was announced", user_id);
                continue;
            }
            let friends = match run_blocking(&self.db, move |db| db.friends_of(user_id)).await {
                Ok(friends) => friends,
                Err(e) => {
                    warn!("Could not load friends of {} for presence: {}", user_id, e);
                    continue;
                }
            };
            let event = ServerEvent::FriendStatusChange {
                user_id,
                status: PresenceStatus::Offline,
            };
            pending.extend(self.deliver_many(&friends, &event, None).await);
        }
    }

    async fn deliver_many(
        &self,
        user_ids: &[UserId],
        event: &ServerEvent,
        excluding: Option<UserId>,
    ) -> Vec<UserId> {
        let mut went_offline = Vec::new();
        for &user_id in user_ids {
            if excluding == Some(user_id) {
                continue;
            }
            if self.deliver(user_id, event).await {
                went_offline.push(user_id);
            }
        }
        went_offline
    }

    /// Try every session of `user_id`, then prune the ones that failed.
    /// Returns true if pruning removed the user's last session.
    async fn deliver(&self, user_id: UserId, event: &ServerEvent) -> bool {
        let sessions = self.registry.sessions_of(user_id).await;
        if sessions.is_empty() {
            trace!("User {} offline, dropping event", user_id);
            return false;
        }

        let failed: Vec<_> = sessions
            .iter()
            .filter(|session| session.send(event.clone()).is_err())
            .map(|session| session.id())
            .collect();

        let mut went_offline = false;
        for session_id in failed {
            debug!("Pruning dead session {} of user {}", session_id, user_id);
            went_offline |= self.registry.unregister(user_id, session_id).await;
        }
        went_offline
    }
}
