use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use sprava_types::events::ServerEvent;
use sprava_types::models::UserId;

/// Identifies one live connection. A user may hold several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
#[error("session {0} is closed")]
pub struct SessionClosed(pub SessionId);

/// The sending half of a session's outbound queue.
///
/// The connection that owns the session holds the receiving half; once it
/// goes away every send through this handle fails.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl SessionHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: SessionId::new(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn send(&self, event: ServerEvent) -> Result<(), SessionClosed> {
        self.tx.send(event).map_err(|_| SessionClosed(self.id))
    }
}

/// Presence: for each user, the set of currently open sessions.
///
/// The map sits behind one mutex that is only held for map operations.
/// Callers take a snapshot with [`ConnectionRegistry::sessions_of`] and send
/// after the lock is released.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<UserId, HashMap<SessionId, SessionHandle>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns true if this took the user from offline to online.
    pub async fn register(&self, user_id: UserId, session: SessionHandle) -> bool {
        let mut users = self.inner.lock().await;
        let sessions = users.entry(user_id).or_default();
        let became_online = sessions.is_empty();
        sessions.insert(session.id(), session);

        debug!(
            "Registered session for user {}, open sessions: {}",
            user_id,
            sessions.len()
        );
        became_online
    }

    /// Remove a session. Returns true only for the call that removed the
    /// user's last session; removing an unknown session returns false.
    pub async fn unregister(&self, user_id: UserId, session_id: SessionId) -> bool {
        let mut users = self.inner.lock().await;
        let Some(sessions) = users.get_mut(&user_id) else {
            return false;
        };
        if sessions.remove(&session_id).is_none() {
            return false;
        }

        debug!(
            "Unregistered session {} for user {}, remaining: {}",
            session_id,
            user_id,
            sessions.len()
        );

        if sessions.is_empty() {
            users.remove(&user_id);
            true
        } else {
            false
        }
    }

    /// Point-in-time copy of the user's sessions.
    pub async fn sessions_of(&self, user_id: UserId) -> Vec<SessionHandle> {
        self.inner
            .lock()
            .await
            .get(&user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.lock().await.contains_key(&user_id)
    }

    pub async fn online_users(&self) -> HashSet<UserId> {
        self.inner.lock().await.keys().copied().collect()
    }

    pub async fn session_count(&self, user_id: UserId) -> usize {
        self.inner
            .lock()
            .await
            .get(&user_id)
            .map_or(0, |sessions| sessions.len())
    }
}
