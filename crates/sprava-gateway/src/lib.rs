pub mod connection;
pub mod identity;
pub mod registry;
pub mod router;
pub mod session;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::error;

use sprava_db::{Database, StoreError, StoreResult};
use sprava_types::models::UserId;

use crate::identity::TokenResolver;
use crate::registry::ConnectionRegistry;
use crate::router::NotificationRouter;

/// When a user's friends hear about their presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceMode {
    /// Only on the first connect and the last disconnect.
    #[default]
    Edge,
    /// On every connect and disconnect, so each new device re-announces.
    EveryConnection,
}

impl FromStr for PresenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edge" => Ok(Self::Edge),
            "every_connection" => Ok(Self::EveryConnection),
            other => Err(format!("unknown presence mode: {}", other)),
        }
    }
}

impl fmt::Display for PresenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Edge => f.write_str("edge"),
            Self::EveryConnection => f.write_str("every_connection"),
        }
    }
}

/// Shared real-time state: who is connected, how to reach them, and the
/// store behind it. Cheap to clone; one instance per process.
#[derive(Clone)]
pub struct Gateway {
    pub registry: ConnectionRegistry,
    pub router: NotificationRouter,
    pub presence_mode: PresenceMode,
    db: Arc<Database>,
    resolver: Arc<dyn TokenResolver>,
}

impl Gateway {
    /// Tokens are resolved against the `users` table of `db`.
    pub fn new(db: Arc<Database>, presence_mode: PresenceMode) -> Self {
        let resolver: Arc<dyn TokenResolver> = db.clone();
        Self::with_resolver(db, resolver, presence_mode)
    }

    pub fn with_resolver(
        db: Arc<Database>,
        resolver: Arc<dyn TokenResolver>,
        presence_mode: PresenceMode,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let router = NotificationRouter::new(registry.clone(), db.clone());
        Self {
            registry,
            router,
            presence_mode,
            db,
            resolver,
        }
    }

    /// Resolve a bearer token to a user. `None` means authentication failed.
    pub async fn authenticate(&self, token: &str) -> Option<UserId> {
        let resolver = self.resolver.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || resolver.resolve(&token))
            .await
            .unwrap_or_else(|e| {
                error!("token resolution task failed: {}", e);
                None
            })
    }

    /// Run a store operation off the async runtime.
    pub async fn store<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(&self.db, f).await
    }
}

pub(crate) async fn run_blocking<F, T>(db: &Arc<Database>, f: F) -> StoreResult<T>
where
    F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StoreError::TaskFailed(e.to_string())
        })?
}
