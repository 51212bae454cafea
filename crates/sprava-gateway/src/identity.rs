use tracing::warn;

use sprava_db::Database;
use sprava_types::models::UserId;

/// Resolves the opaque bearer token presented on connect to a user.
///
/// Implementations may block; callers run them on the blocking pool.
pub trait TokenResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<UserId>;
}

impl TokenResolver for Database {
    fn resolve(&self, token: &str) -> Option<UserId> {
        if token.is_empty() {
            return None;
        }
        match self.user_id_by_token(token) {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!("token lookup failed: {}", e);
                None
            }
        }
    }
}
