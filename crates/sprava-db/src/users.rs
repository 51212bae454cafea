use rusqlite::{Connection, OptionalExtension};

use sprava_types::models::UserId;

use crate::{Database, StoreResult};

impl Database {
    /// Insert a user with an opaque API token. Used by the account service
    /// and by tests; password handling lives elsewhere.
    pub fn create_user(&self, username: &str, api_token: &str) -> StoreResult<UserId> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, api_token) VALUES (?1, ?2)",
                (username, api_token),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn user_id_by_token(&self, api_token: &str) -> StoreResult<Option<UserId>> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT id FROM users WHERE api_token = ?1",
                    [api_token],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    pub fn user_exists(&self, user_id: UserId) -> StoreResult<bool> {
        self.with_conn(|conn| query_user_exists(conn, user_id))
    }
}

pub(crate) fn query_user_exists(conn: &Connection, user_id: UserId) -> StoreResult<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}
