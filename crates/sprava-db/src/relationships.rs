//! Friend and block edges, and the authorization checks built on them.
//!
//! Friendship is undirected and stored once per pair as `(min, max)`. It is
//! normally formed by accepting a friend request; at most one request is
//! pending per pair. Blocks are directed and override friendship.

use rusqlite::{Connection, params};
use tracing::debug;

use sprava_types::models::{FriendRequest, UserId};

use crate::models::{FriendRequestRow, now_timestamp};
use crate::users::query_user_exists;
use crate::{Database, StoreError, StoreResult};

pub(crate) fn canonical_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    (a.min(b), a.max(b))
}

impl Database {
    pub fn are_friends(&self, a: UserId, b: UserId) -> StoreResult<bool> {
        self.with_conn(|conn| query_are_friends(conn, a, b))
    }

    /// Directional: true if `blocker` has blocked `blocked`.
    pub fn is_blocked(&self, blocker: UserId, blocked: UserId) -> StoreResult<bool> {
        self.with_conn(|conn| query_is_blocked(conn, blocker, blocked))
    }

    /// True if either user has blocked the other.
    pub fn is_blocked_either(&self, a: UserId, b: UserId) -> StoreResult<bool> {
        self.with_conn(|conn| query_blocked_either(conn, a, b))
    }

    pub fn friends_of(&self, user_id: UserId) -> StoreResult<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user2_id FROM friends WHERE user1_id = ?1
                 UNION
                 SELECT user1_id FROM friends WHERE user2_id = ?1
                 ORDER BY 1",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<Result<Vec<UserId>, _>>()?;
            Ok(ids)
        })
    }

    pub fn blocked_by(&self, blocker: UserId) -> StoreResult<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT blocked_id FROM blocked_users WHERE blocker_id = ?1 ORDER BY 1")?;
            let ids = stmt
                .query_map([blocker], |row| row.get(0))?
                .collect::<Result<Vec<UserId>, _>>()?;
            Ok(ids)
        })
    }

    /// Record a friendship. Adding an existing friendship is a no-op.
    pub fn add_friend(&self, a: UserId, b: UserId) -> StoreResult<()> {
        if a == b {
            return Err(StoreError::Invalid("cannot befriend yourself".into()));
        }
        let (user1, user2) = canonical_pair(a, b);
        self.with_conn(|conn| {
            ensure_users_exist(conn, user1, user2)?;
            conn.execute(
                "INSERT OR IGNORE INTO friends (user1_id, user2_id) VALUES (?1, ?2)",
                (user1, user2),
            )?;
            Ok(())
        })
    }

    pub fn remove_friend(&self, a: UserId, b: UserId) -> StoreResult<bool> {
        let (user1, user2) = canonical_pair(a, b);
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM friends WHERE user1_id = ?1 AND user2_id = ?2",
                (user1, user2),
            )?;
            Ok(removed > 0)
        })
    }

    /// Block `blocked` on behalf of `blocker`. Any friendship between the two
    /// is dropped in the same transaction.
    pub fn block_user(&self, blocker: UserId, blocked: UserId) -> StoreResult<()> {
        if blocker == blocked {
            return Err(StoreError::Invalid("cannot block yourself".into()));
        }
        let (user1, user2) = canonical_pair(blocker, blocked);
        self.with_conn(|conn| {
            ensure_users_exist(conn, user1, user2)?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM friends WHERE user1_id = ?1 AND user2_id = ?2",
                (user1, user2),
            )?;
            delete_requests_between(&tx, blocker, blocked)?;
            tx.execute(
                "INSERT OR IGNORE INTO blocked_users (blocker_id, blocked_id) VALUES (?1, ?2)",
                (blocker, blocked),
            )?;
            tx.commit()?;
            debug!("User {} blocked {}", blocker, blocked);
            Ok(())
        })
    }

    pub fn unblock_user(&self, blocker: UserId, blocked: UserId) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM blocked_users WHERE blocker_id = ?1 AND blocked_id = ?2",
                (blocker, blocked),
            )?;
            Ok(removed > 0)
        })
    }

    /// Ask `receiver_id` to be friends. Fails if they already are, if a
    /// request is pending in either direction, or if either side blocked the
    /// other.
    pub fn send_friend_request(&self, sender_id: UserId, receiver_id: UserId) -> StoreResult<()> {
        if sender_id == receiver_id {
            return Err(StoreError::Invalid("cannot befriend yourself".into()));
        }
        self.with_conn(|conn| {
            ensure_users_exist(conn, sender_id, receiver_id)?;
            check_can_message(conn, sender_id, receiver_id)?;
            if query_are_friends(conn, sender_id, receiver_id)? {
                return Err(StoreError::Invalid("already friends".into()));
            }
            if query_request_pending(conn, sender_id, receiver_id)? {
                return Err(StoreError::Invalid("a friend request is already pending".into()));
            }
            conn.execute(
                "INSERT INTO friend_requests (sender_id, receiver_id, created_at) VALUES (?1, ?2, ?3)",
                params![sender_id, receiver_id, now_timestamp()],
            )?;
            debug!("User {} sent a friend request to {}", sender_id, receiver_id);
            Ok(())
        })
    }

    /// Withdraw a request `sender_id` sent earlier.
    pub fn cancel_friend_request(&self, sender_id: UserId, receiver_id: UserId) -> StoreResult<()> {
        self.with_conn(|conn| delete_request(conn, sender_id, receiver_id))
    }

    /// Accept the request `sender_id` sent to `receiver_id`. The request and
    /// the new friendship change in one transaction.
    pub fn accept_friend_request(&self, receiver_id: UserId, sender_id: UserId) -> StoreResult<()> {
        let (user1, user2) = canonical_pair(sender_id, receiver_id);
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            delete_request(&tx, sender_id, receiver_id)?;
            check_can_message(&tx, sender_id, receiver_id)?;
            tx.execute(
                "INSERT OR IGNORE INTO friends (user1_id, user2_id) VALUES (?1, ?2)",
                (user1, user2),
            )?;
            tx.commit()?;
            debug!("User {} accepted the friend request of {}", receiver_id, sender_id);
            Ok(())
        })
    }

    pub fn reject_friend_request(&self, receiver_id: UserId, sender_id: UserId) -> StoreResult<()> {
        self.with_conn(|conn| delete_request(conn, sender_id, receiver_id))
    }

    /// Requests waiting for `user_id` to answer, oldest first.
    pub fn incoming_friend_requests(&self, user_id: UserId) -> StoreResult<Vec<FriendRequest>> {
        self.with_conn(|conn| query_requests(conn, "receiver_id", user_id))
    }

    /// Requests `user_id` sent that are still unanswered, oldest first.
    pub fn outgoing_friend_requests(&self, user_id: UserId) -> StoreResult<Vec<FriendRequest>> {
        self.with_conn(|conn| query_requests(conn, "sender_id", user_id))
    }

    /// Opening a conversation needs friendship and no block in either direction.
    pub fn ensure_can_start_conversation(&self, a: UserId, b: UserId) -> StoreResult<()> {
        self.with_conn(|conn| check_can_start_conversation(conn, a, b))
    }

    /// Sending into a conversation only needs the absence of a block.
    /// Friendship is checked once, when the conversation is opened.
    pub fn ensure_can_message(&self, a: UserId, b: UserId) -> StoreResult<()> {
        self.with_conn(|conn| check_can_message(conn, a, b))
    }
}

pub(crate) fn query_are_friends(conn: &Connection, a: UserId, b: UserId) -> StoreResult<bool> {
    let (user1, user2) = canonical_pair(a, b);
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM friends WHERE user1_id = ?1 AND user2_id = ?2)",
        (user1, user2),
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub(crate) fn query_is_blocked(
    conn: &Connection,
    blocker: UserId,
    blocked: UserId,
) -> StoreResult<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM blocked_users WHERE blocker_id = ?1 AND blocked_id = ?2)",
        (blocker, blocked),
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub(crate) fn query_blocked_either(conn: &Connection, a: UserId, b: UserId) -> StoreResult<bool> {
    Ok(query_is_blocked(conn, a, b)? || query_is_blocked(conn, b, a)?)
}

pub(crate) fn check_can_message(conn: &Connection, a: UserId, b: UserId) -> StoreResult<()> {
    if query_blocked_either(conn, a, b)? {
        return Err(StoreError::Forbidden);
    }
    Ok(())
}

pub(crate) fn check_can_start_conversation(
    conn: &Connection,
    a: UserId,
    b: UserId,
) -> StoreResult<()> {
    check_can_message(conn, a, b)?;
    if !query_are_friends(conn, a, b)? {
        return Err(StoreError::Forbidden);
    }
    Ok(())
}

fn query_request_pending(conn: &Connection, a: UserId, b: UserId) -> StoreResult<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM friend_requests
                        WHERE (sender_id = ?1 AND receiver_id = ?2)
                           OR (sender_id = ?2 AND receiver_id = ?1))",
        (a, b),
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn query_requests(conn: &Connection, side: &str, user_id: UserId) -> StoreResult<Vec<FriendRequest>> {
    let sql = format!(
        "SELECT {} FROM friend_requests WHERE {} = ?1 ORDER BY created_at, sender_id",
        FriendRequestRow::COLUMNS,
        side
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([user_id], FriendRequestRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(FriendRequest::from).collect())
}

fn delete_request(conn: &Connection, sender_id: UserId, receiver_id: UserId) -> StoreResult<()> {
    let removed = conn.execute(
        "DELETE FROM friend_requests WHERE sender_id = ?1 AND receiver_id = ?2",
        (sender_id, receiver_id),
    )?;
    if removed == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

fn delete_requests_between(conn: &Connection, a: UserId, b: UserId) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM friend_requests
          WHERE (sender_id = ?1 AND receiver_id = ?2)
             OR (sender_id = ?2 AND receiver_id = ?1)",
        (a, b),
    )?;
    Ok(())
}

pub(crate) fn ensure_users_exist(conn: &Connection, a: UserId, b: UserId) -> StoreResult<()> {
    if !query_user_exists(conn, a)? || !query_user_exists(conn, b)? {
        return Err(StoreError::NotFound);
    }
    Ok(())
}
