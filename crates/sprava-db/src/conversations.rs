//! Conversation and message persistence.
//!
//! Conversations are keyed by the canonical pair `(min, max)` of their
//! participants; the schema's UNIQUE constraint on that pair is what makes
//! [`Database::get_or_create_conversation`] safe under concurrent first
//! contact. Message order is the autoincrement id.
//!
//! Pagination is offset-based: a message inserted between two page reads
//! shifts later pages by one.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use sprava_types::models::{
    Conversation, ConversationId, ConversationSummary, Message, MessageId, UserId,
};

use crate::models::{ConversationRow, ConversationSummaryRow, MessageRow, now_timestamp};
use crate::relationships::{
    canonical_pair, check_can_message, check_can_start_conversation, ensure_users_exist,
};
use crate::{Database, StoreError, StoreResult};

impl Database {
    /// Return the conversation between `a` and `b`, creating it if needed.
    /// The flag is true when this call created the row.
    ///
    /// Callers racing on the same pair all observe the same id; the losing
    /// inserts are absorbed by `ON CONFLICT DO NOTHING` and fall through to the
    /// fetch.
    pub fn get_or_create_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> StoreResult<(ConversationId, bool)> {
        self.with_conn(|conn| upsert_conversation(conn, a, b))
    }

    pub fn find_conversation(&self, a: UserId, b: UserId) -> StoreResult<Option<ConversationId>> {
        self.with_conn(|conn| query_conversation_id(conn, a, b))
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> StoreResult<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, conversation_id))
    }

    /// The participant of `conversation_id` that is not `known_user_id`.
    pub fn other_participant(
        &self,
        conversation_id: ConversationId,
        known_user_id: UserId,
    ) -> StoreResult<UserId> {
        self.with_conn(|conn| {
            let conversation = require_participant(conn, conversation_id, known_user_id)?;
            conversation
                .other_participant(known_user_id)
                .ok_or(StoreError::Forbidden)
        })
    }

    /// Append a message to an existing conversation. The sender must be a
    /// participant.
    pub fn send_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> StoreResult<Message> {
        self.with_conn(|conn| {
            require_participant(conn, conversation_id, sender_id)?;
            insert_message(conn, conversation_id, sender_id, content)
        })
    }

    /// Send `content` from `sender_id` to `receiver_id` over their direct
    /// conversation, opening it first if this is their first contact.
    ///
    /// A block in either direction rejects the send before anything is
    /// written. Opening a new conversation additionally needs friendship;
    /// an existing one survives a later un-friending.
    pub fn send_direct_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> StoreResult<Message> {
        self.with_conn(|conn| {
            check_can_message(conn, sender_id, receiver_id)?;
            // A failed insert must not leave a fresh, empty conversation behind.
            let tx = conn.unchecked_transaction()?;
            let conversation_id = match query_conversation_id(&tx, sender_id, receiver_id)? {
                Some(id) => id,
                None => {
                    check_can_start_conversation(&tx, sender_id, receiver_id)?;
                    upsert_conversation(&tx, sender_id, receiver_id)?.0
                }
            };
            let message = insert_message(&tx, conversation_id, sender_id, content)?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// Open the conversation between two friends, or return the existing one.
    /// The relationship check and the upsert run under the same lock.
    pub fn open_conversation(&self, a: UserId, b: UserId) -> StoreResult<(ConversationId, bool)> {
        if a == b {
            return Err(StoreError::Invalid(
                "a conversation needs two distinct participants".into(),
            ));
        }
        self.with_conn(|conn| {
            ensure_users_exist(conn, a, b)?;
            check_can_start_conversation(conn, a, b)?;
            upsert_conversation(conn, a, b)
        })
    }

    /// Post into an existing conversation on behalf of a participant.
    /// Returns the stored message and the other participant. A block in
    /// either direction rejects the post; the check and the insert run under
    /// the same lock.
    pub fn post_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> StoreResult<(Message, UserId)> {
        self.with_conn(|conn| {
            let receiver_id = require_participant(conn, conversation_id, sender_id)?
                .other_participant(sender_id)
                .ok_or(StoreError::Forbidden)?;
            check_can_message(conn, sender_id, receiver_id)?;
            let message = insert_message(conn, conversation_id, sender_id, content)?;
            Ok((message, receiver_id))
        })
    }

    /// Messages in ascending creation order.
    pub fn messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
                MessageRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![conversation_id, limit, offset], MessageRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(Message::from).collect())
        })
    }

    /// Mark every unread message written by the other participant as read.
    /// Returns how many messages changed; a repeated call returns 0.
    pub fn mark_as_read(&self, conversation_id: ConversationId, reader_id: UserId) -> StoreResult<usize> {
        self.with_conn(|conn| {
            require_participant(conn, conversation_id, reader_id)?;
            let updated = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND sender_id <> ?2 AND is_read = 0",
                (conversation_id, reader_id),
            )?;
            Ok(updated)
        })
    }

    /// Delete a message. Only its author may do so.
    pub fn delete_message(&self, message_id: MessageId, requester_id: UserId) -> StoreResult<Message> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM messages WHERE id = ?1", MessageRow::COLUMNS);
            let message: Message = conn
                .query_row(&sql, [message_id], MessageRow::from_row)
                .optional()?
                .ok_or(StoreError::NotFound)?
                .into();

            if message.sender_id != requester_id {
                return Err(StoreError::Forbidden);
            }

            conn.execute("DELETE FROM messages WHERE id = ?1", [message_id])?;
            Ok(message)
        })
    }

    /// Delete a conversation and, by cascade, its messages. Only a
    /// participant may do so.
    pub fn delete_conversation(
        &self,
        conversation_id: ConversationId,
        requester_id: UserId,
    ) -> StoreResult<Conversation> {
        self.with_conn(|conn| {
            let conversation = require_participant(conn, conversation_id, requester_id)?;
            conn.execute("DELETE FROM conversations WHERE id = ?1", [conversation_id])?;
            debug!("Conversation {} deleted by {}", conversation_id, requester_id);
            Ok(conversation)
        })
    }

    /// Every conversation `user_id` takes part in, most recently active first.
    pub fn conversations_for(&self, user_id: UserId) -> StoreResult<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id,
                        CASE WHEN c.user1_id = ?1 THEN c.user2_id ELSE c.user1_id END,
                        c.created_at,
                        last.content,
                        last.created_at,
                        (SELECT COUNT(*) FROM messages u
                          WHERE u.conversation_id = c.id AND u.sender_id <> ?1 AND u.is_read = 0)
                 FROM conversations c
                 LEFT JOIN messages last
                   ON last.id = (SELECT MAX(id) FROM messages WHERE conversation_id = c.id)
                 WHERE c.user1_id = ?1 OR c.user2_id = ?1
                 ORDER BY last.id IS NULL, last.id DESC, c.id DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationSummaryRow {
                        id: row.get(0)?,
                        other_user_id: row.get(1)?,
                        created_at: row.get(2)?,
                        last_message: row.get(3)?,
                        last_message_at: row.get(4)?,
                        unread_count: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows.into_iter().map(ConversationSummary::from).collect())
        })
    }
}

fn upsert_conversation(
    conn: &Connection,
    a: UserId,
    b: UserId,
) -> StoreResult<(ConversationId, bool)> {
    if a == b {
        return Err(StoreError::Invalid(
            "a conversation needs two distinct participants".into(),
        ));
    }
    let (user1, user2) = canonical_pair(a, b);
    ensure_users_exist(conn, user1, user2)?;

    let inserted = conn.execute(
        "INSERT INTO conversations (user1_id, user2_id, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (user1_id, user2_id) DO NOTHING",
        params![user1, user2, now_timestamp()],
    )?;

    let id = query_conversation_id(conn, user1, user2)?.ok_or(StoreError::NotFound)?;
    if inserted > 0 {
        debug!("Conversation {} created for ({}, {})", id, user1, user2);
    }
    Ok((id, inserted > 0))
}

fn query_conversation_id(
    conn: &Connection,
    a: UserId,
    b: UserId,
) -> StoreResult<Option<ConversationId>> {
    let (user1, user2) = canonical_pair(a, b);
    let id = conn
        .query_row(
            "SELECT id FROM conversations WHERE user1_id = ?1 AND user2_id = ?2",
            (user1, user2),
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn query_conversation(
    conn: &Connection,
    conversation_id: ConversationId,
) -> StoreResult<Option<Conversation>> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE id = ?1",
        ConversationRow::COLUMNS
    );
    let row = conn
        .query_row(&sql, [conversation_id], ConversationRow::from_row)
        .optional()?;
    Ok(row.map(Conversation::from))
}

fn require_participant(
    conn: &Connection,
    conversation_id: ConversationId,
    user_id: UserId,
) -> StoreResult<Conversation> {
    let conversation = query_conversation(conn, conversation_id)?.ok_or(StoreError::NotFound)?;
    if !conversation.has_participant(user_id) {
        return Err(StoreError::Forbidden);
    }
    Ok(conversation)
}

fn insert_message(
    conn: &Connection,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
) -> StoreResult<Message> {
    let created_at = now_timestamp();
    conn.execute(
        "INSERT INTO messages (conversation_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![conversation_id, sender_id, content, created_at],
    )?;

    Ok(MessageRow {
        id: conn.last_insert_rowid(),
        conversation_id,
        sender_id,
        content: content.to_string(),
        created_at,
        is_read: false,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    fn setup() -> (Database, UserId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("a", "ta").unwrap();
        let b = db.create_user("b", "tb").unwrap();
        db.add_friend(a, b).unwrap();
        (db, a, b)
    }

    #[test]
    fn get_or_create_is_order_independent() {
        let (db, a, b) = setup();
        let (first, created) = db.get_or_create_conversation(a, b).unwrap();
        let (second, created_again) = db.get_or_create_conversation(b, a).unwrap();

        assert_eq!(first, second);
        assert!(created);
        assert!(!created_again);
        assert_eq!(db.find_conversation(b, a).unwrap(), Some(first));

        let conversation = db.conversation(first).unwrap().unwrap();
        assert!(conversation.user1_id < conversation.user2_id);
    }

    #[test]
    fn concurrent_first_contact_creates_one_row() {
        let (db, a, b) = setup();
        let db = Arc::new(db);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 {
                        db.get_or_create_conversation(a, b).unwrap()
                    } else {
                        db.get_or_create_conversation(b, a).unwrap()
                    }
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let id = results[0].0;
        assert!(results.iter().all(|(cid, _)| *cid == id));
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);

        let rows: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn rejects_self_and_unknown_participants() {
        let (db, a, _) = setup();
        assert!(matches!(
            db.get_or_create_conversation(a, a),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            db.get_or_create_conversation(a, 777),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn messages_come_back_in_creation_order() {
        let (db, a, b) = setup();
        let (cid, _) = db.get_or_create_conversation(a, b).unwrap();
        db.send_message(cid, a, "one").unwrap();
        db.send_message(cid, b, "two").unwrap();
        let last = db.send_message(cid, a, "three").unwrap();

        let messages = db.messages(cid, 50, 0).unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["one", "two", "three"]);
        assert_eq!(messages.last().unwrap().id, last.id);

        let page = db.messages(cid, 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "two");
    }

    #[test]
    fn outsiders_cannot_post() {
        let (db, a, b) = setup();
        let c = db.create_user("c", "tc").unwrap();
        let (cid, _) = db.get_or_create_conversation(a, b).unwrap();

        assert!(matches!(db.send_message(cid, c, "hey"), Err(StoreError::Forbidden)));
        assert!(matches!(db.send_message(4242, a, "hey"), Err(StoreError::NotFound)));
    }

    #[test]
    fn mark_as_read_only_touches_the_other_side() {
        let (db, a, b) = setup();
        let (cid, _) = db.get_or_create_conversation(a, b).unwrap();
        db.send_message(cid, b, "from b 1").unwrap();
        db.send_message(cid, b, "from b 2").unwrap();
        let own = db.send_message(cid, a, "from a").unwrap();

        assert_eq!(db.mark_as_read(cid, a).unwrap(), 2);
        assert_eq!(db.mark_as_read(cid, a).unwrap(), 0);

        let messages = db.messages(cid, 50, 0).unwrap();
        for message in &messages {
            assert_eq!(message.is_read, message.id != own.id, "{}", message.content);
        }
    }

    #[test]
    fn direct_message_respects_blocks_and_friendship() {
        let (db, a, b) = setup();
        let c = db.create_user("c", "tc").unwrap();

        let message = db.send_direct_message(a, b, "hi").unwrap();
        assert_eq!(db.find_conversation(a, b).unwrap(), Some(message.conversation_id));

        // Strangers cannot open a conversation.
        assert!(matches!(db.send_direct_message(a, c, "hi"), Err(StoreError::Forbidden)));
        assert_eq!(db.find_conversation(a, c).unwrap(), None);

        // An existing conversation survives un-friending.
        db.remove_friend(a, b).unwrap();
        db.send_direct_message(b, a, "still here").unwrap();

        // A block in either direction stops it, and nothing is written.
        db.block_user(a, b).unwrap();
        assert!(matches!(db.send_direct_message(b, a, "blocked"), Err(StoreError::Forbidden)));
        assert!(matches!(db.send_direct_message(a, b, "blocked"), Err(StoreError::Forbidden)));
        assert_eq!(db.messages(message.conversation_id, 50, 0).unwrap().len(), 2);
    }

    #[test]
    fn failed_direct_message_leaves_no_conversation() {
        let (db, a, b) = setup();
        db.with_conn(|conn| Ok(conn.execute_batch("DROP TABLE messages")?))
            .unwrap();

        assert!(matches!(
            db.send_direct_message(a, b, "lost"),
            Err(StoreError::Sqlite(_))
        ));
        assert_eq!(db.find_conversation(a, b).unwrap(), None);
    }

    #[test]
    fn open_conversation_checks_the_relationship() {
        let (db, a, b) = setup();
        let c = db.create_user("c", "tc").unwrap();

        let (cid, created) = db.open_conversation(b, a).unwrap();
        assert!(created);
        assert_eq!(db.open_conversation(a, b).unwrap(), (cid, false));

        assert!(matches!(db.open_conversation(a, c), Err(StoreError::Forbidden)));
        assert!(matches!(db.open_conversation(a, a), Err(StoreError::Invalid(_))));
        assert!(matches!(db.open_conversation(a, 777), Err(StoreError::NotFound)));

        db.block_user(b, a).unwrap();
        db.add_friend(a, b).unwrap();
        assert!(matches!(db.open_conversation(a, b), Err(StoreError::Forbidden)));
    }

    #[test]
    fn post_message_checks_membership_and_blocks() {
        let (db, a, b) = setup();
        let c = db.create_user("c", "tc").unwrap();
        let (cid, _) = db.get_or_create_conversation(a, b).unwrap();

        let (message, receiver) = db.post_message(cid, a, "hello").unwrap();
        assert_eq!(receiver, b);
        assert_eq!(message.sender_id, a);

        assert!(matches!(db.post_message(cid, c, "hi"), Err(StoreError::Forbidden)));
        assert!(matches!(db.post_message(cid + 1, a, "hi"), Err(StoreError::NotFound)));

        db.block_user(b, a).unwrap();
        assert!(matches!(db.post_message(cid, a, "after"), Err(StoreError::Forbidden)));
        assert!(matches!(db.post_message(cid, b, "after"), Err(StoreError::Forbidden)));
        assert_eq!(db.messages(cid, 50, 0).unwrap().len(), 1);
    }

    #[test]
    fn only_authors_delete_messages() {
        let (db, a, b) = setup();
        let (cid, _) = db.get_or_create_conversation(a, b).unwrap();
        let message = db.send_message(cid, a, "oops").unwrap();

        assert!(matches!(db.delete_message(message.id, b), Err(StoreError::Forbidden)));
        assert_eq!(db.delete_message(message.id, a).unwrap().id, message.id);
        assert!(matches!(db.delete_message(message.id, a), Err(StoreError::NotFound)));
    }

    #[test]
    fn only_participants_delete_conversations() {
        let (db, a, b) = setup();
        let c = db.create_user("c", "tc").unwrap();
        let (cid, _) = db.get_or_create_conversation(a, b).unwrap();
        db.send_message(cid, a, "bye").unwrap();

        assert!(matches!(db.delete_conversation(cid, c), Err(StoreError::Forbidden)));
        db.delete_conversation(cid, b).unwrap();
        assert!(db.conversation(cid).unwrap().is_none());
        assert!(db.messages(cid, 50, 0).unwrap().is_empty());
    }

    #[test]
    fn other_participant_resolves_both_ways() {
        let (db, a, b) = setup();
        let (cid, _) = db.get_or_create_conversation(a, b).unwrap();
        assert_eq!(db.other_participant(cid, a).unwrap(), b);
        assert_eq!(db.other_participant(cid, b).unwrap(), a);
        assert!(matches!(db.other_participant(cid, 99), Err(StoreError::Forbidden)));
    }

    #[test]
    fn conversation_list_orders_by_activity() {
        let (db, a, b) = setup();
        let c = db.create_user("c", "tc").unwrap();
        db.add_friend(a, c).unwrap();

        let (with_b, _) = db.get_or_create_conversation(a, b).unwrap();
        let (with_c, _) = db.get_or_create_conversation(a, c).unwrap();
        db.send_message(with_c, c, "older").unwrap();
        db.send_message(with_b, b, "newer").unwrap();
        db.send_message(with_b, b, "newest").unwrap();

        let list = db.conversations_for(a).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, with_b);
        assert_eq!(list[0].other_user_id, b);
        assert_eq!(list[0].last_message.as_deref(), Some("newest"));
        assert_eq!(list[0].unread_count, 2);
        assert_eq!(list[1].id, with_c);
        assert_eq!(list[1].unread_count, 1);

        // From b's side nothing is unread: b wrote those messages.
        assert_eq!(db.conversations_for(b).unwrap()[0].unread_count, 0);
    }
}
