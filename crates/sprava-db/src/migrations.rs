use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            username    TEXT NOT NULL UNIQUE,
            api_token   TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        -- Friendship is symmetric: one row per pair, smaller id first.
        CREATE TABLE IF NOT EXISTS friends (
            user1_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            user2_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY (user1_id, user2_id),
            CHECK (user1_id < user2_id)
        );

        CREATE INDEX IF NOT EXISTS idx_friends_user2
            ON friends(user2_id);

        CREATE TABLE IF NOT EXISTS blocked_users (
            blocker_id  INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            blocked_id  INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY (blocker_id, blocked_id),
            CHECK (blocker_id <> blocked_id)
        );

        -- Pending requests only; accepting one moves the pair into friends.
        CREATE TABLE IF NOT EXISTS friend_requests (
            sender_id   INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            receiver_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (sender_id, receiver_id),
            CHECK (sender_id <> receiver_id)
        );

        CREATE INDEX IF NOT EXISTS idx_friend_requests_receiver
            ON friend_requests(receiver_id);

        CREATE TABLE IF NOT EXISTS conversations (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user1_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            user2_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at  TEXT NOT NULL,
            UNIQUE (user1_id, user2_id),
            CHECK (user1_id < user2_id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user2
            ON conversations(user2_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            sender_id       INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            content         TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            is_read         INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
