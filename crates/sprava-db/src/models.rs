//! Database row types. These map directly to SQLite rows and are converted
//! into the `sprava-types` models before leaving the crate.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::Row;
use tracing::warn;

use sprava_types::models::{Conversation, ConversationSummary, FriendRequest, Message};

pub(crate) struct ConversationRow {
    pub id: i64,
    pub user1_id: i64,
    pub user2_id: i64,
    pub created_at: String,
}

impl ConversationRow {
    pub const COLUMNS: &'static str = "id, user1_id, user2_id, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user1_id: row.get(1)?,
            user2_id: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            user1_id: row.user1_id,
            user2_id: row.user2_id,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

pub(crate) struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub created_at: String,
    pub is_read: bool,
}

impl MessageRow {
    pub const COLUMNS: &'static str = "id, conversation_id, sender_id, content, created_at, is_read";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
            is_read: row.get(5)?,
        })
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: parse_timestamp(&row.created_at),
            is_read: row.is_read,
        }
    }
}

pub(crate) struct FriendRequestRow {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub created_at: String,
}

impl FriendRequestRow {
    pub const COLUMNS: &'static str = "sender_id, receiver_id, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sender_id: row.get(0)?,
            receiver_id: row.get(1)?,
            created_at: row.get(2)?,
        })
    }
}

impl From<FriendRequestRow> for FriendRequest {
    fn from(row: FriendRequestRow) -> Self {
        FriendRequest {
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

pub(crate) struct ConversationSummaryRow {
    pub id: i64,
    pub other_user_id: i64,
    pub created_at: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<String>,
    pub unread_count: u32,
}

impl From<ConversationSummaryRow> for ConversationSummary {
    fn from(row: ConversationSummaryRow) -> Self {
        ConversationSummary {
            id: row.id,
            other_user_id: row.other_user_id,
            created_at: parse_timestamp(&row.created_at),
            last_message: row.last_message,
            last_message_at: row.last_message_at.as_deref().map(parse_timestamp),
            unread_count: row.unread_count,
        }
    }
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone; treat it as UTC.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_timestamp_shapes() {
        let written = now_timestamp();
        assert!(parse_timestamp(&written) > DateTime::<Utc>::default());

        let legacy = parse_timestamp("2024-03-01 12:30:00");
        assert_eq!(legacy.to_rfc3339(), "2024-03-01T12:30:00+00:00");

        assert_eq!(parse_timestamp("garbage"), DateTime::<Utc>::default());
    }
}
