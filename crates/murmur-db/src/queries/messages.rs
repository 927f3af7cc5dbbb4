use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use murmur_types::models::{ChatId, DELETED_MESSAGE_PLACEHOLDER, Message, MessageId, UserId};

use super::{MESSAGE_SELECT, OptionalExt, message_from_row};
use crate::Database;

const PREVIEW_CHARS: usize = 100;

impl Database {
    // -- Messages --

    /// Persist a message and refresh the chat's last-message cache in the
    /// same transaction. Ids come from AUTOINCREMENT, so they are strictly
    /// increasing in commit order. Returns None if the chat no longer exists.
    pub fn insert_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        self.with_tx(|tx| {
            let cid = chat_id.to_string();
            let exists = tx
                .query_row("SELECT 1 FROM chats WHERE id = ?1", [&cid], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO messages (chat_id, sender_id, content, sent_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![cid, sender_id, content, sent_at],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE chats SET last_message_id = ?2, last_message_preview = ?3, last_message_at = ?4
                 WHERE id = ?1",
                rusqlite::params![cid, id, preview(content), sent_at],
            )?;

            query_message(tx, id)?
                .map(Some)
                .ok_or_else(|| anyhow!("Inserted message not found: {}", id))
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Newest first. `before` is an exclusive message-id cursor.
    pub fn list_messages(
        &self,
        chat_id: ChatId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE m.chat_id = ?1 AND (?2 IS NULL OR m.id < ?2) ORDER BY m.id DESC LIMIT ?3",
                MESSAGE_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![chat_id.to_string(), before, limit],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Replace the content of a live message. Returns None if the message is
    /// missing or already deleted.
    pub fn edit_message(
        &self,
        id: MessageId,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3
                 WHERE id = ?1 AND is_deleted = 0",
                rusqlite::params![id, content, edited_at],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            tx.execute(
                "UPDATE chats SET last_message_preview = ?2 WHERE last_message_id = ?1",
                rusqlite::params![id, preview(content)],
            )?;
            query_message(tx, id)
        })
    }

    /// Swap the content for the tombstone and flag the row deleted. Returns
    /// None if the message is missing or already deleted.
    pub fn tombstone_message(&self, id: MessageId, deleted_at: DateTime<Utc>) -> Result<Option<Message>> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE messages SET content = ?2, is_deleted = 1, deleted_at = ?3
                 WHERE id = ?1 AND is_deleted = 0",
                rusqlite::params![id, DELETED_MESSAGE_PLACEHOLDER, deleted_at],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            tx.execute(
                "UPDATE chats SET last_message_preview = ?2 WHERE last_message_id = ?1",
                rusqlite::params![id, DELETED_MESSAGE_PLACEHOLDER],
            )?;
            query_message(tx, id)
        })
    }
}

pub(crate) fn query_message(conn: &Connection, id: MessageId) -> Result<Option<Message>> {
    let sql = format!("{} WHERE m.id = ?1", MESSAGE_SELECT);
    conn.query_row(&sql, [id], message_from_row).optional()
}

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}
