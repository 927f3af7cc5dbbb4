use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use murmur_types::models::{MessageId, ReadReceipt, UserId};

use super::{OptionalExt, uuid_at};
use crate::Database;

/// What happened when a reader marked one message.
#[derive(Debug)]
pub enum ReadOutcome {
    /// First read by this reader; the row was created.
    Marked(ReadReceipt),
    AlreadyRead,
    /// Readers never mark their own messages.
    OwnMessage,
    /// The reader is not an active participant of the message's chat.
    NotParticipant,
    MissingMessage,
}

impl Database {
    // -- Read receipts --

    pub fn mark_read(&self, message_id: MessageId, reader_id: UserId, at: DateTime<Utc>) -> Result<ReadOutcome> {
        self.with_tx(|tx| mark_one(tx, message_id, reader_id, at))
    }

    /// Mark a batch in one transaction. Ids that fail any check are skipped;
    /// the receipts for the rows actually created are returned.
    pub fn mark_read_batch(
        &self,
        message_ids: &[MessageId],
        reader_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<ReadReceipt>> {
        self.with_tx(|tx| {
            let mut marked = Vec::new();
            for id in message_ids {
                if let ReadOutcome::Marked(receipt) = mark_one(tx, *id, reader_id, at)? {
                    marked.push(receipt);
                }
            }
            Ok(marked)
        })
    }

    pub fn readers_of(&self, message_id: MessageId) -> Result<Vec<ReadReceipt>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.message_id, m.chat_id, m.sender_id, r.reader_id, r.read_at
                 FROM message_reads r
                 JOIN messages m ON m.id = r.message_id
                 WHERE r.message_id = ?1
                 ORDER BY r.read_at",
            )?;
            let rows = stmt
                .query_map([message_id], |row| {
                    Ok(ReadReceipt {
                        message_id: row.get(0)?,
                        chat_id: uuid_at(row, 1)?,
                        sender_id: row.get(2)?,
                        reader_id: row.get(3)?,
                        read_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn mark_one(conn: &Connection, message_id: MessageId, reader_id: UserId, at: DateTime<Utc>) -> Result<ReadOutcome> {
    let target = conn
        .query_row(
            "SELECT m.chat_id, m.sender_id,
                EXISTS (SELECT 1 FROM participants p
                        WHERE p.chat_id = m.chat_id AND p.user_id = ?2 AND p.is_active = 1)
             FROM messages m WHERE m.id = ?1",
            rusqlite::params![message_id, reader_id],
            |row| Ok((uuid_at(row, 0)?, row.get::<_, UserId>(1)?, row.get::<_, bool>(2)?)),
        )
        .optional()?;

    let Some((chat_id, sender_id, is_participant)) = target else {
        return Ok(ReadOutcome::MissingMessage);
    };
    if sender_id == reader_id {
        return Ok(ReadOutcome::OwnMessage);
    }
    if !is_participant {
        return Ok(ReadOutcome::NotParticipant);
    }

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO message_reads (message_id, reader_id, read_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![message_id, reader_id, at],
    )?;
    if inserted == 0 {
        return Ok(ReadOutcome::AlreadyRead);
    }

    Ok(ReadOutcome::Marked(ReadReceipt {
        message_id,
        chat_id,
        sender_id,
        reader_id,
        read_at: at,
    }))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use murmur_types::models::{Chat, GroupSettings, Role};

    use super::*;

    fn seeded() -> (Database, Chat) {
        let db = Database::open_in_memory().unwrap();
        let chat = Chat {
            id: Uuid::new_v4(),
            is_group: false,
            title: None,
            description: None,
            avatar_url: None,
            owner_id: None,
            created_at: Utc::now(),
            settings: GroupSettings::default(),
            last_message_id: None,
            last_message_preview: None,
            last_message_at: None,
        };
        db.create_chat(&chat, &[(1, Role::Member), (2, Role::Member)]).unwrap();
        (db, chat)
    }

    #[test]
    fn second_mark_is_a_no_op() {
        let (db, chat) = seeded();
        let msg = db.insert_message(chat.id, 1, "read me", Utc::now()).unwrap().unwrap();

        assert!(matches!(db.mark_read(msg.id, 2, Utc::now()).unwrap(), ReadOutcome::Marked(_)));
        assert!(matches!(db.mark_read(msg.id, 2, Utc::now()).unwrap(), ReadOutcome::AlreadyRead));
        assert_eq!(db.readers_of(msg.id).unwrap().len(), 1);
    }

    #[test]
    fn sender_and_outsiders_do_not_mark() {
        let (db, chat) = seeded();
        let msg = db.insert_message(chat.id, 1, "mine", Utc::now()).unwrap().unwrap();

        assert!(matches!(db.mark_read(msg.id, 1, Utc::now()).unwrap(), ReadOutcome::OwnMessage));
        assert!(matches!(db.mark_read(msg.id, 3, Utc::now()).unwrap(), ReadOutcome::NotParticipant));
        assert!(matches!(db.mark_read(9_999, 2, Utc::now()).unwrap(), ReadOutcome::MissingMessage));
        assert!(db.readers_of(msg.id).unwrap().is_empty());
    }

    #[test]
    fn batch_skips_invalid_ids_and_feeds_unread_count() {
        let (db, chat) = seeded();
        let a = db.insert_message(chat.id, 1, "a", Utc::now()).unwrap().unwrap();
        let b = db.insert_message(chat.id, 1, "b", Utc::now()).unwrap().unwrap();
        let c = db.insert_message(chat.id, 1, "c", Utc::now()).unwrap().unwrap();
        assert_eq!(db.unread_count(chat.id, 2).unwrap(), 3);

        let marked = db.mark_read_batch(&[a.id, 424_242, b.id, a.id], 2, Utc::now()).unwrap();
        let ids: Vec<MessageId> = marked.iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        assert_eq!(db.unread_count(chat.id, 2).unwrap(), 1);
        let summaries = db.list_chats_for_user(2).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 1);
        assert_eq!(summaries[0].chat.last_message_id, Some(c.id));
    }
}
