//! Repository-style queries, one file per entity. Every multi-row write runs
//! inside `Database::with_tx`.

mod chats;
mod messages;
mod participants;
mod reads;
mod users;

pub use chats::SettingsUpdate;
pub use participants::AddParticipants;
pub use reads::ReadOutcome;

use anyhow::Result;
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use murmur_types::models::{Chat, GroupSettings, Message, Participant, Role};

pub(crate) const CHAT_COLUMNS: &str = "c.id, c.is_group, c.title, c.description, c.avatar_url, \
     c.owner_id, c.created_at, c.max_members, c.only_admins_can_add, c.only_admins_can_edit_info, \
     c.only_admins_can_send, c.allow_members_to_leave, c.is_public, c.join_link, \
     c.last_message_id, c.last_message_preview, c.last_message_at";

pub(crate) const PARTICIPANT_COLUMNS: &str =
    "p.chat_id, p.user_id, p.role, p.is_active, p.joined_at, p.left_at";

// JOIN users to fetch the sender name in a single query
pub(crate) const MESSAGE_SELECT: &str = "SELECT m.id, m.chat_id, m.sender_id, \
     COALESCE(u.display_name, u.username, 'unknown'), m.content, m.sent_at, \
     m.is_edited, m.edited_at, m.is_deleted, m.deleted_at \
     FROM messages m LEFT JOIN users u ON u.id = m.sender_id";

pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn role_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Role> {
    let raw: String = row.get(idx)?;
    raw.parse::<Role>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: uuid_at(row, 0)?,
        is_group: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        avatar_url: row.get(4)?,
        owner_id: row.get(5)?,
        created_at: row.get(6)?,
        settings: GroupSettings {
            max_members: row.get(7)?,
            only_admins_can_add: row.get(8)?,
            only_admins_can_edit_info: row.get(9)?,
            only_admins_can_send: row.get(10)?,
            allow_members_to_leave: row.get(11)?,
            is_public: row.get(12)?,
            join_link: row.get(13)?,
        },
        last_message_id: row.get(14)?,
        last_message_preview: row.get(15)?,
        last_message_at: row.get(16)?,
    })
}

pub(crate) fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        chat_id: uuid_at(row, 0)?,
        user_id: row.get(1)?,
        role: role_at(row, 2)?,
        is_active: row.get(3)?,
        joined_at: row.get(4)?,
        left_at: row.get(5)?,
    })
}

pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chat_id: uuid_at(row, 1)?,
        sender_id: row.get(2)?,
        sender_username: row.get(3)?,
        content: row.get(4)?,
        sent_at: row.get(5)?,
        is_edited: row.get(6)?,
        edited_at: row.get(7)?,
        is_deleted: row.get(8)?,
        deleted_at: row.get(9)?,
    })
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// `?1, ?2, ... ?n` for IN clauses.
pub(crate) fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}
