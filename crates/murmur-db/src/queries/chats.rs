use anyhow::Result;
use rusqlite::Connection;

use murmur_types::models::{Chat, ChatId, ChatSummary, GroupSettings, Role, UserId};

use super::{CHAT_COLUMNS, OptionalExt, chat_from_row};
use crate::Database;

/// Result of a settings change. The capacity may not drop below the number
/// of active participants.
#[derive(Debug)]
pub enum SettingsUpdate {
    Applied(Chat),
    BelowActiveCount(u32),
}

impl Database {
    // -- Chats --

    /// Insert a chat together with its initial participants.
    pub fn create_chat(&self, chat: &Chat, members: &[(UserId, Role)]) -> Result<()> {
        self.with_tx(|tx| {
            insert_chat_row(tx, chat)?;
            for (user_id, role) in members {
                insert_participant(tx, chat, *user_id, *role)?;
            }
            Ok(())
        })
    }

    /// Returns the existing direct chat between `a` and `b`, or inserts
    /// `candidate` with both users as members. The bool is true when created.
    pub fn get_or_create_direct_chat(
        &self,
        candidate: &Chat,
        a: UserId,
        b: UserId,
    ) -> Result<(Chat, bool)> {
        self.with_tx(|tx| {
            if let Some(existing) = query_direct_chat(tx, a, b)? {
                return Ok((existing, false));
            }
            insert_chat_row(tx, candidate)?;
            insert_participant(tx, candidate, a, Role::Member)?;
            insert_participant(tx, candidate, b, Role::Member)?;
            Ok((candidate.clone(), true))
        })
    }

    pub fn get_chat(&self, id: ChatId) -> Result<Option<Chat>> {
        self.with_conn(|conn| query_chat(conn, id))
    }

    pub fn get_chat_by_join_link(&self, link: &str) -> Result<Option<Chat>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM chats c WHERE c.join_link = ?1", CHAT_COLUMNS);
            conn.query_row(&sql, [link], chat_from_row).optional()
        })
    }

    /// Active chats of a user, most recently active first, with the number
    /// of messages from others the user has not read.
    pub fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<ChatSummary>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {},
                    (SELECT COUNT(*) FROM messages m
                     WHERE m.chat_id = c.id
                       AND m.sender_id != ?1
                       AND m.is_deleted = 0
                       AND NOT EXISTS (
                           SELECT 1 FROM message_reads r
                           WHERE r.message_id = m.id AND r.reader_id = ?1))
                 FROM chats c
                 JOIN participants p ON p.chat_id = c.id
                 WHERE p.user_id = ?1 AND p.is_active = 1
                 ORDER BY COALESCE(c.last_message_at, c.created_at) DESC",
                CHAT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ChatSummary {
                        chat: chat_from_row(row)?,
                        unread_count: row.get(17)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> Result<u32> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 WHERE m.chat_id = ?1
                   AND m.sender_id != ?2
                   AND m.is_deleted = 0
                   AND NOT EXISTS (
                       SELECT 1 FROM message_reads r
                       WHERE r.message_id = m.id AND r.reader_id = ?2)",
                rusqlite::params![chat_id.to_string(), user_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Update the provided info fields, leaving `None` fields untouched.
    pub fn update_chat_info(
        &self,
        id: ChatId,
        title: Option<&str>,
        description: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Option<Chat>> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE chats SET
                    title = COALESCE(?2, title),
                    description = COALESCE(?3, description),
                    avatar_url = COALESCE(?4, avatar_url)
                 WHERE id = ?1",
                rusqlite::params![id.to_string(), title, description, avatar_url],
            )?;
            query_chat(tx, id)
        })
    }

    /// Replace the policy toggles. The join link is managed separately by
    /// `set_join_link` and is left as is.
    pub fn update_chat_settings(&self, id: ChatId, settings: &GroupSettings) -> Result<SettingsUpdate> {
        self.with_tx(|tx| {
            let active: u32 = tx.query_row(
                "SELECT COUNT(*) FROM participants WHERE chat_id = ?1 AND is_active = 1",
                [id.to_string()],
                |row| row.get(0),
            )?;
            if settings.max_members < active {
                return Ok(SettingsUpdate::BelowActiveCount(active));
            }

            tx.execute(
                "UPDATE chats SET
                    max_members = ?2,
                    only_admins_can_add = ?3,
                    only_admins_can_edit_info = ?4,
                    only_admins_can_send = ?5,
                    allow_members_to_leave = ?6,
                    is_public = ?7
                 WHERE id = ?1",
                rusqlite::params![
                    id.to_string(),
                    settings.max_members,
                    settings.only_admins_can_add,
                    settings.only_admins_can_edit_info,
                    settings.only_admins_can_send,
                    settings.allow_members_to_leave,
                    settings.is_public,
                ],
            )?;

            match query_chat(tx, id)? {
                Some(chat) => Ok(SettingsUpdate::Applied(chat)),
                None => Err(anyhow::anyhow!("Chat vanished during settings update: {}", id)),
            }
        })
    }

    /// Store a new join link and mark the group public.
    pub fn set_join_link(&self, id: ChatId, link: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE chats SET join_link = ?2, is_public = 1 WHERE id = ?1",
                rusqlite::params![id.to_string(), link],
            )?;
            Ok(())
        })
    }

    /// Purge read marks and messages, then participants, then the chat row.
    /// Returns false if the chat did not exist.
    pub fn delete_chat_cascade(&self, id: ChatId) -> Result<bool> {
        self.with_tx(|tx| {
            let cid = id.to_string();
            tx.execute(
                "DELETE FROM message_reads
                 WHERE message_id IN (SELECT id FROM messages WHERE chat_id = ?1)",
                [&cid],
            )?;
            tx.execute("DELETE FROM messages WHERE chat_id = ?1", [&cid])?;
            tx.execute("DELETE FROM participants WHERE chat_id = ?1", [&cid])?;
            let removed = tx.execute("DELETE FROM chats WHERE id = ?1", [&cid])?;
            Ok(removed > 0)
        })
    }
}

pub(crate) fn query_chat(conn: &Connection, id: ChatId) -> Result<Option<Chat>> {
    let sql = format!("SELECT {} FROM chats c WHERE c.id = ?1", CHAT_COLUMNS);
    conn.query_row(&sql, [id.to_string()], chat_from_row).optional()
}

fn query_direct_chat(conn: &Connection, a: UserId, b: UserId) -> Result<Option<Chat>> {
    let sql = format!(
        "SELECT {} FROM chats c
         WHERE c.is_group = 0
           AND EXISTS (SELECT 1 FROM participants p WHERE p.chat_id = c.id AND p.user_id = ?1)
           AND EXISTS (SELECT 1 FROM participants p WHERE p.chat_id = c.id AND p.user_id = ?2)
         LIMIT 1",
        CHAT_COLUMNS
    );
    conn.query_row(&sql, [a, b], chat_from_row).optional()
}

fn insert_chat_row(conn: &Connection, chat: &Chat) -> Result<()> {
    let s = &chat.settings;
    conn.execute(
        "INSERT INTO chats (
            id, is_group, title, description, avatar_url, owner_id, created_at,
            max_members, only_admins_can_add, only_admins_can_edit_info,
            only_admins_can_send, allow_members_to_leave, is_public, join_link
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        rusqlite::params![
            chat.id.to_string(),
            chat.is_group,
            chat.title,
            chat.description,
            chat.avatar_url,
            chat.owner_id,
            chat.created_at,
            s.max_members,
            s.only_admins_can_add,
            s.only_admins_can_edit_info,
            s.only_admins_can_send,
            s.allow_members_to_leave,
            s.is_public,
            s.join_link,
        ],
    )?;
    Ok(())
}

fn insert_participant(conn: &Connection, chat: &Chat, user_id: UserId, role: Role) -> Result<()> {
    conn.execute(
        "INSERT INTO participants (chat_id, user_id, role, is_active, joined_at)
         VALUES (?1, ?2, ?3, 1, ?4)",
        rusqlite::params![chat.id.to_string(), user_id, role.as_str(), chat.created_at],
    )?;
    Ok(())
}
