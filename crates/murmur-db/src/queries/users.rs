use anyhow::Result;
use chrono::{DateTime, Utc};

use murmur_types::models::{User, UserId};

use super::{OptionalExt, placeholders};
use crate::Database;

impl Database {
    /// Refresh the cached identity for a user, inserting it if unseen.
    pub fn upsert_user(
        &self,
        id: UserId,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO users (id, username, display_name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    display_name = COALESCE(excluded.display_name, users.display_name)",
                rusqlite::params![id, username, display_name],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, display_name, last_active_at FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                        last_active_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Returns the subset of `ids` that exist in the identity cache.
    pub fn existing_user_ids(&self, ids: &[UserId]) -> Result<Vec<UserId>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!("SELECT id FROM users WHERE id IN ({})", placeholders(ids.len()));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), |row| row.get(0))?
                .collect::<std::result::Result<Vec<UserId>, _>>()?;
            Ok(rows)
        })
    }

    pub fn touch_last_active(&self, id: UserId, at: DateTime<Utc>) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE users SET last_active_at = ?2 WHERE id = ?1",
                rusqlite::params![id, at],
            )?;
            Ok(())
        })
    }

    /// Distinct users sharing at least one active chat with `user_id`.
    /// These are the audience for presence changes.
    pub fn contacts_of(&self, user_id: UserId) -> Result<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT other.user_id
                 FROM participants me
                 JOIN participants other ON other.chat_id = me.chat_id
                 WHERE me.user_id = ?1
                   AND me.is_active = 1
                   AND other.is_active = 1
                   AND other.user_id != ?1",
            )?;
            let rows = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<UserId>, _>>()?;
            Ok(rows)
        })
    }
}
