use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use murmur_types::models::{ChatId, Participant, Role, UserId};

use super::{OptionalExt, PARTICIPANT_COLUMNS, participant_from_row};
use crate::Database;

/// Outcome of a capacity-checked member batch.
#[derive(Debug, PartialEq, Eq)]
pub enum AddParticipants {
    /// Ids that became active, in request order. Already-active ids are skipped.
    Added(Vec<UserId>),
    /// Nothing was written: the new members would exceed the capacity.
    OverCapacity { active: u32, requested: u32, max: u32 },
}

impl Database {
    // -- Participants --

    pub fn get_participant(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<Participant>> {
        self.with_conn(|conn| query_participant(conn, chat_id, user_id))
    }

    pub fn list_participants(&self, chat_id: ChatId, active_only: bool) -> Result<Vec<Participant>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM participants p
                 WHERE p.chat_id = ?1 AND (?2 = 0 OR p.is_active = 1)
                 ORDER BY p.joined_at, p.user_id",
                PARTICIPANT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![chat_id.to_string(), active_only], participant_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn active_participant_ids(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        self.with_conn(|conn| query_active_ids(conn, chat_id))
    }

    /// Add `user_ids` as Members, reactivating soft-removed rows. The count
    /// check and the inserts share one transaction.
    pub fn add_participants(
        &self,
        chat_id: ChatId,
        user_ids: &[UserId],
        max_members: u32,
        at: DateTime<Utc>,
    ) -> Result<AddParticipants> {
        self.with_tx(|tx| {
            let active: HashSet<UserId> = query_active_ids(tx, chat_id)?.into_iter().collect();

            let mut seen = HashSet::new();
            let fresh: Vec<UserId> = user_ids
                .iter()
                .copied()
                .filter(|id| !active.contains(id) && seen.insert(*id))
                .collect();

            let active_count = active.len() as u32;
            let requested = fresh.len() as u32;
            if active_count + requested > max_members {
                return Ok(AddParticipants::OverCapacity {
                    active: active_count,
                    requested,
                    max: max_members,
                });
            }

            for user_id in &fresh {
                tx.execute(
                    "INSERT INTO participants (chat_id, user_id, role, is_active, joined_at, left_at)
                     VALUES (?1, ?2, 'member', 1, ?3, NULL)
                     ON CONFLICT(chat_id, user_id) DO UPDATE SET
                        role = 'member',
                        is_active = 1,
                        joined_at = excluded.joined_at,
                        left_at = NULL",
                    rusqlite::params![chat_id.to_string(), user_id, at],
                )?;
            }

            Ok(AddParticipants::Added(fresh))
        })
    }

    /// Soft-remove an active participant. Returns false if there was nothing to do.
    pub fn deactivate_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE participants SET is_active = 0, left_at = ?3
                 WHERE chat_id = ?1 AND user_id = ?2 AND is_active = 1 AND role != 'owner'",
                rusqlite::params![chat_id.to_string(), user_id, at],
            )?;
            Ok(changed > 0)
        })
    }

    /// Change a non-owner participant between Admin and Member.
    pub fn set_participant_role(&self, chat_id: ChatId, user_id: UserId, role: Role) -> Result<bool> {
        if role == Role::Owner {
            return Err(anyhow::anyhow!("Owner role is only assigned by ownership transfer"));
        }

        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE participants SET role = ?3
                 WHERE chat_id = ?1 AND user_id = ?2 AND is_active = 1 AND role != 'owner'",
                rusqlite::params![chat_id.to_string(), user_id, role.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Move ownership from `from` to `to` in one transaction: `to` becomes
    /// Owner, `from` becomes Admin, and the chat's owner pointer moves.
    /// Returns false without writing if `from` is not the active owner or
    /// `to` is not an active participant.
    pub fn transfer_ownership(&self, chat_id: ChatId, from: UserId, to: UserId) -> Result<bool> {
        self.with_tx(|tx| {
            let current = query_participant(tx, chat_id, from)?;
            let next = query_participant(tx, chat_id, to)?;

            let from_is_owner = matches!(&current, Some(p) if p.is_active && p.role == Role::Owner);
            let to_is_active = matches!(&next, Some(p) if p.is_active);
            if !from_is_owner || !to_is_active || from == to {
                return Ok(false);
            }

            let cid = chat_id.to_string();
            tx.execute(
                "UPDATE participants SET role = 'admin' WHERE chat_id = ?1 AND user_id = ?2",
                rusqlite::params![cid, from],
            )?;
            tx.execute(
                "UPDATE participants SET role = 'owner' WHERE chat_id = ?1 AND user_id = ?2",
                rusqlite::params![cid, to],
            )?;
            tx.execute(
                "UPDATE chats SET owner_id = ?2 WHERE id = ?1",
                rusqlite::params![cid, to],
            )?;
            Ok(true)
        })
    }
}

pub(crate) fn query_participant(
    conn: &Connection,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<Option<Participant>> {
    let sql = format!(
        "SELECT {} FROM participants p WHERE p.chat_id = ?1 AND p.user_id = ?2",
        PARTICIPANT_COLUMNS
    );
    conn.query_row(&sql, rusqlite::params![chat_id.to_string(), user_id], participant_from_row)
        .optional()
}

pub(crate) fn query_active_ids(conn: &Connection, chat_id: ChatId) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM participants WHERE chat_id = ?1 AND is_active = 1 ORDER BY user_id",
    )?;
    let rows = stmt
        .query_map([chat_id.to_string()], |row| row.get(0))?
        .collect::<std::result::Result<Vec<UserId>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use murmur_types::models::{Chat, GroupSettings};

    use super::*;

    fn group(db: &Database, owner: UserId, members: &[UserId], max_members: u32) -> Chat {
        let chat = Chat {
            id: Uuid::new_v4(),
            is_group: true,
            title: Some("crew".into()),
            description: None,
            avatar_url: None,
            owner_id: Some(owner),
            created_at: Utc::now(),
            settings: GroupSettings { max_members, ..GroupSettings::default() },
            last_message_id: None,
            last_message_preview: None,
            last_message_at: None,
        };
        let mut rows = vec![(owner, Role::Owner)];
        rows.extend(members.iter().map(|m| (*m, Role::Member)));
        db.create_chat(&chat, &rows).unwrap();
        chat
    }

    #[test]
    fn add_skips_active_and_duplicates() {
        let db = Database::open_in_memory().unwrap();
        let chat = group(&db, 1, &[2], 10);

        let outcome = db.add_participants(chat.id, &[2, 3, 3, 4], 10, Utc::now()).unwrap();
        assert_eq!(outcome, AddParticipants::Added(vec![3, 4]));
        assert_eq!(db.active_participant_ids(chat.id).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn add_over_capacity_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let chat = group(&db, 1, &[2], 4);

        let outcome = db.add_participants(chat.id, &[3, 4, 5], 4, Utc::now()).unwrap();
        assert_eq!(
            outcome,
            AddParticipants::OverCapacity { active: 2, requested: 3, max: 4 }
        );
        assert_eq!(db.active_participant_ids(chat.id).unwrap(), vec![1, 2]);
    }

    #[test]
    fn removed_member_is_reactivated_not_duplicated() {
        let db = Database::open_in_memory().unwrap();
        let chat = group(&db, 1, &[2], 10);

        assert!(db.set_participant_role(chat.id, 2, Role::Admin).unwrap());
        assert!(db.deactivate_participant(chat.id, 2, Utc::now()).unwrap());
        assert!(!db.deactivate_participant(chat.id, 2, Utc::now()).unwrap());

        db.add_participants(chat.id, &[2], 10, Utc::now()).unwrap();
        let p = db.get_participant(chat.id, 2).unwrap().unwrap();
        assert!(p.is_active);
        assert_eq!(p.role, Role::Member);
        assert!(p.left_at.is_none());
        assert_eq!(db.list_participants(chat.id, false).unwrap().len(), 2);
    }

    #[test]
    fn owner_row_is_never_deactivated_or_demoted_directly() {
        let db = Database::open_in_memory().unwrap();
        let chat = group(&db, 1, &[2], 10);

        assert!(!db.deactivate_participant(chat.id, 1, Utc::now()).unwrap());
        assert!(!db.set_participant_role(chat.id, 1, Role::Member).unwrap());
        assert!(db.set_participant_role(chat.id, 2, Role::Owner).is_err());
    }

    #[test]
    fn transfer_moves_owner_and_demotes_to_admin() {
        let db = Database::open_in_memory().unwrap();
        let chat = group(&db, 1, &[2], 10);

        assert!(!db.transfer_ownership(chat.id, 1, 9).unwrap());
        assert!(db.transfer_ownership(chat.id, 1, 2).unwrap());

        assert_eq!(db.get_participant(chat.id, 2).unwrap().unwrap().role, Role::Owner);
        assert_eq!(db.get_participant(chat.id, 1).unwrap().unwrap().role, Role::Admin);
        assert_eq!(db.get_chat(chat.id).unwrap().unwrap().owner_id, Some(2));

        // the old owner can no longer transfer
        assert!(!db.transfer_ownership(chat.id, 1, 2).unwrap());
    }
}
