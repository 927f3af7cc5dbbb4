use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Identity cache. Rows are owned by the identity service and
        -- refreshed from validated token claims.
        CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY,
            username        TEXT NOT NULL,
            display_name    TEXT,
            last_active_at  TEXT
        );

        CREATE TABLE IF NOT EXISTS chats (
            id                          TEXT PRIMARY KEY,
            is_group                    INTEGER NOT NULL,
            title                       TEXT,
            description                 TEXT,
            avatar_url                  TEXT,
            owner_id                    INTEGER,
            created_at                  TEXT NOT NULL,
            max_members                 INTEGER NOT NULL,
            only_admins_can_add         INTEGER NOT NULL DEFAULT 0,
            only_admins_can_edit_info   INTEGER NOT NULL DEFAULT 0,
            only_admins_can_send        INTEGER NOT NULL DEFAULT 0,
            allow_members_to_leave      INTEGER NOT NULL DEFAULT 1,
            is_public                   INTEGER NOT NULL DEFAULT 0,
            join_link                   TEXT UNIQUE,
            last_message_id             INTEGER,
            last_message_preview        TEXT,
            last_message_at             TEXT,
            CHECK ((is_group = 1) = (owner_id IS NOT NULL))
        );

        CREATE TABLE IF NOT EXISTS participants (
            chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            user_id     INTEGER NOT NULL,
            role        TEXT NOT NULL CHECK (role IN ('owner', 'admin', 'member')),
            is_active   INTEGER NOT NULL DEFAULT 1,
            joined_at   TEXT NOT NULL,
            left_at     TEXT,
            PRIMARY KEY (chat_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON participants(user_id, is_active);

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            sender_id   INTEGER NOT NULL,
            content     TEXT NOT NULL,
            sent_at     TEXT NOT NULL,
            is_edited   INTEGER NOT NULL DEFAULT 0,
            edited_at   TEXT,
            is_deleted  INTEGER NOT NULL DEFAULT 0,
            deleted_at  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, id);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            reader_id   INTEGER NOT NULL,
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, reader_id)
        );

        CREATE INDEX IF NOT EXISTS idx_message_reads_reader
            ON message_reads(reader_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
