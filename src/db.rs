use rusqlite::{Connection, params};
use std::sync::{Mutex, MutexGuard};

pub struct Db {
    pub conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate();
        db
    }

    /// Lock the connection, recovering from a poisoned mutex.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                client_seq INTEGER,
                seq INTEGER,
                msg_type TEXT NOT NULL,
                content TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT,
                group_id TEXT,
                reply_to TEXT,
                forward_from TEXT,
                status TEXT NOT NULL DEFAULT 'sending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                need_read_receipt INTEGER NOT NULL DEFAULT 0,
                recalled_at TEXT,
                edited_at TEXT,
                created_at TEXT NOT NULL,
                extra TEXT DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_messages_sender_recipient
                ON messages(sender, recipient, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_recipient_sender
                ON messages(recipient, sender, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_group
                ON messages(group_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_status
                ON messages(status);
            CREATE INDEX IF NOT EXISTS idx_messages_client_seq
                ON messages(sender, client_seq);

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                peer TEXT NOT NULL,
                kind TEXT NOT NULL,
                last_message_id TEXT,
                last_message_snippet TEXT,
                last_message_at TEXT,
                last_message_seq INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                is_pinned INTEGER NOT NULL DEFAULT 0,
                is_muted INTEGER NOT NULL DEFAULT 0,
                draft TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_owner_peer
                ON conversations(owner, peer, kind);
            CREATE INDEX IF NOT EXISTS idx_conversations_owner
                ON conversations(owner, last_message_at);

            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                member_count INTEGER NOT NULL DEFAULT 0,
                max_members INTEGER NOT NULL DEFAULT 500,
                notice TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                status TEXT NOT NULL DEFAULT 'joined',
                joined_at TEXT NOT NULL,
                mute_until TEXT,
                PRIMARY KEY (group_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_group_members_user
                ON group_members(user_id, status);

            CREATE TABLE IF NOT EXISTS friendships (
                user_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, target_id)
            );
            CREATE INDEX IF NOT EXISTS idx_friendships_target
                ON friendships(target_id, status);",
        )
        .expect("Failed to run migrations");

        // FTS5 full-text index over the searchable part of message content
        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                message_id UNINDEXED,
                sender,
                body,
                tokenize='porter unicode61'
            );",
        )
        .expect("Failed to create FTS5 table");

        // Rebuild the FTS index from existing messages (idempotent)
        rebuild_fts_index(&conn);
    }
}

/// Rebuild the FTS5 index from all stored messages. Called by the repair
/// sweep when the index drifts, and usable from an operator task.
pub fn rebuild_fts_index(conn: &Connection) {
    conn.execute("DELETE FROM messages_fts", []).ok();
    let mut stmt = match conn.prepare("SELECT id, sender, content FROM messages") {
        Ok(s) => s,
        Err(_) => return,
    };
    let rows: Vec<(String, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();
    drop(stmt);
    for (id, sender, content_json) in rows {
        if let Ok(content) = serde_json::from_str::<crate::models::MessageContent>(&content_json)
            && let Some(body) = content.body_text()
        {
            conn.execute(
                "INSERT INTO messages_fts (message_id, sender, body) VALUES (?1, ?2, ?3)",
                params![&id, &sender, body],
            )
            .ok();
        }
    }
}

/// Index one message's searchable text (call inside the insert transaction).
pub fn index_fts(conn: &Connection, message_id: &str, sender: &str, body: &str) {
    conn.execute(
        "INSERT INTO messages_fts (message_id, sender, body) VALUES (?1, ?2, ?3)",
        params![message_id, sender, body],
    )
    .ok();
}

/// Remove a message from the FTS index (call after delete or recall).
pub fn delete_fts(conn: &Connection, message_id: &str) {
    conn.execute(
        "DELETE FROM messages_fts WHERE message_id = ?1",
        [message_id],
    )
    .ok();
}
