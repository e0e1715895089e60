// Message store operations. Free functions over a borrowed connection so the
// orchestrator can run them inside its own transaction, and background
// workers can run them on their own connections.

use crate::models::{ChatKind, Message, MessageContent, MessageStatus, UserStats};
use rusqlite::{Connection, params};
use std::collections::HashMap;

pub const MESSAGE_COLUMNS: &str = "id, client_seq, seq, msg_type, content, sender, recipient, \
     group_id, reply_to, forward_from, status, retry_count, need_read_receipt, recalled_at, \
     edited_at, created_at, extra";

pub fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let content_str: String = row.get(4)?;
    let content = serde_json::from_str::<MessageContent>(&content_str).unwrap_or(
        MessageContent::Custom {
            payload: serde_json::json!({}),
        },
    );
    let status_str: String = row.get(10)?;
    let extra_str: Option<String> = row.get(16)?;
    Ok(Message {
        id: row.get(0)?,
        client_seq: row.get(1)?,
        seq: row.get(2)?,
        content,
        sender: row.get(5)?,
        recipient: row.get(6)?,
        group_id: row.get(7)?,
        reply_to: row.get(8)?,
        forward_from: row.get(9)?,
        status: MessageStatus::parse(&status_str).unwrap_or(MessageStatus::Sending),
        retry_count: row.get(11)?,
        need_read_receipt: row.get::<_, i64>(12)? != 0,
        recalled_at: row.get(13)?,
        edited_at: row.get(14)?,
        created_at: row.get(15)?,
        extra: extra_str
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::json!({})),
    })
}

/// Insert a message row and index its searchable text. Runs inside the
/// orchestrator's transaction.
pub fn insert_message(conn: &Connection, msg: &Message) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO messages (id, client_seq, seq, msg_type, content, sender, recipient, \
         group_id, reply_to, forward_from, status, retry_count, need_read_receipt, recalled_at, \
         edited_at, created_at, extra) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            &msg.id,
            &msg.client_seq,
            &msg.seq,
            msg.content.type_name(),
            serde_json::to_string(&msg.content).unwrap_or_default(),
            &msg.sender,
            &msg.recipient,
            &msg.group_id,
            &msg.reply_to,
            &msg.forward_from,
            msg.status.as_str(),
            &msg.retry_count,
            msg.need_read_receipt as i64,
            &msg.recalled_at,
            &msg.edited_at,
            &msg.created_at,
            serde_json::to_string(&msg.extra).unwrap_or_default(),
        ],
    )?;
    if let Some(body) = msg.content.body_text() {
        crate::db::index_fts(conn, &msg.id, &msg.sender, body);
    }
    Ok(())
}

pub fn get_message(conn: &Connection, id: &str) -> Option<Message> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        params![id],
        row_to_message,
    )
    .ok()
}

pub fn delete_message(conn: &Connection, id: &str) -> bool {
    crate::db::delete_fts(conn, id);
    conn.execute("DELETE FROM messages WHERE id = ?1", params![id])
        .map(|n| n > 0)
        .unwrap_or(false)
}

/// Dedupe fallback: locate the stored row for a retried submission.
pub fn find_by_client_seq(conn: &Connection, sender: &str, client_seq: i64) -> Option<Message> {
    conn.query_row(
        &format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE sender = ?1 AND client_seq = ?2 \
             ORDER BY created_at DESC LIMIT 1"
        ),
        params![sender, client_seq],
        row_to_message,
    )
    .ok()
}

/// Compare-and-set a status transition. The guard is derived from the
/// status lattice (`MessageStatus::sources_of`), so legal transitions are
/// defined in exactly one place. Returns true when the row moved; false
/// means it was in no legal source state (already advanced, or never
/// there) — which keeps replayed events idempotent.
pub fn cas_status(conn: &Connection, id: &str, to: MessageStatus) -> rusqlite::Result<bool> {
    let from = MessageStatus::sources_of(to);
    let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 3)).collect();
    let sql = format!(
        "UPDATE messages SET status = ?1 WHERE id = ?2 AND status IN ({})",
        placeholders.join(",")
    );
    let mut param_values: Vec<String> = vec![to.as_str().to_string(), id.to_string()];
    for s in &from {
        param_values.push(s.as_str().to_string());
    }
    let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
        .iter()
        .map(|v| v as &dyn rusqlite::types::ToSql)
        .collect();
    Ok(conn.execute(&sql, params_refs.as_slice())? > 0)
}

/// Recall stamp: only messages already past the send barrier can be
/// recalled. Same lattice-derived guard as `cas_status`, plus the
/// `recalled_at` timestamp in the one statement.
pub fn mark_recalled(conn: &Connection, id: &str, now: &str) -> rusqlite::Result<bool> {
    let from = MessageStatus::sources_of(MessageStatus::Recalled);
    let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 3)).collect();
    let sql = format!(
        "UPDATE messages SET status = 'recalled', recalled_at = ?1 \
         WHERE id = ?2 AND status IN ({})",
        placeholders.join(",")
    );
    let mut param_values: Vec<String> = vec![now.to_string(), id.to_string()];
    for s in &from {
        param_values.push(s.as_str().to_string());
    }
    let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
        .iter()
        .map(|v| v as &dyn rusqlite::types::ToSql)
        .collect();
    let changed = conn.execute(&sql, params_refs.as_slice())?;
    if changed > 0 {
        // Recalled content no longer participates in search
        crate::db::delete_fts(conn, id);
    }
    Ok(changed > 0)
}

pub fn bump_retry_count(conn: &Connection, id: &str) {
    conn.execute(
        "UPDATE messages SET retry_count = retry_count + 1 WHERE id = ?1",
        params![id],
    )
    .ok();
}

pub fn list_by_user(conn: &Connection, user: &str, limit: i64, offset: i64) -> Vec<Message> {
    let mut stmt = match conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE sender = ?1 OR recipient = ?1 \
         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
    )) {
        Ok(s) => s,
        Err(_) => return vec![],
    };
    stmt.query_map(params![user, limit, offset], row_to_message)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

pub fn list_by_group(conn: &Connection, group_id: &str, limit: i64, offset: i64) -> Vec<Message> {
    let mut stmt = match conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE group_id = ?1 \
         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
    )) {
        Ok(s) => s,
        Err(_) => return vec![],
    };
    stmt.query_map(params![group_id, limit, offset], row_to_message)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

/// Outbox scan: rows stuck in `failed`, oldest first.
pub fn list_failed(conn: &Connection, limit: i64) -> Vec<Message> {
    let mut stmt = match conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE status = 'failed' ORDER BY created_at ASC LIMIT ?1"
    )) {
        Ok(s) => s,
        Err(_) => return vec![],
    };
    stmt.query_map(params![limit], row_to_message)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

// --- Cursor-paginated history ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryDirection {
    Before,
    After,
}

impl HistoryDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "before" => Some(HistoryDirection::Before),
            "after" => Some(HistoryDirection::After),
            _ => None,
        }
    }
}

/// Cursors are opaque to callers: base64 of the boundary row's
/// `created_at` plus its id as a tiebreak.
pub fn encode_cursor(created_at: &str, id: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("{created_at}|{id}"))
}

pub fn decode_cursor(cursor: &str) -> Option<(String, String)> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(cursor)
        .ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (created_at, id) = raw.split_once('|')?;
    Some((created_at.to_string(), id.to_string()))
}

/// Cursor-paginated history for one conversation as seen by `user`.
/// Results come back ordered in the requested direction; `next_cursor` is
/// present only when more rows exist past the page.
pub fn history(
    conn: &Connection,
    user: &str,
    peer: &str,
    kind: ChatKind,
    limit: i64,
    cursor: Option<&str>,
    direction: HistoryDirection,
) -> (Vec<Message>, Option<String>) {
    let limit = limit.clamp(1, 100);

    let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE ");
    let mut param_values: Vec<String> = Vec::new();
    let mut idx = 1;

    match kind {
        ChatKind::Group => {
            sql.push_str(&format!("group_id = ?{idx}"));
            param_values.push(peer.to_string());
            idx += 1;
        }
        ChatKind::Single | ChatKind::Agent => {
            sql.push_str(&format!(
                "((sender = ?{} AND recipient = ?{}) OR (sender = ?{} AND recipient = ?{}))",
                idx,
                idx + 1,
                idx + 2,
                idx + 3
            ));
            param_values.push(user.to_string());
            param_values.push(peer.to_string());
            param_values.push(peer.to_string());
            param_values.push(user.to_string());
            idx += 4;
        }
    }

    if let Some(c) = cursor.and_then(decode_cursor) {
        let (boundary_at, boundary_id) = c;
        match direction {
            HistoryDirection::Before => {
                sql.push_str(&format!(
                    " AND (created_at < ?{} OR (created_at = ?{} AND id < ?{}))",
                    idx,
                    idx,
                    idx + 1
                ));
            }
            HistoryDirection::After => {
                sql.push_str(&format!(
                    " AND (created_at > ?{} OR (created_at = ?{} AND id > ?{}))",
                    idx,
                    idx,
                    idx + 1
                ));
            }
        }
        param_values.push(boundary_at);
        param_values.push(boundary_id);
        idx += 2;
    }

    match direction {
        HistoryDirection::Before => {
            sql.push_str(&format!(" ORDER BY created_at DESC, id DESC LIMIT ?{idx}"))
        }
        HistoryDirection::After => {
            sql.push_str(&format!(" ORDER BY created_at ASC, id ASC LIMIT ?{idx}"))
        }
    }
    // Fetch one extra row to learn whether another page exists
    param_values.push((limit + 1).to_string());

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(_) => return (vec![], None),
    };
    let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
        .iter()
        .map(|v| v as &dyn rusqlite::types::ToSql)
        .collect();

    let mut messages: Vec<Message> = stmt
        .query_map(params_refs.as_slice(), row_to_message)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();

    let has_more = messages.len() as i64 > limit;
    if has_more {
        messages.truncate(limit as usize);
    }
    let next_cursor = if has_more {
        messages
            .last()
            .map(|m| encode_cursor(&m.created_at, &m.id))
    } else {
        None
    };

    (messages, next_cursor)
}

// --- Search ---

const PARTICIPATION_SCOPE: &str = "((m.group_id IS NULL AND (m.sender = ?1 OR m.recipient = ?1)) \
     OR m.group_id IN (SELECT group_id FROM group_members \
                       WHERE user_id = ?1 AND status = 'joined'))";

/// Keyword search scoped to the caller's own single chats and joined groups.
/// Tries the FTS5 index first (relevance rank, then recency), falling back
/// to a LIKE scan for queries FTS rejects.
pub fn search(conn: &Connection, user: &str, query: &str, limit: i64) -> Vec<Message> {
    let limit = limit.clamp(1, 100);

    let fts_result: Result<Vec<Message>, rusqlite::Error> = (|| {
        // Strip FTS5 special characters and quote each term; porter
        // stemming still applies inside the quotes.
        let fts_query: String = query
            .split_whitespace()
            .map(|word| {
                let clean: String = word
                    .chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || *c == '\'')
                    .collect();
                format!("\"{}\"", clean.replace('"', "\"\""))
            })
            .filter(|s| s != "\"\"")
            .collect::<Vec<_>>()
            .join(" ");
        if fts_query.is_empty() {
            return Err(rusqlite::Error::InvalidQuery);
        }

        let sql = format!(
            "SELECT {} FROM messages_fts f \
             JOIN messages m ON m.id = f.message_id \
             WHERE messages_fts MATCH ?2 AND m.status != 'recalled' AND {} \
             ORDER BY rank, m.created_at DESC LIMIT ?3",
            message_columns_prefixed("m"),
            PARTICIPATION_SCOPE
        );
        let mut stmt = conn.prepare(&sql)?;
        let results: Vec<Message> = stmt
            .query_map(params![user, fts_query, limit], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    })();

    match fts_result {
        Ok(r) => r,
        Err(_) => {
            let escaped = query
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            let like_pattern = format!("%{escaped}%");
            let sql = format!(
                "SELECT {} FROM messages m \
                 WHERE m.content LIKE ?2 ESCAPE '\\' AND m.status != 'recalled' AND {} \
                 ORDER BY m.created_at DESC LIMIT ?3",
                message_columns_prefixed("m"),
                PARTICIPATION_SCOPE
            );
            let mut stmt = match conn.prepare(&sql) {
                Ok(s) => s,
                Err(_) => return vec![],
            };
            stmt.query_map(params![user, like_pattern, limit], row_to_message)
                .map(|rows| rows.filter_map(|r| r.ok()).collect())
                .unwrap_or_default()
        }
    }
}

fn message_columns_prefixed(alias: &str) -> String {
    MESSAGE_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// --- Stats ---

/// Sent/received counts for one user over an optional time range, with a
/// per-type breakdown of the sent side.
pub fn user_stats(
    conn: &Connection,
    user: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> UserStats {
    let from = from.unwrap_or("");
    let to = to.unwrap_or("9999");

    let sent: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM messages \
             WHERE sender = ?1 AND created_at >= ?2 AND created_at <= ?3",
            params![user, from, to],
            |r| r.get(0),
        )
        .unwrap_or(0);

    let received: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM messages m \
             WHERE m.sender != ?1 AND m.created_at >= ?2 AND m.created_at <= ?3 \
               AND (m.recipient = ?1 OR m.group_id IN \
                    (SELECT group_id FROM group_members WHERE user_id = ?1 AND status = 'joined'))",
            params![user, from, to],
            |r| r.get(0),
        )
        .unwrap_or(0);

    let mut by_type: HashMap<String, i64> = HashMap::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT msg_type, COUNT(*) FROM messages \
         WHERE sender = ?1 AND created_at >= ?2 AND created_at <= ?3 \
         GROUP BY msg_type",
    ) {
        let rows = stmt
            .query_map(params![user, from, to], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map(|rows| rows.filter_map(|r| r.ok()).collect::<Vec<_>>())
            .unwrap_or_default();
        for (t, n) in rows {
            by_type.insert(t, n);
        }
    }

    UserStats {
        user_id: user.to_string(),
        sent,
        received,
        by_type,
    }
}

pub fn counts_by_status(conn: &Connection) -> HashMap<String, i64> {
    let mut out = HashMap::new();
    if let Ok(mut stmt) = conn.prepare("SELECT status, COUNT(*) FROM messages GROUP BY status") {
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map(|rows| rows.filter_map(|r| r.ok()).collect::<Vec<_>>())
            .unwrap_or_default();
        for (s, n) in rows {
            out.insert(s, n);
        }
    }
    out
}

/// Highest assigned seq for one conversation; seeds the sequence counter
/// after a restart.
pub fn max_seq_for(conn: &Connection, user: &str, peer: &str, kind: ChatKind) -> i64 {
    match kind {
        ChatKind::Group => conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE group_id = ?1",
                params![peer],
                |r| r.get(0),
            )
            .unwrap_or(0),
        ChatKind::Single | ChatKind::Agent => conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM messages \
                 WHERE (sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1)",
                params![user, peer],
                |r| r.get(0),
            )
            .unwrap_or(0),
    }
}
