// Conversation fan-out. Runs off the acknowledgement path: a background
// worker consumes MessageSent events from the bus and projects them into
// per-recipient conversation rows. The message row is the source of truth;
// everything here is a derived cache with a periodic repair sweep.

use crate::config::CoreConfig;
use crate::events::CoreEvent;
use crate::models::{ChatKind, Message, MessageStatus};
use crate::permission;
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub const RECALLED_SNIPPET: &str = "[Recalled]";

/// Pending unread increments for batched group fan-out, keyed by
/// (owner, peer, kind). Reconciled into the durable rows eventually.
#[derive(Default)]
pub struct UnreadLedger {
    pending: Mutex<HashMap<(String, String, String), i64>>,
}

impl UnreadLedger {
    pub fn add(&self, owner: &str, peer: &str, kind: ChatKind, delta: i64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending
            .entry((
                owner.to_string(),
                peer.to_string(),
                kind.as_str().to_string(),
            ))
            .or_insert(0) += delta;
    }

    pub fn drain(&self) -> Vec<((String, String, String), i64)> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.drain().collect()
    }

    pub fn pending_len(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.len()
    }
}

/// Upsert one conversation row for a newly sent message. The last-message
/// snapshot only moves forward (guarded by seq), so late fan-outs of older
/// messages cannot clobber a newer snapshot; the unread delta always applies.
pub fn upsert_conversation(
    conn: &Connection,
    owner: &str,
    peer: &str,
    kind: ChatKind,
    msg: &Message,
    snippet: &str,
    unread_delta: i64,
) -> rusqlite::Result<()> {
    let seq = msg.seq.unwrap_or(0);
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO conversations \
         (id, owner, peer, kind, last_message_id, last_message_snippet, last_message_at, \
          last_message_seq, unread_count, is_pinned, is_muted, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?10) \
         ON CONFLICT(owner, peer, kind) DO UPDATE SET \
           last_message_id = CASE WHEN conversations.last_message_seq < excluded.last_message_seq \
             THEN excluded.last_message_id ELSE conversations.last_message_id END, \
           last_message_snippet = CASE WHEN conversations.last_message_seq < excluded.last_message_seq \
             THEN excluded.last_message_snippet ELSE conversations.last_message_snippet END, \
           last_message_at = CASE WHEN conversations.last_message_seq < excluded.last_message_seq \
             THEN excluded.last_message_at ELSE conversations.last_message_at END, \
           last_message_seq = MAX(conversations.last_message_seq, excluded.last_message_seq), \
           unread_count = conversations.unread_count + ?11, \
           updated_at = excluded.updated_at",
        params![
            uuid::Uuid::new_v4().to_string(),
            owner,
            peer,
            kind.as_str(),
            &msg.id,
            snippet,
            &msg.created_at,
            seq,
            unread_delta,
            &now,
            unread_delta,
        ],
    )?;
    Ok(())
}

/// One multi-row upsert for a batch of group members. Touches the snapshot
/// columns only; unread increments go through the ledger.
fn batch_upsert_members(
    conn: &Connection,
    members: &[String],
    group_id: &str,
    msg: &Message,
    snippet: &str,
) -> rusqlite::Result<()> {
    if members.is_empty() {
        return Ok(());
    }
    let seq = msg.seq.unwrap_or(0);
    let now = chrono::Utc::now().to_rfc3339();

    let mut sql = String::from(
        "INSERT INTO conversations \
         (id, owner, peer, kind, last_message_id, last_message_snippet, last_message_at, \
          last_message_seq, unread_count, is_pinned, is_muted, created_at, updated_at) VALUES ",
    );
    let mut param_values: Vec<String> = Vec::new();
    let mut idx = 1;
    for (i, member) in members.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&format!(
            "(?{}, ?{}, ?{}, 'group', ?{}, ?{}, ?{}, ?{}, 0, 0, 0, ?{}, ?{})",
            idx,
            idx + 1,
            idx + 2,
            idx + 3,
            idx + 4,
            idx + 5,
            idx + 6,
            idx + 7,
            idx + 7
        ));
        param_values.push(uuid::Uuid::new_v4().to_string());
        param_values.push(member.clone());
        param_values.push(group_id.to_string());
        param_values.push(msg.id.clone());
        param_values.push(snippet.to_string());
        param_values.push(msg.created_at.clone());
        param_values.push(seq.to_string());
        param_values.push(now.clone());
        idx += 8;
    }
    sql.push_str(
        " ON CONFLICT(owner, peer, kind) DO UPDATE SET \
          last_message_id = CASE WHEN conversations.last_message_seq < excluded.last_message_seq \
            THEN excluded.last_message_id ELSE conversations.last_message_id END, \
          last_message_snippet = CASE WHEN conversations.last_message_seq < excluded.last_message_seq \
            THEN excluded.last_message_snippet ELSE conversations.last_message_snippet END, \
          last_message_at = CASE WHEN conversations.last_message_seq < excluded.last_message_seq \
            THEN excluded.last_message_at ELSE conversations.last_message_at END, \
          last_message_seq = MAX(conversations.last_message_seq, excluded.last_message_seq), \
          updated_at = excluded.updated_at",
    );

    let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
        .iter()
        .map(|v| v as &dyn rusqlite::types::ToSql)
        .collect();
    conn.execute(&sql, params_refs.as_slice())?;
    Ok(())
}

/// Apply pending unread deltas to the durable rows. Returns how many
/// conversations were touched.
pub fn flush_unread(conn: &Connection, ledger: &UnreadLedger) -> usize {
    let drained = ledger.drain();
    let mut applied = 0;
    for ((owner, peer, kind), delta) in drained {
        if delta == 0 {
            continue;
        }
        let changed = conn
            .execute(
                "UPDATE conversations SET unread_count = MAX(unread_count + ?1, 0) \
                 WHERE owner = ?2 AND peer = ?3 AND kind = ?4",
                params![delta, owner, peer, kind],
            )
            .unwrap_or(0);
        if changed > 0 {
            applied += 1;
        } else {
            // Row not there yet; put the delta back for the next flush
            if let Some(k) = ChatKind::parse(&kind) {
                ledger.add(&owner, &peer, k, delta);
            }
        }
    }
    applied
}

/// Project one sent message into conversation rows: the sender's own row
/// (no unread bump), then every recipient's row with an unread increment.
pub fn apply_message_fanout(
    conn: &Connection,
    ledger: &UnreadLedger,
    config: &CoreConfig,
    msg: &Message,
) -> rusqlite::Result<()> {
    let snippet = msg.content.snippet(config.snippet_max_chars);

    match msg.group_id {
        Some(ref group_id) => {
            upsert_conversation(conn, &msg.sender, group_id, ChatKind::Group, msg, &snippet, 0)?;

            let members = permission::joined_members(conn, group_id, Some(&msg.sender));
            for chunk in members.chunks(config.group_fanout_batch.max(1)) {
                match batch_upsert_members(conn, chunk, group_id, msg, &snippet) {
                    Ok(()) => {
                        for member in chunk {
                            ledger.add(member, group_id, ChatKind::Group, 1);
                        }
                    }
                    Err(e) => {
                        // Batched path failed; per-member loop keeps it correct
                        eprintln!(
                            "⚠️ Batched fan-out failed for group {group_id}: {e}, falling back"
                        );
                        for member in chunk {
                            upsert_conversation(
                                conn,
                                member,
                                group_id,
                                ChatKind::Group,
                                msg,
                                &snippet,
                                1,
                            )?;
                        }
                    }
                }
            }
            flush_unread(conn, ledger);
        }
        None => {
            let Some(ref recipient) = msg.recipient else {
                return Ok(());
            };
            upsert_conversation(
                conn,
                &msg.sender,
                recipient,
                ChatKind::Single,
                msg,
                &snippet,
                0,
            )?;
            upsert_conversation(
                conn,
                recipient,
                &msg.sender,
                ChatKind::Single,
                msg,
                &snippet,
                1,
            )?;
        }
    }
    Ok(())
}

/// Rewrite the snippet of any conversation whose last message was recalled.
pub fn apply_recall_fanout(conn: &Connection, msg: &Message) -> rusqlite::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE conversations SET last_message_snippet = ?1, updated_at = ?2 \
         WHERE last_message_id = ?3",
        params![RECALLED_SNIPPET, &now, &msg.id],
    )?;
    Ok(())
}

/// Spawns the fan-out worker: subscribes to the event bus and projects sent
/// and recalled messages into conversation rows, on its own connection.
pub fn spawn_fanout_worker(
    mut receiver: broadcast::Receiver<CoreEvent>,
    db_path: String,
    ledger: Arc<UnreadLedger>,
    config: CoreConfig,
) {
    tokio::spawn(async move {
        let conn = match Connection::open(&db_path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("⚠️ Fan-out worker: failed to open DB: {e}");
                return;
            }
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .ok();

        loop {
            match receiver.recv().await {
                Ok(CoreEvent::MessageSent(msg)) => {
                    if let Err(e) = apply_message_fanout(&conn, &ledger, &config, &msg) {
                        // The repair sweep reconciles whatever this missed
                        eprintln!("⚠️ Fan-out failed for message {}: {e}", msg.id);
                    }
                }
                Ok(CoreEvent::MessageRecalled(msg)) => {
                    if let Err(e) = apply_recall_fanout(&conn, &msg) {
                        eprintln!("⚠️ Recall fan-out failed for message {}: {e}", msg.id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("⚠️ Fan-out worker lagged, missed {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    eprintln!("Fan-out worker: channel closed, exiting");
                    break;
                }
            }
        }
    });
}

/// Spawns the periodic flush of pending unread deltas.
pub fn spawn_unread_flush_task(db_path: String, ledger: Arc<UnreadLedger>, interval_secs: u64) {
    tokio::spawn(async move {
        let conn = match Connection::open(&db_path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("⚠️ Unread flush task: failed to open DB: {e}");
                return;
            }
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .ok();
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(interval_secs.max(1))).await;
            if ledger.pending_len() > 0 {
                flush_unread(&conn, &ledger);
            }
        }
    });
}

/// One repair pass: realign every conversation's last-message snapshot with
/// the highest-seq surviving message of that conversation. Returns how many
/// rows were corrected.
pub fn run_repair(conn: &Connection, config: &CoreConfig) -> usize {
    let rows: Vec<(String, String, String, Option<String>)> = {
        let mut stmt = match conn
            .prepare("SELECT owner, peer, kind, last_message_id FROM conversations")
        {
            Ok(s) => s,
            Err(_) => return 0,
        };
        stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .map(|r| r.filter_map(|x| x.ok()).collect())
        .unwrap_or_default()
    };

    let mut repaired = 0;
    for (owner, peer, kind_str, last_id) in rows {
        let Some(kind) = ChatKind::parse(&kind_str) else {
            continue;
        };
        let latest = latest_visible_message(conn, &owner, &peer, kind);
        let Some(latest) = latest else { continue };
        if Some(latest.id.clone()) == last_id {
            continue;
        }
        let snippet = if latest.status == MessageStatus::Recalled {
            RECALLED_SNIPPET.to_string()
        } else {
            latest.content.snippet(config.snippet_max_chars)
        };
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn
            .execute(
                "UPDATE conversations SET last_message_id = ?1, last_message_snippet = ?2, \
                 last_message_at = ?3, last_message_seq = ?4, updated_at = ?5 \
                 WHERE owner = ?6 AND peer = ?7 AND kind = ?8",
                params![
                    &latest.id,
                    &snippet,
                    &latest.created_at,
                    latest.seq.unwrap_or(0),
                    &now,
                    &owner,
                    &peer,
                    &kind_str
                ],
            )
            .unwrap_or(0);
        if changed > 0 {
            repaired += 1;
        }
    }
    repaired
}

fn latest_visible_message(
    conn: &Connection,
    owner: &str,
    peer: &str,
    kind: ChatKind,
) -> Option<Message> {
    let base = format!(
        "SELECT {} FROM messages WHERE status IN ('sent', 'delivered', 'read', 'recalled')",
        crate::store::MESSAGE_COLUMNS
    );
    match kind {
        ChatKind::Group => conn
            .query_row(
                &format!("{base} AND group_id = ?1 ORDER BY seq DESC LIMIT 1"),
                params![peer],
                crate::store::row_to_message,
            )
            .ok(),
        ChatKind::Single | ChatKind::Agent => conn
            .query_row(
                &format!(
                    "{base} AND ((sender = ?1 AND recipient = ?2) OR \
                     (sender = ?2 AND recipient = ?1)) ORDER BY seq DESC LIMIT 1"
                ),
                params![owner, peer],
                crate::store::row_to_message,
            )
            .ok(),
    }
}

/// Spawns the periodic conversation repair sweep.
pub fn spawn_repair_task(db_path: String, config: CoreConfig, interval_secs: u64) {
    tokio::spawn(async move {
        let conn = match Connection::open(&db_path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("⚠️ Repair task: failed to open DB: {e}");
                return;
            }
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .ok();
        // Let the server come up before the first pass
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        loop {
            let repaired = run_repair(&conn, &config);
            if repaired > 0 {
                eprintln!("🧹 Repair sweep realigned {repaired} conversations");
            }
            tokio::time::sleep(std::time::Duration::from_secs(interval_secs.max(1))).await;
        }
    });
}
