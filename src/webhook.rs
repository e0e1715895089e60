// Webhook reconciler: applies broker-emitted delivery/read/presence events
// to the message store and conversation rows. Handlers tolerate replay —
// status writes are idempotent by lattice monotonicity and unread decrements
// only count messages that newly transitioned.

use crate::models::{ChatKind, MessageStatus};
use hmac::{Hmac, Mac};
use rusqlite::{Connection, params};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Broker-Signature";

/// Verify the HMAC-SHA256 signature over the raw body. The header carries
/// `sha256=<hex>`; a bare hex digest is accepted too.
pub fn verify_signature(secret: &str, raw_body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else {
        return false;
    };
    let hex_sig = header.strip_prefix("sha256=").unwrap_or(header);
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

// --- Inbound event shapes ---

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event")]
pub enum BrokerEvent {
    #[serde(rename = "message_ack")]
    MessageAck { message_id: String },
    #[serde(rename = "message_read")]
    MessageRead {
        uid: String,
        message_ids: Vec<String>,
    },
    #[serde(rename = "connect")]
    Connect { uid: String },
    #[serde(rename = "disconnect")]
    Disconnect { uid: String },
    #[serde(rename = "user.online")]
    UserOnline { uid: String },
    #[serde(rename = "user.offline")]
    UserOffline { uid: String },
}

// --- Presence bookkeeping ---

#[derive(Default)]
pub struct OnlineTracker {
    inner: Mutex<HashMap<String, String>>,
}

impl OnlineTracker {
    pub fn connect(&self, uid: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(uid.to_string())
            .or_insert_with(|| chrono::Utc::now().to_rfc3339());
    }

    pub fn disconnect(&self, uid: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(uid);
    }

    pub fn is_online(&self, uid: &str) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.contains_key(uid)
    }

    pub fn online_count(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.len()
    }
}

// --- Event application ---

pub fn apply_event(
    conn: &Connection,
    online: &OnlineTracker,
    event: &BrokerEvent,
) -> rusqlite::Result<usize> {
    match event {
        BrokerEvent::MessageAck { message_id } => {
            let moved = crate::store::cas_status(conn, message_id, MessageStatus::Delivered)?;
            Ok(usize::from(moved))
        }
        BrokerEvent::MessageRead { uid, message_ids } => apply_read(conn, uid, message_ids),
        BrokerEvent::Connect { uid } | BrokerEvent::UserOnline { uid } => {
            online.connect(uid);
            Ok(0)
        }
        BrokerEvent::Disconnect { uid } | BrokerEvent::UserOffline { uid } => {
            online.disconnect(uid);
            Ok(0)
        }
    }
}

/// Mark messages read by `user`. Only messages actually addressed to the
/// user and not already read count; the owning conversation's unread counter
/// drops by exactly the number of new transitions, clamped at zero.
pub fn apply_read(conn: &Connection, user: &str, message_ids: &[String]) -> rusqlite::Result<usize> {
    // (peer, kind) -> newly read count
    let mut per_conversation: HashMap<(String, ChatKind), i64> = HashMap::new();
    let mut total = 0usize;

    for id in message_ids {
        let row: Option<(String, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT sender, recipient, group_id FROM messages WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .ok();
        let Some((sender, recipient, group_id)) = row else {
            continue;
        };
        if sender == user {
            continue;
        }

        let (peer, kind) = match group_id {
            Some(gid) => {
                if !crate::permission::is_joined_member(conn, &gid, user) {
                    continue;
                }
                (gid, ChatKind::Group)
            }
            None => {
                if recipient.as_deref() != Some(user) {
                    continue;
                }
                (sender, ChatKind::Single)
            }
        };

        let moved = crate::store::cas_status(conn, id, MessageStatus::Read)?;
        if moved {
            total += 1;
            *per_conversation.entry((peer, kind)).or_insert(0) += 1;
        }
    }

    for ((peer, kind), count) in per_conversation {
        conn.execute(
            "UPDATE conversations SET unread_count = MAX(unread_count - ?1, 0) \
             WHERE owner = ?2 AND peer = ?3 AND kind = ?4",
            params![count, user, peer, kind.as_str()],
        )?;
    }

    Ok(total)
}
