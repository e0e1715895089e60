use crate::db::Db;
use crate::models::*;
use crate::store::{self, HistoryDirection};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rusqlite::params;
use serde::Deserialize;
use std::sync::Arc;

#[get("/api/v1/messages/<message_id>", rank = 2)]
pub fn get_message(
    db: &State<Arc<Db>>,
    message_id: &str,
) -> Result<Json<Message>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn();
    store::get_message(&conn, message_id)
        .map(Json)
        .ok_or_else(|| {
            (
                Status::NotFound,
                Json(serde_json::json!({"error": "Message not found"})),
            )
        })
}

#[get("/api/v1/messages?<user>&<limit>&<offset>")]
pub fn list_user_messages(
    db: &State<Arc<Db>>,
    user: &str,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Json<Vec<Message>> {
    let conn = db.conn();
    let limit = limit.unwrap_or(50).clamp(1, 500);
    let offset = offset.unwrap_or(0).max(0);
    Json(store::list_by_user(&conn, user, limit, offset))
}

#[get("/api/v1/groups/<group_id>/messages?<limit>&<offset>")]
pub fn list_group_messages(
    db: &State<Arc<Db>>,
    group_id: &str,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Json<Vec<Message>> {
    let conn = db.conn();
    let limit = limit.unwrap_or(50).clamp(1, 500);
    let offset = offset.unwrap_or(0).max(0);
    Json(store::list_by_group(&conn, group_id, limit, offset))
}

/// Outbox view: messages stuck in `failed`, oldest first.
#[get("/api/v1/messages/failed?<limit>", rank = 1)]
pub fn list_failed_messages(db: &State<Arc<Db>>, limit: Option<i64>) -> Json<Vec<Message>> {
    let conn = db.conn();
    Json(store::list_failed(&conn, limit.unwrap_or(50).clamp(1, 500)))
}

#[get("/api/v1/history?<user>&<peer>&<kind>&<limit>&<cursor>&<direction>")]
pub fn history(
    db: &State<Arc<Db>>,
    user: &str,
    peer: &str,
    kind: Option<&str>,
    limit: Option<i64>,
    cursor: Option<&str>,
    direction: Option<&str>,
) -> Result<Json<HistoryResponse>, (Status, Json<serde_json::Value>)> {
    let kind = match kind {
        None => ChatKind::Single,
        Some(k) => ChatKind::parse(k).ok_or_else(|| {
            (
                Status::BadRequest,
                Json(serde_json::json!({"error": "kind must be single, group or agent"})),
            )
        })?,
    };
    let direction = match direction {
        None => HistoryDirection::Before,
        Some(d) => HistoryDirection::parse(d).ok_or_else(|| {
            (
                Status::BadRequest,
                Json(serde_json::json!({"error": "direction must be before or after"})),
            )
        })?,
    };

    let conn = db.conn();
    if kind == ChatKind::Group && !crate::permission::is_joined_member(&conn, peer, user) {
        return Err((
            Status::Forbidden,
            Json(serde_json::json!({"error": "Not a member of this group"})),
        ));
    }

    let (messages, next_cursor) =
        store::history(&conn, user, peer, kind, limit.unwrap_or(50), cursor, direction);
    Ok(Json(HistoryResponse {
        messages,
        next_cursor,
    }))
}

#[get("/api/v1/search?<user>&<q>&<limit>")]
pub fn search_messages(
    db: &State<Arc<Db>>,
    user: &str,
    q: &str,
    limit: Option<i64>,
) -> Result<Json<SearchResponse>, (Status, Json<serde_json::Value>)> {
    let query = q.trim();
    if query.is_empty() {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"error": "Query parameter 'q' must not be empty"})),
        ));
    }
    if query.len() > 500 {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"error": "Query too long (max 500 characters)"})),
        ));
    }

    let conn = db.conn();
    let messages = store::search(&conn, user, query, limit.unwrap_or(50));
    let total = messages.len();
    Ok(Json(SearchResponse {
        messages,
        total,
        query: query.to_string(),
    }))
}

#[get("/api/v1/stats?<user>&<from>&<to>")]
pub fn user_stats(
    db: &State<Arc<Db>>,
    user: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Json<UserStats> {
    let conn = db.conn();
    Json(store::user_stats(&conn, user, from, to))
}

#[derive(Debug, Deserialize)]
pub struct ConversationSettings {
    pub owner: String,
    pub peer: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
    #[serde(default)]
    pub is_muted: Option<bool>,
    #[serde(default)]
    pub draft: Option<String>,
}

/// Per-owner conversation preferences. Creates the row if the first message
/// has not arrived yet; only the provided fields change.
#[post("/api/v1/conversations/settings", format = "json", data = "<body>")]
pub fn update_conversation_settings(
    db: &State<Arc<Db>>,
    body: Json<ConversationSettings>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let kind = match body.kind.as_deref() {
        None => ChatKind::Single,
        Some(k) => ChatKind::parse(k).ok_or_else(|| {
            (
                Status::BadRequest,
                Json(serde_json::json!({"error": "kind must be single, group or agent"})),
            )
        })?,
    };

    let conn = db.conn();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO conversations (id, owner, peer, kind, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
         ON CONFLICT(owner, peer, kind) DO NOTHING",
        params![
            uuid::Uuid::new_v4().to_string(),
            &body.owner,
            &body.peer,
            kind.as_str(),
            &now
        ],
    )
    .ok();

    if let Some(pinned) = body.is_pinned {
        conn.execute(
            "UPDATE conversations SET is_pinned = ?1, updated_at = ?2 \
             WHERE owner = ?3 AND peer = ?4 AND kind = ?5",
            params![pinned as i64, &now, &body.owner, &body.peer, kind.as_str()],
        )
        .ok();
    }
    if let Some(muted) = body.is_muted {
        conn.execute(
            "UPDATE conversations SET is_muted = ?1, updated_at = ?2 \
             WHERE owner = ?3 AND peer = ?4 AND kind = ?5",
            params![muted as i64, &now, &body.owner, &body.peer, kind.as_str()],
        )
        .ok();
    }
    if let Some(ref draft) = body.draft {
        let stored: Option<&str> = if draft.is_empty() { None } else { Some(draft) };
        conn.execute(
            "UPDATE conversations SET draft = ?1, updated_at = ?2 \
             WHERE owner = ?3 AND peer = ?4 AND kind = ?5",
            params![stored, &now, &body.owner, &body.peer, kind.as_str()],
        )
        .ok();
    }

    Ok(Json(serde_json::json!({"updated": true})))
}

#[get("/api/v1/conversations?<owner>")]
pub fn list_conversations(db: &State<Arc<Db>>, owner: &str) -> Json<Vec<Conversation>> {
    let conn = db.conn();
    let mut stmt = match conn.prepare(
        "SELECT id, owner, peer, kind, last_message_id, last_message_snippet, last_message_at, \
         last_message_seq, unread_count, is_pinned, is_muted, draft, created_at, updated_at \
         FROM conversations WHERE owner = ?1 \
         ORDER BY is_pinned DESC, last_message_at IS NULL, last_message_at DESC",
    ) {
        Ok(s) => s,
        Err(_) => return Json(vec![]),
    };
    let conversations: Vec<Conversation> = stmt
        .query_map(params![owner], |row| {
            let kind_str: String = row.get(3)?;
            Ok(Conversation {
                id: row.get(0)?,
                owner: row.get(1)?,
                peer: row.get(2)?,
                kind: ChatKind::parse(&kind_str).unwrap_or(ChatKind::Single),
                last_message_id: row.get(4)?,
                last_message_snippet: row.get(5)?,
                last_message_at: row.get(6)?,
                last_message_seq: row.get(7)?,
                unread_count: row.get(8)?,
                is_pinned: row.get::<_, i64>(9)? != 0,
                is_muted: row.get::<_, i64>(10)? != 0,
                draft: row.get(11)?,
                created_at: row.get(12)?,
                updated_at: row.get(13)?,
            })
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();
    Json(conversations)
}
