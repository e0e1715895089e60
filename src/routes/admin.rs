// Minimal surface of the collaborating membership/relationship services:
// enough to drive the pipeline, with best-effort mirroring into the broker's
// channel and blocklist state.

use crate::broker::{CHANNEL_GROUP, CHANNEL_PERSON, personal_channel_id};
use crate::db::Db;
use crate::ingest::Pipeline;
use crate::models::*;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use rusqlite::params;
use std::sync::Arc;

type ApiError = (Status, Json<serde_json::Value>);

fn bad_request(msg: &str) -> ApiError {
    (
        Status::BadRequest,
        Json(serde_json::json!({"error": msg})),
    )
}

fn not_found(msg: &str) -> ApiError {
    (Status::NotFound, Json(serde_json::json!({"error": msg})))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    (
        Status::InternalServerError,
        Json(serde_json::json!({"error": e.to_string()})),
    )
}

// --- Groups ---

#[post("/api/v1/groups", format = "json", data = "<body>")]
pub async fn create_group(
    db: &State<Arc<Db>>,
    pipeline: &State<Arc<Pipeline>>,
    body: Json<CreateGroup>,
) -> Result<Json<Group>, ApiError> {
    let name = body.name.trim().to_string();
    if name.is_empty() || name.len() > 100 {
        return Err(bad_request("Group name must be 1-100 characters"));
    }
    let owner = body.owner_user_id.trim().to_string();
    if owner.is_empty() {
        return Err(bad_request("owner_user_id is required"));
    }

    let id = body
        .id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let now = chrono::Utc::now().to_rfc3339();

    let mut members: Vec<String> = vec![owner.clone()];
    for m in &body.member_ids {
        let m = m.trim();
        if !m.is_empty() && !members.iter().any(|x| x == m) {
            members.push(m.to_string());
        }
    }

    {
        let conn = db.conn();
        conn.execute(
            "INSERT INTO groups (id, name, owner, member_count, max_members, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![&id, &name, &owner, members.len() as i64, body.max_members, &now],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                (
                    Status::Conflict,
                    Json(serde_json::json!({"error": format!("Group '{id}' already exists")})),
                )
            } else {
                internal(e)
            }
        })?;
        for member in &members {
            let role = if member == &owner { "owner" } else { "member" };
            conn.execute(
                "INSERT OR REPLACE INTO group_members \
                 (group_id, user_id, role, status, joined_at) VALUES (?1, ?2, ?3, 'joined', ?4)",
                params![&id, member, role, &now],
            )
            .map_err(internal)?;
        }
    }

    // Mirror the channel into the broker; membership is the durable truth
    if let Err(e) = pipeline
        .broker
        .create_channel(&id, CHANNEL_GROUP, &members)
        .await
    {
        eprintln!("⚠️ Broker channel create for group {id} failed: {e}");
    }

    Ok(Json(Group {
        id,
        name,
        owner,
        member_count: members.len() as i64,
        max_members: body.max_members,
        notice: None,
        created_at: now.clone(),
        updated_at: now,
    }))
}

#[get("/api/v1/groups/<group_id>")]
pub fn get_group(db: &State<Arc<Db>>, group_id: &str) -> Result<Json<Group>, ApiError> {
    let conn = db.conn();
    conn.query_row(
        "SELECT id, name, owner, member_count, max_members, notice, created_at, updated_at \
         FROM groups WHERE id = ?1",
        params![group_id],
        |row| {
            Ok(Group {
                id: row.get(0)?,
                name: row.get(1)?,
                owner: row.get(2)?,
                member_count: row.get(3)?,
                max_members: row.get(4)?,
                notice: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        },
    )
    .map(Json)
    .map_err(|_| not_found("Group not found"))
}

#[get("/api/v1/groups/<group_id>/members")]
pub fn list_group_members(
    db: &State<Arc<Db>>,
    group_id: &str,
) -> Result<Json<Vec<GroupMember>>, ApiError> {
    let conn = db.conn();
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM groups WHERE id = ?1",
            params![group_id],
            |r| r.get::<_, i64>(0),
        )
        .map(|c| c > 0)
        .unwrap_or(false);
    if !exists {
        return Err(not_found("Group not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT group_id, user_id, role, status, joined_at, mute_until \
             FROM group_members WHERE group_id = ?1 ORDER BY joined_at, user_id",
        )
        .map_err(internal)?;
    let members: Vec<GroupMember> = stmt
        .query_map(params![group_id], |row| {
            Ok(GroupMember {
                group_id: row.get(0)?,
                user_id: row.get(1)?,
                role: row.get(2)?,
                status: row.get(3)?,
                joined_at: row.get(4)?,
                mute_until: row.get(5)?,
            })
        })
        .map_err(internal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(members))
}

#[get("/api/v1/friendships?<user_id>")]
pub fn list_friendships(
    db: &State<Arc<Db>>,
    user_id: &str,
) -> Json<Vec<Friendship>> {
    let conn = db.conn();
    let mut stmt = match conn.prepare(
        "SELECT user_id, target_id, status, created_at, updated_at \
         FROM friendships WHERE user_id = ?1 ORDER BY target_id",
    ) {
        Ok(s) => s,
        Err(_) => return Json(vec![]),
    };
    let edges: Vec<Friendship> = stmt
        .query_map(params![user_id], |row| {
            Ok(Friendship {
                user_id: row.get(0)?,
                target_id: row.get(1)?,
                status: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();
    Json(edges)
}

fn refresh_member_count(conn: &rusqlite::Connection, group_id: &str) {
    conn.execute(
        "UPDATE groups SET member_count = \
         (SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND status = 'joined'), \
         updated_at = ?2 WHERE id = ?1",
        params![group_id, chrono::Utc::now().to_rfc3339()],
    )
    .ok();
}

#[post("/api/v1/groups/<group_id>/members", format = "json", data = "<body>")]
pub async fn add_group_member(
    db: &State<Arc<Db>>,
    pipeline: &State<Arc<Pipeline>>,
    group_id: &str,
    body: Json<AddMember>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = body.user_id.trim().to_string();
    if user.is_empty() {
        return Err(bad_request("user_id is required"));
    }
    {
        let conn = db.conn();
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM groups WHERE id = ?1",
                params![group_id],
                |r| r.get::<_, i64>(0),
            )
            .map(|c| c > 0)
            .unwrap_or(false);
        if !exists {
            return Err(not_found("Group not found"));
        }
        let at_capacity: bool = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND status = 'joined') \
                 >= max_members FROM groups WHERE id = ?1",
                params![group_id],
                |r| r.get(0),
            )
            .unwrap_or(false);
        if at_capacity {
            return Err(bad_request("Group is full"));
        }
        conn.execute(
            "INSERT OR REPLACE INTO group_members \
             (group_id, user_id, role, status, joined_at) VALUES (?1, ?2, ?3, 'joined', ?4)",
            params![group_id, &user, &body.role, chrono::Utc::now().to_rfc3339()],
        )
        .map_err(internal)?;
        refresh_member_count(&conn, group_id);
    }

    if let Err(e) = pipeline
        .broker
        .add_subscribers(group_id, CHANNEL_GROUP, &[user.clone()])
        .await
    {
        eprintln!("⚠️ Broker subscriber add for group {group_id} failed: {e}");
    }

    Ok(Json(serde_json::json!({"joined": true})))
}

#[delete("/api/v1/groups/<group_id>/members/<user_id>?<kicked>")]
pub async fn remove_group_member(
    db: &State<Arc<Db>>,
    pipeline: &State<Arc<Pipeline>>,
    group_id: &str,
    user_id: &str,
    kicked: Option<bool>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let new_status = if kicked.unwrap_or(false) {
        "kicked"
    } else {
        "left"
    };
    {
        let conn = db.conn();
        let changed = conn
            .execute(
                "UPDATE group_members SET status = ?1 \
                 WHERE group_id = ?2 AND user_id = ?3 AND status = 'joined'",
                params![new_status, group_id, user_id],
            )
            .map_err(internal)?;
        if changed == 0 {
            return Err(not_found("Membership not found"));
        }
        refresh_member_count(&conn, group_id);
    }

    if let Err(e) = pipeline
        .broker
        .remove_subscribers(group_id, CHANNEL_GROUP, &[user_id.to_string()])
        .await
    {
        eprintln!("⚠️ Broker subscriber remove for group {group_id} failed: {e}");
    }

    Ok(Json(serde_json::json!({"removed": true, "status": new_status})))
}

#[post("/api/v1/groups/<group_id>/mute", format = "json", data = "<body>")]
pub fn mute_group_member(
    db: &State<Arc<Db>>,
    group_id: &str,
    body: Json<MuteMember>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let mute_until: Option<String> = if body.duration_secs > 0 {
        Some(
            (chrono::Utc::now() + chrono::Duration::seconds(body.duration_secs)).to_rfc3339(),
        )
    } else {
        None
    };
    let changed = conn
        .execute(
            "UPDATE group_members SET mute_until = ?1 WHERE group_id = ?2 AND user_id = ?3",
            params![&mute_until, group_id, &body.user_id],
        )
        .map_err(internal)?;
    if changed == 0 {
        return Err(not_found("Membership not found"));
    }
    Ok(Json(serde_json::json!({"muted_until": mute_until})))
}

// --- Friendships ---

#[post("/api/v1/friendships", format = "json", data = "<body>")]
pub fn add_friend(
    db: &State<Arc<Db>>,
    body: Json<BlockRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO friendships (user_id, target_id, status, created_at, updated_at) \
         VALUES (?1, ?2, 'accepted', ?3, ?3) \
         ON CONFLICT(user_id, target_id) DO UPDATE SET status = 'accepted', updated_at = ?3",
        params![&body.user_id, &body.target_id, &now],
    )
    .map_err(internal)?;
    Ok(Json(serde_json::json!({"status": "accepted"})))
}

#[post("/api/v1/friendships/block", format = "json", data = "<body>")]
pub async fn block_user(
    db: &State<Arc<Db>>,
    pipeline: &State<Arc<Pipeline>>,
    body: Json<BlockRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    {
        let conn = db.conn();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO friendships (user_id, target_id, status, created_at, updated_at) \
             VALUES (?1, ?2, 'blocked', ?3, ?3) \
             ON CONFLICT(user_id, target_id) DO UPDATE SET status = 'blocked', updated_at = ?3",
            params![&body.user_id, &body.target_id, &now],
        )
        .map_err(internal)?;
    }

    let channel = personal_channel_id(&body.user_id, &body.target_id);
    if let Err(e) = pipeline
        .broker
        .blocklist_add(&channel, CHANNEL_PERSON, &[body.target_id.clone()])
        .await
    {
        eprintln!("⚠️ Broker blocklist add on channel {channel} failed: {e}");
    }

    Ok(Json(serde_json::json!({"status": "blocked"})))
}

#[delete("/api/v1/friendships/block?<user_id>&<target_id>")]
pub async fn unblock_user(
    db: &State<Arc<Db>>,
    pipeline: &State<Arc<Pipeline>>,
    user_id: &str,
    target_id: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    {
        let conn = db.conn();
        let changed = conn
            .execute(
                "DELETE FROM friendships \
                 WHERE user_id = ?1 AND target_id = ?2 AND status = 'blocked'",
                params![user_id, target_id],
            )
            .map_err(internal)?;
        if changed == 0 {
            return Err(not_found("Block not found"));
        }
    }

    let channel = personal_channel_id(user_id, target_id);
    if let Err(e) = pipeline
        .broker
        .blocklist_remove(&channel, CHANNEL_PERSON, &[target_id.to_string()])
        .await
    {
        eprintln!("⚠️ Broker blocklist remove on channel {channel} failed: {e}");
    }

    Ok(Json(serde_json::json!({"status": "unblocked"})))
}

// --- Broker user passthrough ---

#[get("/api/v1/users/<uid>/token")]
pub async fn user_token(
    pipeline: &State<Arc<Pipeline>>,
    uid: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    match pipeline.broker.user_token(uid).await {
        Ok(token) => Ok(Json(serde_json::json!({
            "uid": token.uid,
            "token": token.token,
            "expires_at": token.expires_at,
            "ws_url": pipeline.config.broker_ws_url,
        }))),
        Err(e) => Err((
            Status::BadGateway,
            Json(serde_json::json!({"error": e.to_string()})),
        )),
    }
}
