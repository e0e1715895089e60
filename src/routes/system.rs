use crate::db::Db;
use crate::ingest::Pipeline;
use crate::webhook::OnlineTracker;
use rocket::serde::json::Json;
use rocket::{State, get};
use std::sync::Arc;

#[get("/api/v1/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-core",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[get("/api/v1/system/stats")]
pub fn system_stats(
    db: &State<Arc<Db>>,
    pipeline: &State<Arc<Pipeline>>,
    online: &State<OnlineTracker>,
) -> Json<serde_json::Value> {
    let conn = db.conn();
    let by_status = crate::store::counts_by_status(&conn);
    let conversations: i64 = conn
        .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
        .unwrap_or(0);
    let groups: i64 = conn
        .query_row("SELECT COUNT(*) FROM groups", [], |r| r.get(0))
        .unwrap_or(0);
    Json(serde_json::json!({
        "messages_by_status": by_status,
        "conversations": conversations,
        "groups": groups,
        "online_users": online.online_count(),
        "dedupe": pipeline.dedupe.stats(),
    }))
}

// --- Catchers ---

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}

#[rocket::catch(422)]
pub fn unprocessable() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Malformed request body"}))
}
