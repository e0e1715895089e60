use crate::config::CoreConfig;
use crate::db::Db;
use crate::webhook::{self, BrokerEvent, OnlineTracker};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, post};
use std::sync::Arc;

use super::SignatureHeader;

/// Inbound broker events. Signature is verified over the raw body before any
/// parsing; handler failures are logged but still acked, so the broker does
/// not retry-storm us (replays are safe — every handler is idempotent).
#[post("/api/v1/webhook/broker", data = "<body>")]
pub fn broker_webhook(
    db: &State<Arc<Db>>,
    online: &State<OnlineTracker>,
    config: &State<CoreConfig>,
    signature: SignatureHeader,
    body: &str,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    if !config.webhook_enabled {
        return Err((
            Status::NotFound,
            Json(serde_json::json!({"error": "Not found"})),
        ));
    }

    if let Some(ref secret) = config.webhook_secret
        && !webhook::verify_signature(secret, body.as_bytes(), signature.0.as_deref())
    {
        return Err((
            Status::Unauthorized,
            Json(serde_json::json!({"error": "unauthorized"})),
        ));
    }

    let event: BrokerEvent = serde_json::from_str(body).map_err(|e| {
        (
            Status::BadRequest,
            Json(serde_json::json!({"error": format!("unrecognized event: {e}")})),
        )
    })?;

    let conn = db.conn();
    match webhook::apply_event(&conn, online, &event) {
        Ok(applied) => Ok(Json(serde_json::json!({"ok": true, "applied": applied}))),
        Err(e) => {
            eprintln!("⚠️ Webhook handler failed: {e}");
            Ok(Json(serde_json::json!({"ok": true, "applied": 0})))
        }
    }
}
