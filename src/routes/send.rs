use crate::db::Db;
use crate::ingest::Pipeline;
use crate::models::*;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, post};
use std::sync::Arc;

#[post("/api/v1/messages", format = "json", data = "<body>")]
pub async fn send_message(
    pipeline: &State<Arc<Pipeline>>,
    body: Json<SendRequest>,
) -> Json<SendResult> {
    Json(pipeline.send(body.into_inner()).await)
}

#[post("/api/v1/messages/batch", format = "json", data = "<body>")]
pub async fn batch_send(
    pipeline: &State<Arc<Pipeline>>,
    body: Json<Vec<SendRequest>>,
) -> Json<Vec<SendResult>> {
    Json(
        Arc::clone(pipeline.inner())
            .send_batch(body.into_inner())
            .await,
    )
}

#[post("/api/v1/messages/<message_id>/recall", format = "json", data = "<body>")]
pub async fn recall_message(
    pipeline: &State<Arc<Pipeline>>,
    message_id: &str,
    body: Json<RecallRequest>,
) -> Json<SendResult> {
    match pipeline.recall(message_id, &body.operator_id).await {
        Ok(msg) => Json(SendResult::ok(msg)),
        Err(e) => Json(SendResult::failure(&e)),
    }
}

#[post("/api/v1/messages/<message_id>/forward", format = "json", data = "<body>")]
pub async fn forward_message(
    pipeline: &State<Arc<Pipeline>>,
    message_id: &str,
    body: Json<ForwardRequest>,
) -> Result<Json<Vec<SendResult>>, (Status, Json<serde_json::Value>)> {
    let req = body.into_inner();
    pipeline
        .forward(
            message_id,
            &req.from_user_id,
            &req.to_user_ids,
            &req.to_group_ids,
        )
        .await
        .map(Json)
        .map_err(|e| {
            let status = match e {
                crate::error::SendError::Validation(ref m) if m == "message not found" => {
                    Status::NotFound
                }
                _ => Status::BadRequest,
            };
            (status, Json(serde_json::json!({"error": e.to_string()})))
        })
}

#[post("/api/v1/messages/<message_id>/retry")]
pub async fn retry_message(
    pipeline: &State<Arc<Pipeline>>,
    message_id: &str,
) -> Json<SendResult> {
    match pipeline.retry_failed(message_id).await {
        Ok(result) => Json(result),
        Err(e) => Json(SendResult::failure(&e)),
    }
}

#[post("/api/v1/messages/read", format = "json", data = "<body>")]
pub fn mark_read(db: &State<Arc<Db>>, body: Json<MarkReadRequest>) -> Json<serde_json::Value> {
    let conn = db.conn();
    let updated =
        crate::webhook::apply_read(&conn, &body.user_id, &body.message_ids).unwrap_or(0);
    Json(serde_json::json!({"updated": updated}))
}
