use crate::common::*;
use hmac::{Hmac, Mac};
use rocket::http::{Header, Status};
use sha2::Sha256;

fn post_event(client: &rocket::local::blocking::Client, body: &str) -> (Status, serde_json::Value) {
    let res = client.post("/api/v1/webhook/broker").body(body).dispatch();
    let status = res.status();
    let json = res.into_json().unwrap_or(serde_json::json!({}));
    (status, json)
}

fn sign(secret: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// --- Delivery and read reconciliation ---

#[test]
fn test_message_ack_promotes_sent_to_delivered() {
    let tc = test_client();
    let result = send_text(&tc, "u1", "u2", "hello", None);
    let id = result["message"]["id"].as_str().unwrap().to_string();

    let body = serde_json::json!({"event": "message_ack", "message_id": id}).to_string();
    let (status, json) = post_event(&tc, &body);
    assert_eq!(status, Status::Ok);
    assert_eq!(json["applied"], 1);
    assert_eq!(get_message(&tc, &id)["status"], "delivered");

    // Replay: the lattice already moved, nothing changes
    let (_, json) = post_event(&tc, &body);
    assert_eq!(json["applied"], 0);
    assert_eq!(get_message(&tc, &id)["status"], "delivered");
}

#[test]
fn test_message_read_updates_status_and_unread() {
    let tc = test_client();
    let result = send_text(&tc, "u1", "u2", "hello", None);
    let id = result["message"]["id"].as_str().unwrap().to_string();
    wait_for_conversation(&tc, "u2", "u1", |c| c["unread_count"] == 1);

    let body = serde_json::json!({
        "event": "message_read",
        "uid": "u2",
        "message_ids": [id],
    })
    .to_string();
    let (status, json) = post_event(&tc, &body);
    assert_eq!(status, Status::Ok);
    assert_eq!(json["applied"], 1);

    assert_eq!(get_message(&tc, &id)["status"], "read");
    let conv = find_conversation(&tc, "u2", "u1").unwrap();
    assert_eq!(conv["unread_count"], 0);
}

#[test]
fn test_message_read_replay_is_idempotent() {
    let tc = test_client();
    let result = send_text(&tc, "u1", "u2", "hello", None);
    let id = result["message"]["id"].as_str().unwrap().to_string();
    wait_for_conversation(&tc, "u2", "u1", |c| c["unread_count"] == 1);

    let body = serde_json::json!({
        "event": "message_read",
        "uid": "u2",
        "message_ids": [id],
    })
    .to_string();
    post_event(&tc, &body);
    post_event(&tc, &body);
    post_event(&tc, &body);

    // Unread never goes negative, status stays read
    assert_eq!(get_message(&tc, &id)["status"], "read");
    let conv = find_conversation(&tc, "u2", "u1").unwrap();
    assert_eq!(conv["unread_count"], 0);
}

#[test]
fn test_read_only_counts_messages_addressed_to_reader() {
    let tc = test_client();
    let mine = send_text(&tc, "u1", "u2", "for u2", None);
    let theirs = send_text(&tc, "u3", "u4", "for u4", None);
    let mine_id = mine["message"]["id"].as_str().unwrap().to_string();
    let theirs_id = theirs["message"]["id"].as_str().unwrap().to_string();
    wait_for_conversation(&tc, "u2", "u1", |c| c["unread_count"] == 1);

    // u2 claims to have read both; only the one addressed to u2 moves
    let body = serde_json::json!({
        "event": "message_read",
        "uid": "u2",
        "message_ids": [mine_id, theirs_id],
    })
    .to_string();
    let (_, json) = post_event(&tc, &body);
    assert_eq!(json["applied"], 1);
    assert_eq!(get_message(&tc, &mine_id)["status"], "read");
    assert_eq!(get_message(&tc, &theirs_id)["status"], "sent");
}

#[test]
fn test_group_read_decrements_group_conversation() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2", "u3"]);
    let result = send_group_text(&tc, "u1", "g1", "all hands", None);
    let id = result["message"]["id"].as_str().unwrap().to_string();
    wait_for_conversation(&tc, "u2", "g1", |c| c["unread_count"] == 1);
    wait_for_conversation(&tc, "u3", "g1", |c| c["unread_count"] == 1);

    let body = serde_json::json!({
        "event": "message_read",
        "uid": "u2",
        "message_ids": [id],
    })
    .to_string();
    post_event(&tc, &body);

    assert_eq!(find_conversation(&tc, "u2", "g1").unwrap()["unread_count"], 0);
    // Other members' counters are untouched
    assert_eq!(find_conversation(&tc, "u3", "g1").unwrap()["unread_count"], 1);
}

#[test]
fn test_connect_events_track_presence() {
    let tc = test_client();
    post_event(
        &tc,
        &serde_json::json!({"event": "connect", "uid": "u1"}).to_string(),
    );
    post_event(
        &tc,
        &serde_json::json!({"event": "user.online", "uid": "u2"}).to_string(),
    );

    let stats: serde_json::Value = tc
        .get("/api/v1/system/stats")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(stats["online_users"], 2);

    post_event(
        &tc,
        &serde_json::json!({"event": "disconnect", "uid": "u1"}).to_string(),
    );
    let stats: serde_json::Value = tc
        .get("/api/v1/system/stats")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(stats["online_users"], 1);
}

#[test]
fn test_unknown_event_rejected() {
    let tc = test_client();
    let (status, _) = post_event(
        &tc,
        &serde_json::json!({"event": "channel_exploded", "uid": "u1"}).to_string(),
    );
    assert_eq!(status, Status::BadRequest);
}

// --- Signature enforcement ---

#[test]
fn test_signed_webhook_accepted_and_unsigned_rejected() {
    let mut config = chat_core::config::CoreConfig::default();
    config.webhook_secret = Some("s3cret".to_string());
    let tc = test_client_with_config(config);

    let body = serde_json::json!({"event": "connect", "uid": "u1"}).to_string();

    // Missing header
    let res = tc.post("/api/v1/webhook/broker").body(&body).dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    // Wrong signature
    let res = tc
        .post("/api/v1/webhook/broker")
        .header(Header::new("X-Broker-Signature", sign("wrong", &body)))
        .body(&body)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    // Correct signature
    let res = tc
        .post("/api/v1/webhook/broker")
        .header(Header::new("X-Broker-Signature", sign("s3cret", &body)))
        .body(&body)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn test_no_secret_configured_accepts_unsigned() {
    let tc = test_client();
    let (status, _) = post_event(
        &tc,
        &serde_json::json!({"event": "connect", "uid": "u1"}).to_string(),
    );
    assert_eq!(status, Status::Ok);
}

#[test]
fn test_webhook_disabled_returns_not_found() {
    let mut config = chat_core::config::CoreConfig::default();
    config.webhook_enabled = false;
    let tc = test_client_with_config(config);

    let res = tc
        .post("/api/v1/webhook/broker")
        .body(serde_json::json!({"event": "connect", "uid": "u1"}).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}
