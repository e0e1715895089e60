use crate::common::*;
use rocket::http::{ContentType, Status};

// --- Blocks (asymmetric) ---

#[test]
fn test_blocked_sender_rejected_without_side_effects() {
    let tc = test_client();
    block(&tc, "u2", "u1"); // u2 blocks u1

    let result = send_text(&tc, "u1", "u2", "let me in", Some(1));
    assert_eq!(result["success"], false);
    assert_eq!(result["error_kind"], "permission");
    assert!(result["error"].as_str().unwrap().to_lowercase().contains("block"));

    // A denied send must not touch the store or the broker
    assert_eq!(tc.broker.send_count(), 0);
    let msgs: Vec<serde_json::Value> = tc
        .get("/api/v1/messages?user=u1")
        .dispatch()
        .into_json()
        .unwrap();
    assert!(msgs.is_empty());
    assert!(conversations_of(&tc, "u2").is_empty());

    // And it must not burn a sequence ordinal either: the first allowed
    // message still gets seq 1
    block(&tc, "u1", "u9");
    let ok = send_text(&tc, "u1", "u3", "fresh", None);
    assert_eq!(ok["message"]["seq"], 1);
}

#[test]
fn test_block_works_in_both_directions() {
    let tc = test_client();
    block(&tc, "u1", "u2"); // u1 blocks u2

    // The blocker cannot message the blocked user either
    let from_blocker = send_text(&tc, "u1", "u2", "hi", None);
    assert_eq!(from_blocker["success"], false);

    let from_blocked = send_text(&tc, "u2", "u1", "hi", None);
    assert_eq!(from_blocked["success"], false);
}

#[test]
fn test_unblock_restores_sending() {
    let tc = test_client();
    block(&tc, "u2", "u1");
    assert_eq!(send_text(&tc, "u1", "u2", "nope", None)["success"], false);

    let res = tc
        .delete("/api/v1/friendships/block?user_id=u2&target_id=u1")
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    assert_eq!(send_text(&tc, "u1", "u2", "now", None)["success"], true);
}

#[test]
fn test_block_mirrors_to_broker_blocklist() {
    let tc = test_client();
    block(&tc, "u2", "u1");
    let calls = tc.broker.blocklist_adds.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "u1_u2");
    assert_eq!(calls[0].1, vec!["u1".to_string()]);
}

// --- Group membership & mute ---

#[test]
fn test_non_member_cannot_send_to_group() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2"]);

    let result = send_group_text(&tc, "u9", "g1", "knock knock", None);
    assert_eq!(result["success"], false);
    assert_eq!(result["error_kind"], "permission");
    assert!(result["error"].as_str().unwrap().contains("member"));
    assert_eq!(tc.broker.send_count(), 0);
}

#[test]
fn test_left_member_cannot_send() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2", "u3"]);

    let res = tc.delete("/api/v1/groups/g1/members/u2").dispatch();
    assert_eq!(res.status(), Status::Ok);

    let result = send_group_text(&tc, "u2", "g1", "still here?", None);
    assert_eq!(result["success"], false);
    assert_eq!(result["error_kind"], "permission");
}

#[test]
fn test_muted_member_cannot_send_until_mute_expires() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2"]);

    let res = tc
        .post("/api/v1/groups/g1/mute")
        .header(ContentType::JSON)
        .body(serde_json::json!({"user_id": "u2", "duration_secs": 1}).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let muted = send_group_text(&tc, "u2", "g1", "mmph", None);
    assert_eq!(muted["success"], false);
    assert!(muted["error"].as_str().unwrap().contains("muted"));

    std::thread::sleep(std::time::Duration::from_millis(1200));
    let after = send_group_text(&tc, "u2", "g1", "free again", None);
    assert_eq!(after["success"], true);
}

#[test]
fn test_clearing_mute_restores_sending() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2"]);

    tc.post("/api/v1/groups/g1/mute")
        .header(ContentType::JSON)
        .body(serde_json::json!({"user_id": "u2", "duration_secs": 3600}).to_string())
        .dispatch();
    assert_eq!(send_group_text(&tc, "u2", "g1", "x", None)["success"], false);

    tc.post("/api/v1/groups/g1/mute")
        .header(ContentType::JSON)
        .body(serde_json::json!({"user_id": "u2", "duration_secs": 0}).to_string())
        .dispatch();
    assert_eq!(send_group_text(&tc, "u2", "g1", "x", None)["success"], true);
}

// --- System messages bypass policy ---

#[test]
fn test_system_messages_bypass_blocks() {
    let tc = test_client();
    block(&tc, "u2", "u1");

    let res = tc
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "type": "system",
                "content": {"text": "account notice"},
                "from_user_id": "u1",
                "to_user_id": "u2",
            })
            .to_string(),
        )
        .dispatch();
    let result: serde_json::Value = res.into_json().unwrap();
    assert_eq!(result["success"], true);
}

// --- Optional friendship requirement ---

#[test]
fn test_require_friendship_flag() {
    let mut config = chat_core::config::CoreConfig::default();
    config.require_friendship = true;
    let tc = test_client_with_config(config);

    let denied = send_text(&tc, "u1", "u2", "stranger", None);
    assert_eq!(denied["success"], false);
    assert_eq!(denied["error_kind"], "permission");

    // Mutual accept required: one direction is not enough
    tc.post("/api/v1/friendships")
        .header(ContentType::JSON)
        .body(serde_json::json!({"user_id": "u1", "target_id": "u2"}).to_string())
        .dispatch();
    assert_eq!(send_text(&tc, "u1", "u2", "half", None)["success"], false);

    tc.post("/api/v1/friendships")
        .header(ContentType::JSON)
        .body(serde_json::json!({"user_id": "u2", "target_id": "u1"}).to_string())
        .dispatch();
    assert_eq!(send_text(&tc, "u1", "u2", "friends", None)["success"], true);
}

// --- batch_check_blocked ---

#[test]
fn test_batch_check_blocked() {
    let tc = test_client();
    block(&tc, "u1", "u2");
    block(&tc, "u1", "u3");

    let conn = rusqlite::Connection::open(&tc.db_path).unwrap();
    let result = chat_core::permission::batch_check_blocked(
        &conn,
        "u1",
        &["u2".to_string(), "u3".to_string(), "u4".to_string()],
    );
    assert_eq!(result["u2"], true);
    assert_eq!(result["u3"], true);
    assert_eq!(result["u4"], false);
}
