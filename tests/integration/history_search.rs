use crate::common::*;
use rocket::http::{ContentType, Status};

fn seed_conversation(tc: &TestClient, n: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for i in 0..n {
        let result = send_text(tc, "u1", "u2", &format!("message {i}"), None);
        assert_eq!(result["success"], true);
        ids.push(result["message"]["id"].as_str().unwrap().to_string());
    }
    ids
}

// --- History pagination ---

#[test]
fn test_history_default_returns_latest_first() {
    let tc = test_client();
    seed_conversation(&tc, 5);

    let resp: serde_json::Value = tc
        .get("/api/v1/history?user=u1&peer=u2")
        .dispatch()
        .into_json()
        .unwrap();
    let messages = resp["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0]["content"]["text"], "message 4");
    assert_eq!(messages[4]["content"]["text"], "message 0");
    assert!(resp["next_cursor"].is_null());
}

#[test]
fn test_history_pages_backwards_with_cursor() {
    let tc = test_client();
    seed_conversation(&tc, 7);

    let page1: serde_json::Value = tc
        .get("/api/v1/history?user=u1&peer=u2&limit=3")
        .dispatch()
        .into_json()
        .unwrap();
    let msgs1 = page1["messages"].as_array().unwrap();
    assert_eq!(msgs1.len(), 3);
    assert_eq!(msgs1[0]["content"]["text"], "message 6");
    let cursor = page1["next_cursor"].as_str().unwrap();

    let page2: serde_json::Value = tc
        .get(format!(
            "/api/v1/history?user=u1&peer=u2&limit=3&cursor={}",
            urlencode(cursor)
        ))
        .dispatch()
        .into_json()
        .unwrap();
    let msgs2 = page2["messages"].as_array().unwrap();
    assert_eq!(msgs2.len(), 3);
    assert_eq!(msgs2[0]["content"]["text"], "message 3");
    let cursor2 = page2["next_cursor"].as_str().unwrap();

    let page3: serde_json::Value = tc
        .get(format!(
            "/api/v1/history?user=u1&peer=u2&limit=3&cursor={}",
            urlencode(cursor2)
        ))
        .dispatch()
        .into_json()
        .unwrap();
    let msgs3 = page3["messages"].as_array().unwrap();
    assert_eq!(msgs3.len(), 1);
    assert_eq!(msgs3[0]["content"]["text"], "message 0");
    assert!(page3["next_cursor"].is_null());
}

#[test]
fn test_history_after_direction() {
    let tc = test_client();
    seed_conversation(&tc, 4);

    // Anchor on the oldest message, then walk forward
    let oldest: serde_json::Value = tc
        .get("/api/v1/history?user=u1&peer=u2&limit=4")
        .dispatch()
        .into_json()
        .unwrap();
    let anchor = &oldest["messages"].as_array().unwrap()[3];
    let cursor = chat_core::store::encode_cursor(
        anchor["created_at"].as_str().unwrap(),
        anchor["id"].as_str().unwrap(),
    );

    let resp: serde_json::Value = tc
        .get(format!(
            "/api/v1/history?user=u1&peer=u2&direction=after&cursor={}",
            urlencode(&cursor)
        ))
        .dispatch()
        .into_json()
        .unwrap();
    let messages = resp["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"]["text"], "message 1");
    assert_eq!(messages[2]["content"]["text"], "message 3");
}

#[test]
fn test_history_sees_both_directions() {
    let tc = test_client();
    send_text(&tc, "u1", "u2", "ping", None);
    send_text(&tc, "u2", "u1", "pong", None);

    let resp: serde_json::Value = tc
        .get("/api/v1/history?user=u1&peer=u2")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(resp["messages"].as_array().unwrap().len(), 2);
}

#[test]
fn test_group_history_requires_membership() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2"]);
    send_group_text(&tc, "u1", "g1", "internal", None);

    let res = tc
        .get("/api/v1/history?user=u9&peer=g1&kind=group")
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let resp: serde_json::Value = tc
        .get("/api/v1/history?user=u2&peer=g1&kind=group")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(resp["messages"].as_array().unwrap().len(), 1);
}

#[test]
fn test_history_rejects_bad_params() {
    let tc = test_client();
    let res = tc
        .get("/api/v1/history?user=u1&peer=u2&kind=carrier-pigeon")
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = tc
        .get("/api/v1/history?user=u1&peer=u2&direction=sideways")
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

// --- Search ---

#[test]
fn test_search_scoped_to_participation() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2"]);
    send_text(&tc, "u1", "u2", "the zebra crossed the road", None);
    send_group_text(&tc, "u1", "g1", "zebra sighting in the group", None);
    send_text(&tc, "u3", "u4", "another zebra elsewhere", None);

    // u2 participates in the single chat and the group: two hits
    let resp: serde_json::Value = tc
        .get("/api/v1/search?user=u2&q=zebra")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(resp["total"], 2);

    // u9 participates in nothing
    let resp: serde_json::Value = tc
        .get("/api/v1/search?user=u9&q=zebra")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(resp["total"], 0);

    // u4 only sees the chat addressed to them
    let resp: serde_json::Value = tc
        .get("/api/v1/search?user=u4&q=zebra")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(resp["total"], 1);
    assert_eq!(
        resp["messages"][0]["content"]["text"],
        "another zebra elsewhere"
    );
}

#[test]
fn test_search_excludes_left_groups() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2"]);
    send_group_text(&tc, "u1", "g1", "quarterly falcon report", None);

    tc.delete("/api/v1/groups/g1/members/u2").dispatch();

    let resp: serde_json::Value = tc
        .get("/api/v1/search?user=u2&q=falcon")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(resp["total"], 0);
}

#[test]
fn test_search_rejects_empty_query() {
    let tc = test_client();
    let res = tc.get("/api/v1/search?user=u1&q=%20").dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_recalled_messages_hidden_from_search() {
    let tc = test_client();
    let result = send_text(&tc, "u1", "u2", "classified falcon notes", None);
    let id = result["message"]["id"].as_str().unwrap().to_string();

    let before: serde_json::Value = tc
        .get("/api/v1/search?user=u2&q=falcon")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(before["total"], 1);

    tc.post(format!("/api/v1/messages/{id}/recall"))
        .header(ContentType::JSON)
        .body(serde_json::json!({"operator_id": "u1"}).to_string())
        .dispatch();

    let after: serde_json::Value = tc
        .get("/api/v1/search?user=u2&q=falcon")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(after["total"], 0);
}

// --- Mark read via the ingest API ---

#[test]
fn test_mark_read_decrements_exactly_new_transitions() {
    let tc = test_client();
    let a = send_text(&tc, "u1", "u2", "one", None);
    let b = send_text(&tc, "u1", "u2", "two", None);
    let a_id = a["message"]["id"].as_str().unwrap().to_string();
    let b_id = b["message"]["id"].as_str().unwrap().to_string();
    wait_for_conversation(&tc, "u2", "u1", |c| c["unread_count"] == 2);

    // First read of both, plus one id already read and one bogus id
    let resp: serde_json::Value = tc
        .post("/api/v1/messages/read")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({"user_id": "u2", "message_ids": [a_id, b_id]}).to_string(),
        )
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(resp["updated"], 2);
    assert_eq!(find_conversation(&tc, "u2", "u1").unwrap()["unread_count"], 0);

    let resp: serde_json::Value = tc
        .post("/api/v1/messages/read")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({"user_id": "u2", "message_ids": [a_id, "ghost"]}).to_string(),
        )
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(resp["updated"], 0);
    assert_eq!(find_conversation(&tc, "u2", "u1").unwrap()["unread_count"], 0);
}

// --- Conversation settings ---

#[test]
fn test_conversation_settings_roundtrip_and_pin_ordering() {
    let tc = test_client();
    send_text(&tc, "u2", "u1", "older chat", None);
    send_text(&tc, "u3", "u1", "newer chat", None);
    wait_for_conversation(&tc, "u1", "u2", |c| c["unread_count"] == 1);
    wait_for_conversation(&tc, "u1", "u3", |c| c["unread_count"] == 1);

    // Newest-first by default
    let convs = conversations_of(&tc, "u1");
    assert_eq!(convs[0]["peer"], "u3");

    // Pinning the older chat hoists it; mute and draft round-trip
    let res = tc
        .post("/api/v1/conversations/settings")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "owner": "u1",
                "peer": "u2",
                "is_pinned": true,
                "is_muted": true,
                "draft": "wip reply",
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let convs = conversations_of(&tc, "u1");
    assert_eq!(convs[0]["peer"], "u2");
    assert_eq!(convs[0]["is_pinned"], true);
    assert_eq!(convs[0]["is_muted"], true);
    assert_eq!(convs[0]["draft"], "wip reply");

    // Settings survive later fan-out onto the same row
    send_text(&tc, "u2", "u1", "another", None);
    let conv = wait_for_conversation(&tc, "u1", "u2", |c| c["unread_count"] == 2);
    assert_eq!(conv["is_pinned"], true);
    assert_eq!(conv["draft"], "wip reply");
}

#[test]
fn test_group_members_and_friendships_listings() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2"]);
    block(&tc, "u1", "u9");

    let members: Vec<serde_json::Value> = tc
        .get("/api/v1/groups/g1/members")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(members.len(), 2);
    let owner = members.iter().find(|m| m["user_id"] == "u1").unwrap();
    assert_eq!(owner["role"], "owner");
    assert_eq!(owner["status"], "joined");

    let res = tc.get("/api/v1/groups/nope/members").dispatch();
    assert_eq!(res.status(), Status::NotFound);

    let edges: Vec<serde_json::Value> = tc
        .get("/api/v1/friendships?user_id=u1")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0]["target_id"], "u9");
    assert_eq!(edges[0]["status"], "blocked");
}

// --- Stats ---

#[test]
fn test_user_stats_counts_by_direction_and_type() {
    let tc = test_client();
    create_group(&tc, "g1", "u1", &["u2"]);
    send_text(&tc, "u1", "u2", "text one", None);
    send_text(&tc, "u1", "u2", "text two", None);
    send_text(&tc, "u2", "u1", "reply", None);
    send_group_text(&tc, "u1", "g1", "group note", None);
    tc.post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "type": "image",
                "content": {"url": "https://example.com/cat.png"},
                "from_user_id": "u1",
                "to_user_id": "u2",
            })
            .to_string(),
        )
        .dispatch();

    let stats: serde_json::Value = tc
        .get("/api/v1/stats?user=u1")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(stats["sent"], 4);
    // One direct reply plus the group note is u1's own — only the reply counts
    assert_eq!(stats["received"], 1);
    assert_eq!(stats["by_type"]["text"], 3);
    assert_eq!(stats["by_type"]["image"], 1);

    let stats: serde_json::Value = tc
        .get("/api/v1/stats?user=u2")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(stats["sent"], 1);
    // Two texts + one image direct, plus the group note
    assert_eq!(stats["received"], 4);
}

fn urlencode(s: &str) -> String {
    // Base64 cursors may carry '+' and '='; percent-encode for query use
    s.chars()
        .map(|c| match c {
            '+' => "%2B".to_string(),
            '=' => "%3D".to_string(),
            '/' => "%2F".to_string(),
            other => other.to_string(),
        })
        .collect()
}
