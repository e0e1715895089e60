use crate::common::*;

// --- Retry deduplication through the pipeline ---

#[test]
fn test_duplicate_retry_returns_existing_row() {
    let tc = test_client();

    let first = send_text(&tc, "u1", "u2", "hello", Some(10));
    assert_eq!(first["success"], true);
    let original_id = first["message"]["id"].as_str().unwrap().to_string();
    assert_eq!(tc.broker.send_count(), 1);

    // Identical resubmission: no new row, no broker call, original returned
    let second = send_text(&tc, "u1", "u2", "hello", Some(10));
    assert_eq!(second["success"], true);
    assert_eq!(second["is_duplicate"], true);
    assert_eq!(second["message"]["id"], original_id.as_str());
    assert_eq!(tc.broker.send_count(), 1);

    let msgs: Vec<serde_json::Value> = tc
        .get("/api/v1/messages?user=u1")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(msgs.len(), 1);
}

#[test]
fn test_same_client_seq_different_senders_not_duplicates() {
    let tc = test_client();
    let a = send_text(&tc, "u1", "u3", "from u1", Some(5));
    let b = send_text(&tc, "u2", "u3", "from u2", Some(5));
    assert_eq!(a["success"], true);
    assert_eq!(a["is_duplicate"], false);
    assert_eq!(b["success"], true);
    assert_eq!(b["is_duplicate"], false);
    assert_eq!(tc.broker.send_count(), 2);
}

#[test]
fn test_sends_without_client_seq_never_dedupe() {
    let tc = test_client();
    let a = send_text(&tc, "u1", "u2", "ping", None);
    let b = send_text(&tc, "u1", "u2", "ping", None);
    assert_eq!(a["is_duplicate"], false);
    assert_eq!(b["is_duplicate"], false);
    assert_eq!(tc.broker.send_count(), 2);
}

#[test]
fn test_duplicate_after_failed_send_still_resolves() {
    let mut config = chat_core::config::CoreConfig::default();
    config.send_retry_attempts = 1;
    config.send_retry_initial_ms = 1;
    let tc = test_client_with_config(config);

    tc.broker
        .fail_next_sends
        .store(1, std::sync::atomic::Ordering::SeqCst);
    let first = send_text(&tc, "u1", "u2", "flaky", Some(42));
    assert_eq!(first["success"], false);

    // The row was committed before the broker send, so the retry with the
    // same client_seq resolves as a duplicate of the failed row rather than
    // creating a second one. The failed row is recovered via explicit retry.
    let second = send_text(&tc, "u1", "u2", "flaky", Some(42));
    assert_eq!(second["success"], true);
    assert_eq!(second["is_duplicate"], true);
    assert_eq!(second["message"]["status"], "failed");

    let msgs: Vec<serde_json::Value> = tc
        .get("/api/v1/messages?user=u1")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(msgs.len(), 1);
}

// --- Engine-level behavior ---

#[test]
fn test_engine_mark_and_check() {
    use chat_core::dedupe::DedupeEngine;
    use std::time::Duration;

    let engine = DedupeEngine::new(
        1 << 20,
        7,
        Duration::from_secs(3600),
        Duration::from_secs(300),
        0.01,
    );

    assert!(!engine.is_duplicate("u1", 1));
    engine.mark_processed("u1", 1);
    assert!(engine.is_duplicate("u1", 1));
    assert!(!engine.is_duplicate("u1", 2));
    assert!(!engine.is_duplicate("u2", 1));

    let batch = engine.is_duplicate_batch("u1", &[1, 2, 3]);
    assert_eq!(batch[&1], true);
    assert_eq!(batch[&2], false);
    assert_eq!(batch[&3], false);
}

#[test]
fn test_engine_tx_commit_and_rollback() {
    use chat_core::dedupe::DedupeEngine;
    use std::time::Duration;

    let engine = DedupeEngine::new(
        1 << 20,
        7,
        Duration::from_secs(3600),
        Duration::from_secs(300),
        0.01,
    );

    engine.mark_processed_tx("u1", 1, "tx-a");
    assert!(engine.is_duplicate("u1", 1));
    engine.commit_tx("tx-a");
    assert!(engine.is_duplicate("u1", 1));

    // A rolled-back mark must stop reporting duplicate, even though the
    // filter bits stay set — the confirmation set is authoritative.
    engine.mark_processed_tx("u1", 2, "tx-b");
    assert!(engine.is_duplicate("u1", 2));
    engine.rollback_tx("tx-b");
    assert!(!engine.is_duplicate("u1", 2));
}

#[test]
fn test_engine_rebuild_preserves_confirmed_keys() {
    use chat_core::dedupe::DedupeEngine;
    use std::time::Duration;

    let engine = DedupeEngine::new(
        1 << 16,
        7,
        Duration::from_secs(3600),
        Duration::from_secs(300),
        0.01,
    );
    for i in 0..100 {
        engine.mark_processed("u1", i);
    }
    engine.rebuild();
    for i in 0..100 {
        assert!(engine.is_duplicate("u1", i), "lost key {i} across rebuild");
    }
    assert!(!engine.is_duplicate("u1", 100));

    let stats = engine.stats();
    assert_eq!(stats.confirmed_count, 100);
    assert_eq!(stats.hash_count, 7);
    assert!(stats.estimated_fpr < 0.01);
}

#[test]
fn test_engine_expired_confirmations_stop_matching() {
    use chat_core::dedupe::DedupeEngine;
    use std::time::Duration;

    let engine = DedupeEngine::new(
        1 << 16,
        7,
        Duration::from_millis(20),
        Duration::from_secs(300),
        0.01,
    );
    engine.mark_processed("u1", 1);
    assert!(engine.is_duplicate("u1", 1));
    std::thread::sleep(Duration::from_millis(40));
    assert!(!engine.is_duplicate("u1", 1));
}
