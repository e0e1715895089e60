use std::env;

/// Runtime configuration. All values read from environment variables with
/// sensible defaults.
///
/// Environment variables:
/// - `BROKER_URL` — REST endpoint of the channel broker (default: `http://127.0.0.1:5001`)
/// - `BROKER_MANAGER_URL` — manager endpoint, falls back to `BROKER_URL`
/// - `BROKER_WS_URL` — advertised client connection URL (default: `ws://127.0.0.1:5200`)
/// - `BROKER_TOKEN` — bearer token for broker manager calls (optional)
/// - `BROKER_TIMEOUT_SECS` — per-request timeout (default: 10)
/// - `BROKER_BATCH_TIMEOUT_SECS` — batch-send timeout (default: 30)
/// - `SEND_RETRY_ATTEMPTS` — broker send attempts including the first (default: 4)
/// - `SEND_RETRY_INITIAL_MS` — base backoff before the first retry (default: 1000)
/// - `SEND_CONCURRENCY` — in-flight broker sends per process (default: 32)
/// - `SEND_QUEUE_DEPTH` — waiters allowed beyond that before rejecting (default: 256)
/// - `WEBHOOK_SECRET` — HMAC secret for inbound broker events (optional)
/// - `WEBHOOK_ENABLED` — accept inbound broker events at all (default: true)
/// - `DEDUPE_FILTER_BITS` — bit filter width (default: 1 << 20)
/// - `DEDUPE_HASH_COUNT` — hash positions per key (default: 7)
/// - `DEDUPE_TTL_HOURS` — confirmation-set retention (default: 24)
/// - `DEDUPE_TX_TTL_SECS` — orphaned transactional mark lifetime (default: 300)
/// - `DEDUPE_FPR_THRESHOLD` — estimated false-positive rate that triggers a rebuild (default: 0.01)
/// - `SEQ_TTL_DAYS` — idle sequence counter retention (default: 30)
/// - `RECALL_WINDOW_SECS` — how long the sender may retract (default: 120)
/// - `REQUIRE_FRIENDSHIP` — require mutual accept for single chat (default: false)
/// - `SNIPPET_MAX_CHARS` — conversation preview length (default: 50)
/// - `GROUP_FANOUT_BATCH` — members per multi-row upsert (default: 500)
/// - `UNREAD_FLUSH_SECS` — pending unread reconciliation interval (default: 5)
/// - `REPAIR_INTERVAL_SECS` — conversation repair sweep interval (default: 300)
/// - `MAINTENANCE_INTERVAL_SECS` — dedupe/sequence sweep interval (default: 60)
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub broker_url: String,
    pub broker_manager_url: String,
    pub broker_ws_url: String,
    pub broker_token: Option<String>,
    pub broker_timeout_secs: u64,
    pub broker_batch_timeout_secs: u64,
    pub send_retry_attempts: u32,
    pub send_retry_initial_ms: u64,
    pub send_concurrency: usize,
    pub send_queue_depth: i64,
    pub webhook_secret: Option<String>,
    pub webhook_enabled: bool,
    pub dedupe_filter_bits: u64,
    pub dedupe_hash_count: u32,
    pub dedupe_ttl_hours: u64,
    pub dedupe_tx_ttl_secs: u64,
    pub dedupe_fpr_threshold: f64,
    pub seq_ttl_days: u64,
    pub recall_window_secs: i64,
    pub require_friendship: bool,
    pub snippet_max_chars: usize,
    pub group_fanout_batch: usize,
    pub unread_flush_secs: u64,
    pub repair_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    pub max_batch_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            broker_url: "http://127.0.0.1:5001".to_string(),
            broker_manager_url: "http://127.0.0.1:5001".to_string(),
            broker_ws_url: "ws://127.0.0.1:5200".to_string(),
            broker_token: None,
            broker_timeout_secs: 10,
            broker_batch_timeout_secs: 30,
            send_retry_attempts: 4,
            send_retry_initial_ms: 1000,
            send_concurrency: 32,
            send_queue_depth: 256,
            webhook_secret: None,
            webhook_enabled: true,
            dedupe_filter_bits: 1 << 20,
            dedupe_hash_count: 7,
            dedupe_ttl_hours: 24,
            dedupe_tx_ttl_secs: 300,
            dedupe_fpr_threshold: 0.01,
            seq_ttl_days: 30,
            recall_window_secs: 120,
            require_friendship: false,
            snippet_max_chars: 50,
            group_fanout_batch: 500,
            unread_flush_secs: 5,
            repair_interval_secs: 300,
            maintenance_interval_secs: 60,
            max_batch_size: 20,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, out: &mut T) {
    if let Ok(val) = env::var(key)
        && let Ok(n) = val.parse::<T>()
    {
        *out = n;
    }
}

fn env_bool(key: &str, out: &mut bool) {
    if let Ok(val) = env::var(key) {
        *out = val != "0" && val.to_lowercase() != "false";
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("BROKER_URL") {
            config.broker_url = val.clone();
            config.broker_manager_url = val;
        }
        if let Ok(val) = env::var("BROKER_MANAGER_URL") {
            config.broker_manager_url = val;
        }
        if let Ok(val) = env::var("BROKER_WS_URL") {
            config.broker_ws_url = val;
        }
        if let Ok(val) = env::var("BROKER_TOKEN")
            && !val.is_empty()
        {
            config.broker_token = Some(val);
        }
        if let Ok(val) = env::var("WEBHOOK_SECRET")
            && !val.is_empty()
        {
            config.webhook_secret = Some(val);
        }

        env_parse("BROKER_TIMEOUT_SECS", &mut config.broker_timeout_secs);
        env_parse(
            "BROKER_BATCH_TIMEOUT_SECS",
            &mut config.broker_batch_timeout_secs,
        );
        env_parse("SEND_RETRY_ATTEMPTS", &mut config.send_retry_attempts);
        env_parse("SEND_RETRY_INITIAL_MS", &mut config.send_retry_initial_ms);
        env_parse("SEND_CONCURRENCY", &mut config.send_concurrency);
        env_parse("SEND_QUEUE_DEPTH", &mut config.send_queue_depth);
        env_parse("DEDUPE_FILTER_BITS", &mut config.dedupe_filter_bits);
        env_parse("DEDUPE_HASH_COUNT", &mut config.dedupe_hash_count);
        env_parse("DEDUPE_TTL_HOURS", &mut config.dedupe_ttl_hours);
        env_parse("DEDUPE_TX_TTL_SECS", &mut config.dedupe_tx_ttl_secs);
        env_parse("DEDUPE_FPR_THRESHOLD", &mut config.dedupe_fpr_threshold);
        env_parse("SEQ_TTL_DAYS", &mut config.seq_ttl_days);
        env_parse("RECALL_WINDOW_SECS", &mut config.recall_window_secs);
        env_parse("SNIPPET_MAX_CHARS", &mut config.snippet_max_chars);
        env_parse("GROUP_FANOUT_BATCH", &mut config.group_fanout_batch);
        env_parse("UNREAD_FLUSH_SECS", &mut config.unread_flush_secs);
        env_parse("REPAIR_INTERVAL_SECS", &mut config.repair_interval_secs);
        env_parse(
            "MAINTENANCE_INTERVAL_SECS",
            &mut config.maintenance_interval_secs,
        );
        env_bool("WEBHOOK_ENABLED", &mut config.webhook_enabled);
        env_bool("REQUIRE_FRIENDSHIP", &mut config.require_friendship);

        config
    }
}
