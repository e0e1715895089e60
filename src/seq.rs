// Per-conversation ordinal allocator. A shared in-process counter map with
// TTL refresh; cold entries are seeded from the store's MAX(seq), so a
// restart costs at most the single in-flight increment — acceptable because
// message seq is gap-tolerant.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Counter {
    value: i64,
    expires_at: Instant,
}

pub struct SequenceService {
    counters: Mutex<HashMap<String, Counter>>,
    ttl: Duration,
}

impl SequenceService {
    pub fn new(ttl: Duration) -> Self {
        SequenceService {
            counters: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Allocate the next ordinal for a conversation, strictly greater than
    /// every prior allocation. `seed` supplies the durable high-water mark
    /// when the counter is cold (first use, expired, or process restart).
    pub fn next(&self, conversation: &str, seed: impl FnOnce() -> i64) -> i64 {
        self.next_batch(conversation, 1, seed)[0]
    }

    /// Allocate `n` contiguous ordinals as one atomic step.
    pub fn next_batch(
        &self,
        conversation: &str,
        n: i64,
        seed: impl FnOnce() -> i64,
    ) -> Vec<i64> {
        let n = n.max(1);
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let cold = !matches!(counters.get(conversation), Some(c) if c.expires_at > now);
        if cold {
            counters.insert(
                conversation.to_string(),
                Counter {
                    value: seed(),
                    expires_at: now + self.ttl,
                },
            );
        }
        let entry = counters.get_mut(conversation).unwrap();
        let start = entry.value + 1;
        entry.value += n;
        entry.expires_at = now + self.ttl;
        (start..start + n).collect()
    }

    /// The last allocated ordinal (0 when nothing allocated yet).
    pub fn current(&self, conversation: &str, seed: impl FnOnce() -> i64) -> i64 {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let cold = !matches!(counters.get(conversation), Some(c) if c.expires_at > now);
        if cold {
            counters.insert(
                conversation.to_string(),
                Counter {
                    value: seed(),
                    expires_at: now + self.ttl,
                },
            );
        }
        let entry = counters.get_mut(conversation).unwrap();
        entry.expires_at = now + self.ttl;
        entry.value
    }

    /// Administrative reset to an explicit value.
    pub fn reset(&self, conversation: &str, value: i64) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.insert(
            conversation.to_string(),
            Counter {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn remove(&self, conversation: &str) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.remove(conversation);
    }

    /// Drop idle counters; they re-seed from the store on next use.
    pub fn purge_expired(&self) -> usize {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let before = counters.len();
        counters.retain(|_, c| c.expires_at > now);
        before - counters.len()
    }
}
