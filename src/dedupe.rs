// Retry deduplication. Two tiers: a bit filter answers "definitely new" in
// O(k); possible positives are settled against an authoritative confirmation
// map keyed "{sender}:{client_seq}". The filter cannot delete, so rollback
// only removes confirmation entries and a periodic rebuild squeezes the
// accumulated false-positive rate back down.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Seeded FNV-1a; one seed per hash position.
fn fnv1a(seed: u64, data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET ^ seed.wrapping_mul(FNV_PRIME);
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub struct BitFilter {
    bits: Vec<u64>,
    num_bits: u64,
    hash_count: u32,
    inserted: u64,
}

impl BitFilter {
    pub fn new(num_bits: u64, hash_count: u32) -> Self {
        let num_bits = num_bits.max(64);
        let words = num_bits.div_ceil(64) as usize;
        BitFilter {
            bits: vec![0u64; words],
            num_bits,
            hash_count: hash_count.max(1),
            inserted: 0,
        }
    }

    fn positions(&self, key: &str) -> impl Iterator<Item = u64> + '_ {
        let data = key.as_bytes().to_vec();
        (0..self.hash_count as u64).map(move |seed| fnv1a(seed, &data) % self.num_bits)
    }

    pub fn insert(&mut self, key: &str) {
        for pos in self.positions(key).collect::<Vec<_>>() {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
        self.inserted += 1;
    }

    /// False negatives are impossible; a true result only means "maybe".
    pub fn might_contain(&self, key: &str) -> bool {
        self.positions(key)
            .collect::<Vec<_>>()
            .iter()
            .all(|pos| self.bits[(*pos / 64) as usize] & (1 << (*pos % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.inserted = 0;
    }

    /// (1 - e^(-k·n/m))^k for n insertions into m bits with k hashes.
    pub fn estimated_fpr(&self) -> f64 {
        let k = self.hash_count as f64;
        let n = self.inserted as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupeStats {
    pub filter_bits: u64,
    pub hash_count: u32,
    pub confirmed_count: usize,
    pub estimated_fpr: f64,
}

struct TxMark {
    keys: Vec<String>,
    expires_at: Instant,
}

pub struct DedupeEngine {
    filter: Mutex<BitFilter>,
    confirmed: Mutex<HashMap<String, Instant>>,
    tx_marks: Mutex<HashMap<String, TxMark>>,
    confirm_ttl: Duration,
    tx_ttl: Duration,
    fpr_threshold: f64,
}

pub fn dedupe_key(sender: &str, client_seq: i64) -> String {
    format!("{sender}:{client_seq}")
}

impl DedupeEngine {
    pub fn new(
        filter_bits: u64,
        hash_count: u32,
        confirm_ttl: Duration,
        tx_ttl: Duration,
        fpr_threshold: f64,
    ) -> Self {
        DedupeEngine {
            filter: Mutex::new(BitFilter::new(filter_bits, hash_count)),
            confirmed: Mutex::new(HashMap::new()),
            tx_marks: Mutex::new(HashMap::new()),
            confirm_ttl,
            tx_ttl,
            fpr_threshold,
        }
    }

    pub fn is_duplicate(&self, sender: &str, client_seq: i64) -> bool {
        let key = dedupe_key(sender, client_seq);
        {
            let filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
            if !filter.might_contain(&key) {
                return false;
            }
        }
        let mut confirmed = self.confirmed.lock().unwrap_or_else(|e| e.into_inner());
        match confirmed.get(&key) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                confirmed.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn is_duplicate_batch(&self, sender: &str, client_seqs: &[i64]) -> HashMap<i64, bool> {
        client_seqs
            .iter()
            .map(|cs| (*cs, self.is_duplicate(sender, *cs)))
            .collect()
    }

    /// Non-transactional mark, for paths with no store write to protect.
    pub fn mark_processed(&self, sender: &str, client_seq: i64) {
        let key = dedupe_key(sender, client_seq);
        self.insert_key(&key);
    }

    /// Transactional mark: recorded in the filter and the confirmation map,
    /// and remembered under `tx_id` until commit or rollback.
    pub fn mark_processed_tx(&self, sender: &str, client_seq: i64, tx_id: &str) {
        let key = dedupe_key(sender, client_seq);
        self.insert_key(&key);
        let mut marks = self.tx_marks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = marks.entry(tx_id.to_string()).or_insert_with(|| TxMark {
            keys: Vec::new(),
            expires_at: Instant::now() + self.tx_ttl,
        });
        entry.keys.push(key);
    }

    pub fn commit_tx(&self, tx_id: &str) {
        let mut marks = self.tx_marks.lock().unwrap_or_else(|e| e.into_inner());
        marks.remove(tx_id);
    }

    /// Undo a transactional mark. The confirmation map is authoritative, so
    /// only it is cleaned; the filter bits stay until the next rebuild.
    pub fn rollback_tx(&self, tx_id: &str) {
        let keys = {
            let mut marks = self.tx_marks.lock().unwrap_or_else(|e| e.into_inner());
            marks.remove(tx_id).map(|m| m.keys).unwrap_or_default()
        };
        if keys.is_empty() {
            return;
        }
        let mut confirmed = self.confirmed.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            confirmed.remove(&key);
        }
    }

    fn insert_key(&self, key: &str) {
        {
            let mut filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
            filter.insert(key);
        }
        let mut confirmed = self.confirmed.lock().unwrap_or_else(|e| e.into_inner());
        confirmed.insert(key.to_string(), Instant::now() + self.confirm_ttl);
    }

    /// Reseed the filter from the confirmation map.
    pub fn rebuild(&self) {
        let confirmed = self.confirmed.lock().unwrap_or_else(|e| e.into_inner());
        let mut filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
        filter.clear();
        let now = Instant::now();
        for (key, expires) in confirmed.iter() {
            if *expires > now {
                filter.insert(key);
            }
        }
    }

    /// Periodic upkeep: expire confirmations, resolve orphaned transaction
    /// marks (expiry counts as commit — the keys stay confirmed), and
    /// rebuild the filter when it has degraded.
    pub fn sweep(&self) {
        let now = Instant::now();
        {
            let mut confirmed = self.confirmed.lock().unwrap_or_else(|e| e.into_inner());
            confirmed.retain(|_, expires| *expires > now);
        }
        {
            let mut marks = self.tx_marks.lock().unwrap_or_else(|e| e.into_inner());
            marks.retain(|_, m| m.expires_at > now);
        }
        let should_rebuild = {
            let filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
            let confirmed = self.confirmed.lock().unwrap_or_else(|e| e.into_inner());
            (confirmed.is_empty() && filter.inserted > 0)
                || filter.estimated_fpr() > self.fpr_threshold
        };
        if should_rebuild {
            self.rebuild();
        }
    }

    pub fn stats(&self) -> DedupeStats {
        let filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
        let confirmed = self.confirmed.lock().unwrap_or_else(|e| e.into_inner());
        DedupeStats {
            filter_bits: filter.num_bits,
            hash_count: filter.hash_count,
            confirmed_count: confirmed.len(),
            estimated_fpr: filter.estimated_fpr(),
        }
    }
}
