use crate::config::AggregatorConfig;
use crate::record::{sha256_hex, IdOrigin, RecordKind, StreamRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupStats {
    pub accepted: u64,
    pub dropped_exact: u64,
    pub dropped_fuzzy: u64,
    pub evictions: u64,
}

/// Suppresses replayed and truncated-duplicate records.
///
/// Two layers share one bounded key cache: an exact layer for records that
/// carry a producer id, and a coarse layer keyed on the shape of the payload
/// (length plus leading and trailing characters). When the cache grows past
/// capacity the oldest half of the keys is evicted.
pub struct IdentityFilter {
    capacity: usize,
    edge_chars: usize,
    min_len: usize,
    bucket_ms: i64,
    narrative_regions: BTreeSet<String>,
    order: VecDeque<String>,
    seen: HashSet<String>,
    stats: DedupStats,
}

impl IdentityFilter {
    pub fn new(config: &AggregatorConfig) -> Self {
        Self {
            capacity: config.dedup_capacity.max(1),
            edge_chars: config.dedup_edge_chars.max(1),
            min_len: config.dedup_min_len,
            bucket_ms: config.dedup_time_bucket_ms.max(1),
            narrative_regions: config.narrative_regions.clone(),
            order: VecDeque::new(),
            seen: HashSet::new(),
            stats: DedupStats::default(),
        }
    }

    pub fn accept(&mut self, record: &StreamRecord) -> bool {
        if record.kind == RecordKind::Heartbeat {
            return true;
        }

        let exact = exact_key(record);
        if let Some(key) = exact.as_ref() {
            if self.seen.contains(key) {
                self.stats.dropped_exact += 1;
                debug!(id = %record.id, region = %record.region, "dedup_exact_drop");
                return false;
            }
        }

        let fuzzy = self.fuzzy_key(record);
        if let Some(key) = fuzzy.as_ref() {
            if self.seen.contains(key) {
                self.stats.dropped_fuzzy += 1;
                debug!(
                    id = %record.id,
                    region = %record.region,
                    source = %record.source,
                    "dedup_fuzzy_drop"
                );
                return false;
            }
        }

        for key in [exact, fuzzy].into_iter().flatten() {
            self.remember(key);
        }
        self.stats.accepted += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.order.clear();
        self.seen.clear();
        self.stats = DedupStats::default();
    }

    fn fuzzy_key(&self, record: &StreamRecord) -> Option<String> {
        if record.kind != RecordKind::Message {
            return Some(terminal_key(record));
        }
        if record.content.is_empty() {
            return None;
        }

        let length = record.content.chars().count();
        let narrative = self.narrative_regions.contains(&record.region);
        if narrative && length <= self.min_len {
            return None;
        }

        let head = record
            .content
            .chars()
            .take(self.edge_chars)
            .collect::<String>();
        let tail = record
            .content
            .chars()
            .skip(length.saturating_sub(self.edge_chars))
            .collect::<String>();
        let bucket = if narrative {
            record.timestamp.timestamp_millis().div_euclid(self.bucket_ms)
        } else {
            0
        };
        let shape = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            record.region, record.source, length, head, tail, record.is_final, bucket
        );
        Some(format!("shape:{}", &sha256_hex(shape.as_bytes())[..32]))
    }

    fn remember(&mut self, key: String) {
        if self.seen.insert(key.clone()) {
            self.order.push_back(key);
        }
        if self.seen.len() > self.capacity {
            let evict = self.order.len() / 2;
            for key in self.order.drain(..evict) {
                self.seen.remove(&key);
            }
            self.stats.evictions += evict as u64;
        }
    }
}

/// Terminal records key on their payload, so an anonymous replay with a
/// fresh synthesized id still collides.
fn terminal_key(record: &StreamRecord) -> String {
    let result = record
        .result
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    let shape = format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
        record.kind, record.source, record.region, record.content, result
    );
    format!("terminal:{}", &sha256_hex(shape.as_bytes())[..32])
}

fn exact_key(record: &StreamRecord) -> Option<String> {
    if record.id_origin != IdOrigin::Producer {
        return None;
    }
    let digest = sha256_hex(format!("{}\u{1f}{}", record.kind, record.content).as_bytes());
    Some(format!("id:{}:{}", record.id, &digest[..16]))
}
