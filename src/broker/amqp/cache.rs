/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Out-of-order result cache.
//!
//! Clients of one function share a reply queue, so while awaiting its own
//! job's result a client may receive results belonging to other
//! outstanding jobs. Those are parked here, keyed by `correlation_id`,
//! for the other waiters to collect.
//!
//! The cache is bounded by entry count and by total stored body bytes,
//! evicting the oldest insertion first. An evicted result strands its
//! waiter, so every eviction emits an operational warning.

use std::collections::{HashMap, VecDeque};

use tracing::warn;

/// Maximum number of parked results.
const MAX_ENTRIES: usize = 102_400;
/// Maximum total bytes of parked result bodies.
const MAX_BYTES: usize = 10 * 1024 * 1024;

/// Bounded store of raw result message bodies keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct ResultCache {
    entries: HashMap<String, Vec<u8>>,
    /// Insertion order for eviction. May contain keys already taken;
    /// those are skipped when evicting.
    order: VecDeque<String>,
    total_bytes: usize,
}

impl ResultCache {
    /// Parks a result body under its correlation id, evicting the oldest
    /// entries if a bound is exceeded.
    pub(crate) fn insert(&mut self, correlation_id: String, body: Vec<u8>) {
        if let Some(previous) = self.entries.remove(&correlation_id) {
            // A duplicate delivery replaces the parked body.
            self.total_bytes -= previous.len();
        }
        self.total_bytes += body.len();
        self.order.push_back(correlation_id.clone());
        self.entries.insert(correlation_id, body);
        self.evict_to_bounds();
    }

    /// Removes and returns the parked body for `correlation_id`.
    pub(crate) fn take(&mut self, correlation_id: &str) -> Option<Vec<u8>> {
        let body = self.entries.remove(correlation_id)?;
        self.total_bytes -= body.len();
        Some(body)
    }

    /// Number of parked results.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total bytes of parked result bodies.
    #[cfg(test)]
    pub(crate) fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    fn evict_to_bounds(&mut self) {
        while self.entries.len() > MAX_ENTRIES || self.total_bytes > MAX_BYTES {
            let Some(oldest) = self.order.pop_front() else {
                return;
            };
            // Stale order entries belong to results already taken.
            let Some(body) = self.entries.remove(&oldest) else {
                continue;
            };
            self.total_bytes -= body.len();
            warn!(
                correlation_id = %oldest,
                evicted_bytes = body.len(),
                cached_entries = self.entries.len(),
                cached_bytes = self.total_bytes,
                "result cache full; evicted a parked result, its waiter will block until the job is republished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_take() {
        let mut cache = ResultCache::default();
        cache.insert("a".to_string(), b"one".to_vec());
        cache.insert("b".to_string(), b"two".to_vec());

        assert_eq!(cache.take("a").unwrap(), b"one");
        assert!(cache.take("a").is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 3);
    }

    #[test]
    fn test_duplicate_insert_replaces_body() {
        let mut cache = ResultCache::default();
        cache.insert("a".to_string(), b"short".to_vec());
        cache.insert("a".to_string(), b"a much longer body".to_vec());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 18);
        assert_eq!(cache.take("a").unwrap(), b"a much longer body");
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_byte_bound_evicts_oldest_first() {
        let mut cache = ResultCache::default();
        // Three bodies of 4 MiB: the third insertion must evict "first".
        let body = vec![0u8; 4 * 1024 * 1024];
        cache.insert("first".to_string(), body.clone());
        cache.insert("second".to_string(), body.clone());
        cache.insert("third".to_string(), body);

        assert_eq!(cache.len(), 2);
        assert!(cache.take("first").is_none());
        assert!(cache.take("second").is_some());
        assert!(cache.take("third").is_some());
    }

    #[test]
    fn test_stale_order_entries_are_skipped_when_evicting() {
        let mut cache = ResultCache::default();
        let body = vec![0u8; 6 * 1024 * 1024];
        cache.insert("first".to_string(), body.clone());
        assert!(cache.take("first").is_some());

        // "first" is still queued for eviction but already taken; the
        // third insertion must skip it and evict "second" instead.
        cache.insert("second".to_string(), body.clone());
        cache.insert("third".to_string(), body);
        assert_eq!(cache.len(), 1);
        assert!(cache.take("second").is_none());
        assert!(cache.take("third").is_some());
    }
}
