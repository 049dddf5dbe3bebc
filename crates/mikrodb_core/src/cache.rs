//! LRU tracking for resident tables.

use mikrodb_codec::Record;
use std::collections::HashMap;

/// Tracks per-table access recency and selects eviction victims.
///
/// Access order is recorded with a monotonic stamp rather than the wall
/// clock so that two accesses in the same millisecond still order
/// correctly.
#[derive(Debug)]
pub struct LruTracker {
    limit: usize,
    stamps: HashMap<String, u64>,
    clock: u64,
}

impl LruTracker {
    /// Creates a tracker allowing `limit` resident tables.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stamps: HashMap::new(),
            clock: 0,
        }
    }

    /// Records an access to `table`, making it the most recently used.
    pub fn track_access(&mut self, table: &str) {
        self.clock += 1;
        self.stamps.insert(table.to_string(), self.clock);
    }

    /// Forgets a table (deleted or evicted).
    pub fn remove(&mut self, table: &str) {
        self.stamps.remove(table);
    }

    /// Selects the `current_count - limit` least-recently-used tables,
    /// removes them from the tracker, and returns them oldest first.
    ///
    /// Returns an empty vector when the count is at or below the limit.
    #[must_use]
    pub fn find_tables_for_eviction(&mut self, current_count: usize) -> Vec<String> {
        if current_count <= self.limit {
            return Vec::new();
        }
        let excess = current_count - self.limit;

        let mut by_age: Vec<(String, u64)> = self
            .stamps
            .iter()
            .map(|(name, stamp)| (name.clone(), *stamp))
            .collect();
        by_age.sort_by_key(|(_, stamp)| *stamp);

        let victims: Vec<String> = by_age.into_iter().take(excess).map(|(name, _)| name).collect();
        for victim in &victims {
            self.stamps.remove(victim);
        }
        victims
    }

    /// Returns the keys of all records in `records` whose expiration has
    /// passed at `now_ms`.
    #[must_use]
    pub fn find_expired_items(records: &HashMap<String, Record>, now_ms: u64) -> Vec<String> {
        records
            .iter()
            .filter(|(_, record)| record.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mikrodb_codec::Value;

    #[test]
    fn below_limit_evicts_nothing() {
        let mut lru = LruTracker::new(3);
        lru.track_access("a");
        lru.track_access("b");
        assert!(lru.find_tables_for_eviction(2).is_empty());
        assert!(lru.find_tables_for_eviction(3).is_empty());
    }

    #[test]
    fn victims_come_out_in_access_order() {
        let mut lru = LruTracker::new(2);
        for name in ["t1", "t2", "t3", "t4", "t5"] {
            lru.track_access(name);
        }

        let victims = lru.find_tables_for_eviction(5);
        assert_eq!(victims, vec!["t1".to_string(), "t2".to_string(), "t3".to_string()]);
    }

    #[test]
    fn reaccess_refreshes_recency() {
        let mut lru = LruTracker::new(1);
        lru.track_access("old");
        lru.track_access("new");
        lru.track_access("old"); // refresh

        let victims = lru.find_tables_for_eviction(2);
        assert_eq!(victims, vec!["new".to_string()]);
    }

    #[test]
    fn victims_are_forgotten() {
        let mut lru = LruTracker::new(1);
        lru.track_access("a");
        lru.track_access("b");

        let first = lru.find_tables_for_eviction(2);
        assert_eq!(first, vec!["a".to_string()]);
        // "a" is gone from the tracker; only "b" remains.
        assert!(lru.find_tables_for_eviction(1).is_empty());
    }

    #[test]
    fn expired_scan() {
        let mut records = HashMap::new();
        records.insert(
            "live".to_string(),
            Record::new(Value::Int(1), 1, 0, Some(2_000)),
        );
        records.insert(
            "dead".to_string(),
            Record::new(Value::Int(2), 1, 0, Some(500)),
        );
        records.insert("forever".to_string(), Record::new(Value::Int(3), 1, 0, None));

        let expired = LruTracker::find_expired_items(&records, 1_000);
        assert_eq!(expired, vec!["dead".to_string()]);
    }
}
