//! Read-through cache for week patterns.
//!
//! One invalidation capability for every write path: mutations call
//! `invalidate` for each week they touch before returning success, so a
//! concurrent reader never sees a stale pattern. Keys are
//! `"{instructor_id}:{week_start}"`; `invalidate_prefix` with the
//! instructor prefix drops everything cached for one calendar.

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::WeekPattern;
use crate::observability;

#[derive(Default)]
pub struct WeekCache {
    entries: DashMap<String, WeekPattern>,
}

impl WeekCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn week_key(instructor_id: Ulid, week_start: NaiveDate) -> String {
        format!("{instructor_id}:{week_start}")
    }

    pub fn instructor_prefix(instructor_id: Ulid) -> String {
        format!("{instructor_id}:")
    }

    pub fn get(&self, key: &str) -> Option<WeekPattern> {
        let hit = self.entries.get(key).map(|e| e.value().clone());
        if hit.is_some() {
            metrics::counter!(observability::CACHE_HITS_TOTAL).increment(1);
        } else {
            metrics::counter!(observability::CACHE_MISSES_TOTAL).increment(1);
        }
        hit
    }

    pub fn put(&self, key: String, pattern: WeekPattern) {
        self.entries.insert(key, pattern);
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn put_get_invalidate() {
        let cache = WeekCache::new();
        let iid = Ulid::new();
        let key = WeekCache::week_key(iid, d(2025, 6, 2));

        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), WeekPattern::default());
        assert!(cache.get(&key).is_some());

        cache.invalidate(&key);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn prefix_invalidation_scopes_to_instructor() {
        let cache = WeekCache::new();
        let alice = Ulid::new();
        let bob = Ulid::new();

        cache.put(WeekCache::week_key(alice, d(2025, 6, 2)), WeekPattern::default());
        cache.put(WeekCache::week_key(alice, d(2025, 6, 9)), WeekPattern::default());
        cache.put(WeekCache::week_key(bob, d(2025, 6, 2)), WeekPattern::default());
        assert_eq!(cache.len(), 3);

        cache.invalidate_prefix(&WeekCache::instructor_prefix(alice));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&WeekCache::week_key(bob, d(2025, 6, 2))).is_some());
    }

    #[test]
    fn keys_distinguish_weeks() {
        let iid = Ulid::new();
        assert_ne!(
            WeekCache::week_key(iid, d(2025, 6, 2)),
            WeekCache::week_key(iid, d(2025, 6, 9)),
        );
    }
}
