use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ListCacheKey {
    pub(crate) feature_key: String,
    pub(crate) list_id: String,
    pub(crate) attribute: String,
    pub(crate) user_id: String,
    pub(crate) is_custom_variable: bool,
}

struct Entry {
    member: bool,
    inserted_at: Instant,
}

/// Time-bounded cache of list membership answers, shared by all evaluations of one
/// [crate::Evaluator]. Only successful answers are cached.
pub(crate) struct ListMembershipCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<ListCacheKey, Entry>>,
}

impl ListMembershipCache {
    pub(crate) fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &ListCacheKey) -> Option<bool> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn insert(&self, key: ListCacheKey, member: bool) {
        self.insert_at(key, member, Instant::now())
    }

    fn get_at(&self, key: &ListCacheKey, now: Instant) -> Option<bool> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                debug!("list membership cache hit for list {}", key.list_id);
                Some(entry.member)
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert_at(&self, key: ListCacheKey, member: bool, now: Instant) {
        if self.capacity == 0 || self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, e| now.duration_since(e.inserted_at) < ttl);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                member,
                inserted_at: now,
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(list_id: &str) -> ListCacheKey {
        ListCacheKey {
            feature_key: "feature".into(),
            list_id: list_id.into(),
            attribute: "value".into(),
            user_id: "alice".into(),
            is_custom_variable: true,
        }
    }

    #[test]
    fn answers_expire_after_ttl() {
        let cache = ListMembershipCache::new(Duration::from_secs(60), 10);
        let start = Instant::now();
        cache.insert_at(key("a"), true, start);

        assert_eq!(cache.get_at(&key("a"), start + Duration::from_secs(59)), Some(true));
        assert_eq!(cache.get_at(&key("a"), start + Duration::from_secs(60)), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn key_includes_every_dimension() {
        let cache = ListMembershipCache::new(Duration::from_secs(60), 10);
        cache.insert(key("a"), false);

        let mut other = key("a");
        other.is_custom_variable = false;
        assert_eq!(cache.get(&other), None);
        assert_eq!(cache.get(&key("a")), Some(false));
    }

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let cache = ListMembershipCache::new(Duration::from_secs(60), 2);
        let start = Instant::now();
        cache.insert_at(key("a"), true, start);
        cache.insert_at(key("b"), true, start + Duration::from_secs(1));
        cache.insert_at(key("c"), true, start + Duration::from_secs(2));

        let now = start + Duration::from_secs(3);
        assert_eq!(cache.get_at(&key("a"), now), None);
        assert_eq!(cache.get_at(&key("b"), now), Some(true));
        assert_eq!(cache.get_at(&key("c"), now), Some(true));
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = ListMembershipCache::new(Duration::ZERO, 10);
        cache.insert(key("a"), true);
        assert_eq!(cache.len(), 0);
    }
}
