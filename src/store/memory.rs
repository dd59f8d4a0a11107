use super::CoordinationStore;
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory [`CoordinationStore`] fake, grounded on the same
/// deterministic-double-over-a-shared-lock shape as an in-memory test
/// manager: no network, inspectable state, real expiry semantics via
/// `Instant` so TTL-dependent invariants are still exercisable without a
/// live Redis.
#[derive(Default)]
pub struct InMemoryStore {
    strings: RwLock<HashMap<String, Entry>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
    zsets: RwLock<HashMap<String, BTreeSet<(ordered_float::NotNan<f64>, String)>>>,
}

mod ordered_float {
    // Minimal NotNan wrapper so BTreeSet can order zset members by score.
    // Scheduler code only ever feeds it execution timestamps, never NaN.
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub struct NotNan(f64);

    impl NotNan {
        pub fn new(v: f64) -> Self {
            debug_assert!(!v.is_nan());
            Self(v)
        }
    }

    impl Eq for NotNan {}
    impl PartialOrd for NotNan {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for NotNan {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry) -> bool {
        entry.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let map = self.strings.read().unwrap();
        Ok(map
            .get(key)
            .filter(|e| Self::is_live(e))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut map = self.strings.write().unwrap();
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut map = self.strings.write().unwrap();
        if let Some(existing) = map.get(key) {
            if Self::is_live(existing) {
                return Ok(false);
            }
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError> {
        let mut map = self.strings.write().unwrap();
        let mut removed = 0;
        for key in keys {
            if map.remove(*key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let map = self.strings.read().unwrap();
        Ok(map.get(key).map(Self::is_live).unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut map = self.strings.write().unwrap();
        if let Some(entry) = map.get_mut(key) {
            if Self::is_live(entry) {
                entry.expires_at = Some(Instant::now() + ttl);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let map = self.strings.read().unwrap();
        Ok(map.get(key).filter(|e| Self::is_live(e)).and_then(|e| {
            e.expires_at.map(|at| at.saturating_duration_since(Instant::now()))
        }))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut map = self.strings.write().unwrap();
        match map.get(key) {
            Some(entry) if Self::is_live(entry) && entry.value == expected => {
                map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut map = self.strings.write().unwrap();
        match map.get_mut(key) {
            Some(entry) if Self::is_live(entry) && entry.value == expected => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut sets = self.sets.write().unwrap();
        sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut sets = self.sets.write().unwrap();
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let sets = self.sets.read().unwrap();
        Ok(sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let sets = self.sets.read().unwrap();
        Ok(sets.get(key).map(|s| s.contains(member)).unwrap_or(false))
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut map = self.strings.write().unwrap();
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = entry.value.parse().unwrap_or(0);
        let next = current + by;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn zadd_capped(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cap: usize,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut zsets = self.zsets.write().unwrap();
        let set = zsets.entry(key.to_string()).or_default();
        set.insert((ordered_float::NotNan::new(score), member.to_string()));
        while set.len() > cap {
            let first = set.iter().next().cloned();
            if let Some(first) = first {
                set.remove(&first);
            }
        }
        Ok(())
    }

    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let zsets = self.zsets.read().unwrap();
        let Some(set) = zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<String> = set.iter().rev().map(|(_, m)| m.clone()).collect();
        if limit > 0 && members.len() > limit {
            members.truncate(limit);
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_fails_once_a_live_key_exists() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_owner() {
        let store = InMemoryStore::new();
        store.set("lock", "owner-a", Duration::from_secs(10)).await.unwrap();
        assert!(!store.compare_and_delete("lock", "owner-b").await.unwrap());
        assert!(store.compare_and_delete("lock", "owner-a").await.unwrap());
        assert!(!store.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn zadd_capped_keeps_only_the_newest_entries() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .zadd_capped("hist", &format!("entry-{i}"), i as f64, 3, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let members = store.zrevrange("hist", 0).await.unwrap();
        assert_eq!(members, vec!["entry-4", "entry-3", "entry-2"]);
    }
}
