//! Coordination store adapter: the thin async interface every other
//! component (lock, registry, record store) builds on top of. Kept
//! deliberately primitive — strings, sets, counters, two atomic scripts —
//! so it stays object-safe and swappable (`redis` in production, an
//! in-memory fake in tests).

mod memory;
mod redis_backend;

pub use memory::InMemoryStore;
pub use redis_backend::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Primitive operations the rest of this crate needs from a Redis-class
/// store. Every write that must be atomic across readers is expressed here
/// as a single method rather than composed from smaller ones.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Fetch the raw string value at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally set `key` to `value` with the given TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// `SET key value NX EX ttl` — true if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete zero or more keys, returning the number actually removed.
    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Refresh `key`'s TTL without touching its value. Returns false if the
    /// key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Atomically delete `key` iff its current value equals `expected`.
    /// This is the owner-fenced release primitive the distributed lock
    /// depends on for safety.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Atomically refresh `key`'s TTL iff its current value equals
    /// `expected`. The owner-fenced renewal primitive.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    /// Append `(score, member)` to a sorted set, trimming to the lowest
    /// `cap` members by score once the insert is done. Used for the
    /// capped execution-history index.
    async fn zadd_capped(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Members of a sorted set, highest score first, newest-first.
    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;
}

/// JSON convenience layered on top of [`CoordinationStore`]'s raw string
/// operations. A blanket impl so it's available on any `dyn
/// CoordinationStore` without widening the core trait's object-safety
/// requirements.
#[async_trait]
pub trait CoordinationStoreJsonExt: CoordinationStore {
    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }
}

impl<S: CoordinationStore + ?Sized> CoordinationStoreJsonExt for S {}
