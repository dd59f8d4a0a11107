//! Integration tests against a real Redis, started via `testcontainers`.
//! Exercises the behaviour `InMemoryStore`'s unit tests can't: actual
//! wall-clock TTL expiry and the Lua scripts running against the real
//! server instead of the in-process fake.

use cronfleet::{CoordinationStore, RedisStore};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;

async fn store() -> (RedisStore, testcontainers::ContainerAsync<Redis>) {
    let container = Redis::default()
        .start()
        .await
        .expect("failed to start redis container");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("container port");
    let store = RedisStore::connect(&format!("redis://{host}:{port}"))
        .await
        .expect("failed to connect to redis container");
    (store, container)
}

#[tokio::test]
async fn set_if_absent_is_atomic_against_a_live_key() {
    let (store, _container) = store().await;
    assert!(store
        .set_if_absent("lock:a", "owner-1", Duration::from_secs(10))
        .await
        .unwrap());
    assert!(!store
        .set_if_absent("lock:a", "owner-2", Duration::from_secs(10))
        .await
        .unwrap());
}

#[tokio::test]
async fn keys_expire_on_their_own_after_the_ttl_elapses() {
    let (store, _container) = store().await;
    store
        .set("transient", "value", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(store.exists("transient").await.unwrap());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!store.exists("transient").await.unwrap());
}

#[tokio::test]
async fn compare_and_delete_only_succeeds_for_the_recorded_owner() {
    let (store, _container) = store().await;
    store
        .set("lock:b", "owner-1", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(!store.compare_and_delete("lock:b", "owner-2").await.unwrap());
    assert!(store.compare_and_delete("lock:b", "owner-1").await.unwrap());
    assert!(!store.exists("lock:b").await.unwrap());
}

#[tokio::test]
async fn zadd_capped_trims_to_the_newest_members_on_the_real_server() {
    let (store, _container) = store().await;
    for i in 0..5 {
        store
            .zadd_capped("history:task", &format!("run-{i}"), i as f64, 3, Duration::from_secs(60))
            .await
            .unwrap();
    }
    let members = store.zrevrange("history:task", 0).await.unwrap();
    assert_eq!(members, vec!["run-4", "run-3", "run-2"]);
}
