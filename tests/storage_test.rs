//! Tests for cache partitions: eviction, expiry and disk persistence.

use std::sync::Arc;
use std::time::Duration;

use muninn::ManualClock;
use muninn::worker::{
    CacheRecord, CacheStorage, InterceptedResponse, StatusCode, StoredBody,
};
use serde_json::{Value, json};

fn record(key: &str, body: Value) -> CacheRecord {
    CacheRecord::from_response(key, &InterceptedResponse::json(StatusCode::OK, &body))
}

// ============================================================================
// Eviction
// ============================================================================

#[test]
fn exceeding_max_entries_evicts_oldest() {
    let storage = CacheStorage::in_memory(Arc::new(ManualClock::new(1_000)));
    let partition = storage.open_partition("graphql-cache-v1", 3, Duration::from_secs(60));

    for i in 0..5 {
        partition.put(record(&format!("k{i}"), json!(i)));
    }

    assert_eq!(partition.len(), 3);
    assert_eq!(partition.keys(), vec!["k2", "k3", "k4"]);
    assert!(partition.get("k0").is_none());
    assert!(partition.get("k1").is_none());
}

#[test]
fn reinserted_key_is_evicted_last() {
    let storage = CacheStorage::in_memory(Arc::new(ManualClock::new(1_000)));
    let partition = storage.open_partition("p", 2, Duration::from_secs(60));

    partition.put(record("a", json!(1)));
    partition.put(record("b", json!(2)));
    partition.put(record("a", json!(3)));
    partition.put(record("c", json!(4)));

    assert_eq!(partition.keys(), vec!["a", "c"]);
}

#[test]
fn expired_record_is_a_miss() {
    let clock = Arc::new(ManualClock::new(1_000));
    let storage = CacheStorage::in_memory(clock.clone());
    let partition = storage.open_partition("p", 10, Duration::from_secs(60));
    partition.put(record("a", json!(1)));

    clock.advance(Duration::from_secs(60));
    assert!(partition.get("a").is_some());

    clock.advance(Duration::from_millis(1));
    assert!(partition.get("a").is_none());
    assert!(partition.is_empty());
}

#[test]
fn put_purges_expired_records() {
    let clock = Arc::new(ManualClock::new(1_000));
    let storage = CacheStorage::in_memory(clock.clone());
    let partition = storage.open_partition("p", 10, Duration::from_secs(60));
    partition.put(record("old", json!(1)));

    clock.advance(Duration::from_secs(61));
    partition.put(record("new", json!(2)));

    assert_eq!(partition.keys(), vec!["new"]);
}

#[test]
fn sweep_counts_removed_records() {
    let clock = Arc::new(ManualClock::new(1_000));
    let storage = CacheStorage::in_memory(clock.clone());
    let a = storage.open_partition("a", 10, Duration::from_secs(10));
    let b = storage.open_partition("b", 10, Duration::from_secs(100));
    a.put(record("1", json!(1)));
    a.put(record("2", json!(2)));
    b.put(record("3", json!(3)));

    clock.advance(Duration::from_secs(11));
    assert_eq!(storage.sweep(), 2);
    assert!(a.is_empty());
    assert_eq!(b.len(), 1);
}

#[test]
fn delete_removes_single_record() {
    let storage = CacheStorage::in_memory(Arc::new(ManualClock::new(1_000)));
    let partition = storage.open_partition("p", 10, Duration::from_secs(60));
    partition.put(record("a", json!(1)));
    assert!(partition.delete("a"));
    assert!(!partition.delete("a"));
    assert!(partition.is_empty());
}

// ============================================================================
// Disk persistence
// ============================================================================

#[test]
fn records_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    {
        let storage = CacheStorage::open(dir.path(), clock.clone()).unwrap();
        let partition = storage.open_partition("graphql-cache-v1", 10, Duration::from_secs(60));
        partition.put(record("a", json!({"data": {"id": 1}})));
        partition.put(record("b", json!({"data": {"id": 2}})));
    }
    assert!(dir.path().join("graphql-cache-v1.json").exists());

    let storage = CacheStorage::open(dir.path(), clock).unwrap();
    let partition = storage.open_partition("graphql-cache-v1", 10, Duration::from_secs(60));
    assert_eq!(partition.keys(), vec!["a", "b"]);
    let a = partition.get("a").unwrap();
    assert_eq!(a.body, StoredBody::Json(json!({"data": {"id": 1}})));
    assert_eq!(a.inserted_at, 1_000);
}

#[test]
fn corrupt_partition_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("graphql-cache-v1.json"), "this is not valid json").unwrap();

    let storage = CacheStorage::open(dir.path(), Arc::new(ManualClock::new(1_000))).unwrap();
    let partition = storage.open_partition("graphql-cache-v1", 10, Duration::from_secs(60));
    assert!(partition.is_empty());

    // Still writable; the next put replaces the corrupt file.
    partition.put(record("a", json!(1)));
    let reopened = CacheStorage::open(dir.path(), Arc::new(ManualClock::new(1_000))).unwrap();
    assert_eq!(
        reopened
            .open_partition("graphql-cache-v1", 10, Duration::from_secs(60))
            .len(),
        1
    );
}

#[test]
fn keys_include_partitions_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("images-v0.json"), "{}").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let storage = CacheStorage::open(dir.path(), Arc::new(ManualClock::new(1_000))).unwrap();
    storage.open_partition("images-v1", 10, Duration::from_secs(60));

    assert_eq!(storage.keys(), vec!["images-v0", "images-v1"]);
}

#[test]
fn delete_partition_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let storage = CacheStorage::open(dir.path(), Arc::new(ManualClock::new(1_000))).unwrap();
    let partition = storage.open_partition("images-v1", 10, Duration::from_secs(60));
    partition.put(record("a", json!(1)));
    let path = dir.path().join("images-v1.json");
    assert!(path.exists());

    assert!(storage.delete("images-v1"));
    assert!(!path.exists());
    assert!(storage.partition("images-v1").is_none());
    assert!(storage.keys().is_empty());
}

#[tokio::test]
async fn writes_inside_runtime_reach_disk_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let storage = CacheStorage::open(dir.path(), clock.clone()).unwrap();
    let partition = storage.open_partition("images-v1", 10, Duration::from_secs(60));
    for i in 0..20u8 {
        partition.put(CacheRecord {
            key: format!("GET http://app.local/{i}.png"),
            status: 200,
            headers: vec![("content-type".to_string(), "image/png".to_string())],
            body: StoredBody::Binary(vec![i; 64]),
            inserted_at: 0,
        });
    }
    storage.flush().await;

    let reopened = CacheStorage::open(dir.path(), clock).unwrap();
    let partition = reopened.open_partition("images-v1", 10, Duration::from_secs(60));
    assert_eq!(partition.len(), 10);
    let last = partition.get("GET http://app.local/19.png").unwrap();
    assert_eq!(last.body, StoredBody::Binary(vec![19; 64]));
}

#[tokio::test]
async fn deleted_partition_is_not_rewritten_by_pending_writes() {
    let dir = tempfile::tempdir().unwrap();
    let storage = CacheStorage::open(dir.path(), Arc::new(ManualClock::new(1_000))).unwrap();
    let partition = storage.open_partition("graphql-cache-v1", 10, Duration::from_secs(60));
    for i in 0..5 {
        partition.put(record(&format!("k{i}"), json!(i)));
    }

    storage.delete("graphql-cache-v1");
    partition.flush().await;

    assert!(!dir.path().join("graphql-cache-v1.json").exists());
}

#[test]
fn open_creates_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("deep").join("cache");
    CacheStorage::open(&nested, Arc::new(ManualClock::new(1_000))).unwrap();
    assert!(nested.is_dir());
}
