//! A reference past its TTL must fail `Resolve` with `Expired`, whether or
//! not a GC sweep has had a chance to evict it.


use std::time::Duration;

use substrate::{InMemoryReferenceStore, ReferenceStore, StoreOptions, SubstrateError};

#[tokio::test]
async fn expired_reference_is_unresolvable_after_ttl() {
    let store = InMemoryReferenceStore::new();
    let reference = store
        .store(
            b"short-lived",
            StoreOptions {
                ttl_seconds: 1,
                ..StoreOptions::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let err = store.resolve(&reference.id).await.unwrap_err();
    assert!(matches!(err, SubstrateError::Expired(_)));
}

#[tokio::test]
async fn background_sweep_evicts_expired_reference_from_list() {
    let store = InMemoryReferenceStore::with_gc_interval(Duration::from_millis(50));
    let reference = store
        .store(
            b"swept",
            StoreOptions {
                ttl_seconds: 1,
                ..StoreOptions::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let refs = store.list().await.unwrap();
    assert!(!refs.iter().any(|r| r.id == reference.id));
    let stats = store.stats().await.unwrap();
    assert!(stats.eviction_count >= 1);
}
