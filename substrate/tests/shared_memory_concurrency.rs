//! Two writers racing on `expected_version` against the same key: exactly
//! one succeeds, the loser sees the version that actually won.


use std::collections::HashMap;

use substrate::{GetRequest, Namespace, PutRequest, SharedMemoryStore, SubstrateError};

fn put(ns: Namespace, key: &str, value: &[u8], actor: &str, expected: Option<u64>) -> PutRequest {
    PutRequest {
        namespace: ns,
        key: key.to_string(),
        value: value.to_vec(),
        expected_version: expected,
        agent_id: None,
        actor: actor.to_string(),
        metadata: HashMap::new(),
        compress: false,
    }
}

#[tokio::test]
async fn second_writer_wins_third_sees_version_conflict() {
    let store = SharedMemoryStore::new();

    let v1 = store.put(put(Namespace::Global, "x", b"v1", "a", None)).await.unwrap();
    assert_eq!(v1.version, 1);

    let v2 = store
        .put(put(Namespace::Global, "x", b"v2", "b", Some(1)))
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let err = store
        .put(put(Namespace::Global, "x", b"v3", "c", Some(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubstrateError::VersionConflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));

    let current = store
        .get(GetRequest {
            namespace: Namespace::Global,
            key: "x".into(),
            agent_id: None,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.value, b"v2");
    assert_eq!(current.version, 2);
    assert_eq!(current.updated_by, "b");
}
