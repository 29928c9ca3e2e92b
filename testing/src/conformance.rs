//! `RecordStore` conformance suite (`spec.md` §4.1).
//!
//! A shared set of assertions any [`RecordStore`] implementation must
//! satisfy, called from both `cloudflow-store-memory`'s and
//! `cloudflow-store-postgres`'s own `#[tokio::test]` functions so the two
//! backends are held to the identical contract instead of each hand-rolling
//! its own ad hoc coverage.

use cloudflow_store::{AddGuard, Consistency, RecordKey, RecordStore, RecordStoreError};
use serde_json::json;

/// `put_if_absent` succeeds once and conflicts on the second attempt at
/// the same key.
///
/// # Panics
///
/// Panics (via `assert!`) if the store violates the contract.
pub async fn put_if_absent_then_conflict(store: &impl RecordStore) {
    let key = RecordKey::new("conformance:put_if_absent");
    let first = store.put_if_absent(key.clone(), json!({"n": 1}), None).await;
    assert!(first.is_ok());

    let second = store.put_if_absent(key, json!({"n": 2}), None).await;
    assert!(matches!(second, Err(RecordStoreError::Conflict(_))));
}

/// `compare_and_set` succeeds against the current version and fails with
/// `VersionMismatch` against a stale one.
///
/// # Panics
///
/// Panics (via `assert!`) if the store violates the contract.
pub async fn compare_and_set_rejects_stale_version(store: &impl RecordStore) {
    let key = RecordKey::new("conformance:cas");
    let created = store.put_if_absent(key.clone(), json!({"n": 1}), None).await.unwrap();
    assert_eq!(created.version, 1);

    let updated = store.compare_and_set(key.clone(), 1, json!({"n": 2})).await.unwrap();
    assert_eq!(updated.version, 2);

    let stale = store.compare_and_set(key, 1, json!({"n": 3})).await;
    assert!(matches!(stale, Err(RecordStoreError::VersionMismatch { expected: 1, actual: 2, .. })));
}

/// A guarded `add` that would violate `min_result` fails with
/// `GuardFailed` and leaves the field unchanged.
///
/// # Panics
///
/// Panics (via `assert!`) if the store violates the contract.
pub async fn add_guard_prevents_negative(store: &impl RecordStore) {
    let key = RecordKey::new("conformance:add_guard");
    store.put_if_absent(key.clone(), json!({"available": 5}), None).await.unwrap();

    let decremented = store.add(key.clone(), "available", -3, Some(AddGuard::non_negative())).await.unwrap();
    assert_eq!(decremented, 2);

    let rejected = store.add(key.clone(), "available", -3, Some(AddGuard::non_negative())).await;
    assert!(matches!(rejected, Err(RecordStoreError::GuardFailed(_))));

    let record = store.get(key, Consistency::Strong).await.unwrap().unwrap();
    assert_eq!(record.value["available"], 2);
}

/// `add` against a key with no prior record treats the field as starting
/// at zero.
///
/// # Panics
///
/// Panics (via `assert!`) if the store violates the contract.
pub async fn add_without_prior_record_starts_at_zero(store: &impl RecordStore) {
    let key = RecordKey::new("conformance:add_fresh");
    let result = store.add(key, "available", 5, None).await.unwrap();
    assert_eq!(result, 5);
}

/// `delete` is idempotent: deleting twice, or deleting a key that never
/// existed, both succeed.
///
/// # Panics
///
/// Panics (via `assert!`) if the store violates the contract.
pub async fn delete_is_idempotent(store: &impl RecordStore) {
    let key = RecordKey::new("conformance:delete");
    store.put_if_absent(key.clone(), json!({}), None).await.unwrap();

    store.delete(key.clone()).await.unwrap();
    store.delete(key.clone()).await.unwrap();

    assert!(store.get(key, Consistency::Strong).await.unwrap().is_none());
}

/// Runs every conformance check against `store` in sequence. Each check
/// uses its own key namespace so they may share one store instance.
///
/// # Panics
///
/// Panics if any individual check fails.
pub async fn run_all(store: &impl RecordStore) {
    put_if_absent_then_conflict(store).await;
    compare_and_set_rejects_stale_version(store).await;
    add_guard_prevents_negative(store).await;
    add_without_prior_record_starts_at_zero(store).await;
    delete_is_idempotent(store).await;
}
