//! In-memory `RecordStore` implementation.
//!
//! Plays the same role for `RecordStore` that the teacher's
//! `testing::mocks::InMemoryEventStore` plays for `EventStore`: a fast,
//! deterministic backend for unit tests and for running the workspace
//! locally without a database (`DATABASE_URL` unset — see
//! `cloudflow_core::config::StoreConfig`).
//!
//! Concurrency is per-key, exactly as `spec.md` §5 requires of every
//! backend: a single `std::sync::Mutex` guards the whole map, but every
//! critical section is a plain in-memory comparison with no `.await`
//! inside it, so contention is negligible even though the lock is
//! process-wide.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use cloudflow_store::{AddGuard, Consistency, Record, RecordKey, RecordStore, RecordStoreError};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// In-memory, single-process `RecordStore`.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<RecordKey, Record>>,
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the record at `key` has expired as of `now`.
    fn is_expired(record: &Record, now: chrono::DateTime<Utc>) -> bool {
        record.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

impl RecordStore for InMemoryRecordStore {
    fn put_if_absent(
        &self,
        key: RecordKey,
        value: Value,
        ttl: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<Record, RecordStoreError>> + Send + '_>> {
        Box::pin(async move {
            let now = Utc::now();
            let expires_at = ttl.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| now + d);

            let mut records = self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(existing) = records.get(&key) {
                if !Self::is_expired(existing, now) {
                    return Err(RecordStoreError::Conflict(key));
                }
            }

            let record = Record::new(value, expires_at);
            records.insert(key, record.clone());
            Ok(record)
        })
    }

    fn compare_and_set(
        &self,
        key: RecordKey,
        expected_version: u64,
        new_value: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Record, RecordStoreError>> + Send + '_>> {
        Box::pin(async move {
            let now = Utc::now();
            let mut records = self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

            let current = records
                .get(&key)
                .filter(|r| !Self::is_expired(r, now))
                .ok_or_else(|| RecordStoreError::NotFound(key.clone()))?;

            if current.version != expected_version {
                return Err(RecordStoreError::VersionMismatch {
                    key,
                    expected: expected_version,
                    actual: current.version,
                });
            }

            let updated = Record {
                version: current.version + 1,
                value: new_value,
                expires_at: current.expires_at,
            };
            records.insert(key, updated.clone());
            Ok(updated)
        })
    }

    fn add(
        &self,
        key: RecordKey,
        field: &'static str,
        delta: i64,
        guard: Option<AddGuard>,
    ) -> Pin<Box<dyn Future<Output = Result<i64, RecordStoreError>> + Send + '_>> {
        Box::pin(async move {
            let now = Utc::now();
            let mut records = self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

            let mut fields = match records.get(&key).filter(|r| !Self::is_expired(r, now)) {
                Some(r) => match r.value.as_object().cloned() {
                    Some(map) => map,
                    None => serde_json::Map::new(),
                },
                None => serde_json::Map::new(),
            };

            let current: i64 = fields.get(field).and_then(Value::as_i64).unwrap_or(0);
            let updated = current + delta;

            if let Some(guard) = guard {
                if updated < guard.min_result {
                    return Err(RecordStoreError::GuardFailed(key));
                }
            }

            fields.insert(field.to_string(), Value::from(updated));
            let version = records.get(&key).map_or(1, |r| r.version);
            let expires_at = records.get(&key).and_then(|r| r.expires_at);
            records.insert(
                key,
                Record {
                    version,
                    value: Value::Object(fields),
                    expires_at,
                },
            );

            Ok(updated)
        })
    }

    fn get(
        &self,
        key: RecordKey,
        _consistency: Consistency,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Record>, RecordStoreError>> + Send + '_>> {
        Box::pin(async move {
            let now = Utc::now();
            let records = self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            Ok(records.get(&key).filter(|r| !Self::is_expired(r, now)).cloned())
        })
    }

    fn delete(
        &self,
        key: RecordKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), RecordStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut records = self.records.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            records.remove(&key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_if_absent_then_conflict() {
        let store = InMemoryRecordStore::new();
        let key = RecordKey::new("k1");

        let record = store.put_if_absent(key.clone(), json!({"a": 1}), None).await.unwrap();
        assert_eq!(record.version, 1);

        let err = store.put_if_absent(key, json!({"a": 2}), None).await.unwrap_err();
        assert!(matches!(err, RecordStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_version() {
        let store = InMemoryRecordStore::new();
        let key = RecordKey::new("k1");
        store.put_if_absent(key.clone(), json!({"a": 1}), None).await.unwrap();

        let updated = store.compare_and_set(key.clone(), 1, json!({"a": 2})).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = store.compare_and_set(key, 1, json!({"a": 3})).await.unwrap_err();
        assert!(matches!(err, RecordStoreError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn add_guard_refuses_negative_result() {
        let store = InMemoryRecordStore::new();
        let key = RecordKey::new("product:KEYBD-01");
        store.put_if_absent(key.clone(), json!({"available": 5}), None).await.unwrap();

        let err = store
            .add(key.clone(), "available", -6, Some(AddGuard::non_negative()))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordStoreError::GuardFailed(_)));

        let value = store.add(key, "available", -5, Some(AddGuard::non_negative())).await.unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn add_without_prior_record_starts_at_zero() {
        let store = InMemoryRecordStore::new();
        let key = RecordKey::new("product:NEW-1");
        let value = store.add(key, "available", 10, None).await.unwrap();
        assert_eq!(value, 10);
    }

    #[tokio::test]
    async fn expired_record_is_treated_as_absent() {
        let store = InMemoryRecordStore::new();
        let key = RecordKey::new("k1");
        store
            .put_if_absent(key.clone(), json!({"a": 1}), Some(Duration::from_millis(1)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let read = store.get(key.clone(), Consistency::Strong).await.unwrap();
        assert!(read.is_none());

        // put_if_absent succeeds again since the old record is expired.
        let record = store.put_if_absent(key, json!({"a": 2}), None).await.unwrap();
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryRecordStore::new();
        let key = RecordKey::new("k1");
        store.delete(key.clone()).await.unwrap();
        store.put_if_absent(key.clone(), json!({"a": 1}), None).await.unwrap();
        store.delete(key.clone()).await.unwrap();
        store.delete(key).await.unwrap();
    }

    #[tokio::test]
    async fn satisfies_shared_conformance_suite() {
        let store = InMemoryRecordStore::new();
        cloudflow_testing::conformance::run_all(&store).await;
    }
}
