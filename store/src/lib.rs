//! # CloudFlow Record Store
//!
//! The abstract foundation every other component in this workspace is a
//! client of (`spec.md` §4.1): a strongly-consistent keyed store offering
//! `put_if_absent`, `compare_and_set`, a guarded atomic `add`, `get`, and
//! `delete`. Nothing above this crate depends on a concrete backend —
//! `cloudflow-store-memory` and `cloudflow-store-postgres` are the only two
//! crates that do.
//!
//! # Dyn compatibility
//!
//! Mirroring the teacher's `EventStore` trait
//! (`composable-rust-core::event_store::EventStore`), every method returns
//! `Pin<Box<dyn Future<...> + Send + '_>>` instead of using `async fn`, so
//! the trait stays object-safe and callers can hold an `Arc<dyn
//! RecordStore>` without knowing the concrete backend.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod key;

pub use key::RecordKey;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a `RecordStore` implementation (`spec.md` §4.1
/// "Failure semantics").
#[derive(Error, Debug, Clone)]
pub enum RecordStoreError {
    /// `put_if_absent` found an existing record at this key.
    #[error("record already exists at key {0}")]
    Conflict(RecordKey),

    /// `compare_and_set` found a version other than the one expected.
    #[error("version mismatch at key {key}: expected {expected}, found {actual}")]
    VersionMismatch {
        /// The key being written.
        key: RecordKey,
        /// The version the caller expected.
        expected: u64,
        /// The version actually stored.
        actual: u64,
    },

    /// An `add` guard predicate would have been violated by this write.
    #[error("guard failed at key {0}")]
    GuardFailed(RecordKey),

    /// The record does not exist.
    #[error("no record at key {0}")]
    NotFound(RecordKey),

    /// Transient infrastructure error. Callers may retry per their own
    /// policy; the store itself never retries blindly (`spec.md` §4.1).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Read consistency level for `RecordStore::get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Guarantees read-your-writes across all clients (`spec.md` §4.1).
    Strong,
    /// May return a stale value; cheaper where staleness is acceptable
    /// (e.g. `spec.md` §4.5 `current(order_id)` by default).
    Eventual,
}

/// A stored record: a version for optimistic concurrency, an opaque JSON
/// value, and an optional expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Monotonically increasing version, incremented by every successful
    /// `compare_and_set`.
    pub version: u64,
    /// The record's payload. Components serialize their own domain types
    /// into this; the store itself is schema-agnostic.
    pub value: Value,
    /// Absolute expiry time, if this record carries a TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Constructs a new record at version 1 (the version produced by the
    /// first successful write to a key).
    #[must_use]
    pub const fn new(value: Value, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            version: 1,
            value,
            expires_at,
        }
    }
}

/// Guard predicate for `RecordStore::add`.
///
/// `spec.md` §4.1 describes the guard as "a predicate (`field - delta ≥ 0`)
/// evaluated atomically with the write"; concretely (§4.4) it is used to
/// refuse an inventory decrement that would take `available` negative. This
/// is expressed as a floor on the value *after* `delta` is applied, which is
/// what every current and anticipated caller needs: `current + delta ≥
/// min_result`.
#[derive(Debug, Clone, Copy)]
pub struct AddGuard {
    /// The minimum value the field may hold after the add is applied.
    pub min_result: i64,
}

impl AddGuard {
    /// A guard refusing to let the field go negative — the shape every
    /// caller in this workspace uses.
    #[must_use]
    pub const fn non_negative() -> Self {
        Self { min_result: 0 }
    }
}

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RecordStoreError>> + Send + 'a>>;

/// The Record Store abstraction (`spec.md` §4.1).
///
/// Implementations must be `Send + Sync` for safe use across the
/// concurrent worker pool described in `spec.md` §5.
pub trait RecordStore: Send + Sync {
    /// Writes `value` only if no record currently exists at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::Conflict`] if a record already exists,
    /// or [`RecordStoreError::Unavailable`] on a transient failure.
    fn put_if_absent(
        &self,
        key: RecordKey,
        value: Value,
        ttl: Option<Duration>,
    ) -> StoreFuture<'_, Record>;

    /// Writes `new_value` only if the stored record's version equals
    /// `expected_version`. On success the stored version is incremented.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::VersionMismatch`] if the current version
    /// differs, [`RecordStoreError::NotFound`] if no record exists, or
    /// [`RecordStoreError::Unavailable`] on a transient failure.
    fn compare_and_set(
        &self,
        key: RecordKey,
        expected_version: u64,
        new_value: Value,
    ) -> StoreFuture<'_, Record>;

    /// Atomically adds `delta` to the numeric field `field` on the record
    /// at `key`, optionally refusing the write via `guard`.
    ///
    /// Returns the field's value *after* the add. If no record exists at
    /// `key`, implementations treat the field as starting at `0`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::GuardFailed`] if `guard` would be
    /// violated, or [`RecordStoreError::Unavailable`] on a transient
    /// failure.
    fn add(
        &self,
        key: RecordKey,
        field: &'static str,
        delta: i64,
        guard: Option<AddGuard>,
    ) -> StoreFuture<'_, i64>;

    /// Reads the record at `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::Unavailable`] on a transient failure.
    /// A missing key is `Ok(None)`, not an error.
    fn get(
        &self,
        key: RecordKey,
        consistency: Consistency,
    ) -> StoreFuture<'_, Option<Record>>;

    /// Removes the record at `key`, if any. Idempotent: deleting a
    /// non-existent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::Unavailable`] on a transient failure.
    fn delete(&self, key: RecordKey) -> StoreFuture<'_, ()>;
}
