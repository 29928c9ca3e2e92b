//! Idempotency Ledger.
//!
//! Given a caller-chosen `key` and a thunk `F`, [`IdempotencyLedger::run`]
//! guarantees `F` executes at most once across all concurrent and
//! sequential callers sharing `key` while the ledger record exists, and
//! that every caller observes the same outcome. This is the building block
//! every forward SAGA step in `cloudflow-orchestrator` is wrapped in, and
//! what `cloudflow-inventory`'s `reserve` uses to make re-invocation on
//! retry a no-op.
//!
//! Plays the same composition role for this workspace that the teacher's
//! `ledger.run(key, f)` design note (replacing dynamic decorator wrapping
//! with an explicit keyed thunk) describes: an explicit function taking a
//! closure, rather than a generic `Effect`/`Store` engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use cloudflow_store::{Record, RecordKey, RecordStore, RecordStoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Caller-supplied classification of whether an operation error may be
/// retried by a later invocation of the same key, or is terminal.
///
/// `cloudflow_core::CloudFlowError::is_retryable` is the classification
/// used throughout this workspace; this trait exists so the ledger itself
/// stays decoupled from that one error type.
pub trait Classify {
    /// Returns `true` if a later caller using the same key should be
    /// allowed to re-attempt the operation.
    fn is_retryable(&self) -> bool;
}

impl Classify for cloudflow_core::CloudFlowError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }
}

/// Errors surfaced by [`IdempotencyLedger::run`].
#[derive(Error, Debug)]
pub enum LedgerError<E> {
    /// The thunk ran (on this call or a previous one) and failed. Carries
    /// the thunk's own error, propagated transparently.
    #[error("operation failed: {0}")]
    Operation(E),

    /// Another invocation is `IN_PROGRESS` and has not exceeded
    /// `in_progress_timeout`. The caller's responsibility is to back off
    /// and retry (`spec.md` §4.2 step 3).
    #[error("conflicting in-progress operation, retry after {retry_after:?}")]
    InProgressConflict {
        /// Suggested minimum backoff before retrying.
        retry_after: Duration,
    },

    /// The underlying `RecordStore` failed.
    #[error(transparent)]
    Store(#[from] RecordStoreError),

    /// A stored ledger record could not be deserialized into the expected
    /// shape. This indicates a schema mismatch between writer and reader
    /// and is never expected in a correctly wired deployment.
    #[error("corrupt ledger record at {key}: {details}")]
    Corrupt {
        /// The offending key.
        key: RecordKey,
        /// What was wrong with the stored value.
        details: String,
    },
}

/// Tunable parameters for [`IdempotencyLedger`].
#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    /// How long an `IN_PROGRESS` record may go unresolved before another
    /// caller is allowed to assume the original owner crashed and reclaim
    /// it (`spec.md` §4.2 step 3, Open Question (a)). Defaults to 10s: 2x
    /// the largest configured per-step timeout in the orchestrator's
    /// policy table (the charge step's 5s).
    pub in_progress_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            in_progress_timeout: Duration::from_secs(10),
        }
    }
}

impl LedgerConfig {
    /// Builds a config with an explicit `in_progress_timeout`.
    #[must_use]
    pub const fn new(in_progress_timeout: Duration) -> Self {
        Self { in_progress_timeout }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum LedgerState {
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerRecord {
    state: LedgerState,
    owner: String,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

/// At-most-once execution of a keyed logical operation, backed by a shared
/// [`RecordStore`] (`spec.md` §4.2).
pub struct IdempotencyLedger<S> {
    store: Arc<S>,
    config: LedgerConfig,
}

impl<S: RecordStore> IdempotencyLedger<S> {
    /// Builds a ledger over `store` with `config`.
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Runs `f` under `key`, guaranteeing at-most-once execution within the
    /// record's `ttl` (`spec.md` §4.2).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Operation`] if `f` itself failed (on this call
    /// or a prior one whose outcome is replayed), [`LedgerError::InProgressConflict`]
    /// if another invocation is in flight and has not timed out, or
    /// [`LedgerError::Store`]/[`LedgerError::Corrupt`] on infrastructure
    /// failure.
    pub async fn run<T, E, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Result<T, LedgerError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned + Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let record_key = RecordKey::new(key);
        let owner = uuid::Uuid::new_v4().to_string();

        match self.try_claim(&record_key, &owner, ttl).await? {
            Claim::Won => self.execute(&record_key, 1, f).await,
            Claim::Existing(record, record_version) => self.resolve_existing(&record_key, ttl, record, record_version, f).await,
        }
    }

    async fn try_claim<E>(&self, key: &RecordKey, owner: &str, ttl: Duration) -> Result<Claim, LedgerError<E>> {
        let value = json!({
            "state": LedgerState::InProgress,
            "owner": owner,
            "created_at": Utc::now(),
        });

        match self.store.put_if_absent(key.clone(), value, Some(ttl)).await {
            Ok(_) => Ok(Claim::Won),
            Err(RecordStoreError::Conflict(_)) => {
                let (record, record_version) = self.read_record(key).await?;
                Ok(Claim::Existing(record, record_version))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `f` and persists its outcome, CAS-guarded by `expected_version`
    /// — the backing store's own record version at the moment this call
    /// claimed (or reclaimed) ownership, not a hardcoded constant: a
    /// reclaim on the stale-owner path (`resolve_existing`) already
    /// advanced the store version past 1 before `execute` ever runs.
    async fn execute<T, E, F, Fut>(&self, key: &RecordKey, expected_version: u64, f: F) -> Result<T, LedgerError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned + Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match f().await {
            Ok(result) => {
                let result_json = serde_json::to_value(&result)
                    .map_err(|e| LedgerError::Corrupt { key: key.clone(), details: e.to_string() })?;
                let value = json!({
                    "state": LedgerState::Done,
                    "owner": "",
                    "created_at": Utc::now(),
                    "result": result_json,
                });
                self.store.compare_and_set(key.clone(), expected_version, value).await?;
                tracing::info!(key = %key, "idempotency ledger: operation completed");
                metrics::counter!("idempotency.done").increment(1);
                Ok(result)
            }
            Err(error) => {
                if error.is_retryable() {
                    self.store.delete(key.clone()).await?;
                    tracing::warn!(key = %key, "idempotency ledger: retryable failure, record cleared");
                    metrics::counter!("idempotency.retryable_failure").increment(1);
                } else {
                    let error_json = serde_json::to_value(&error)
                        .map_err(|e| LedgerError::Corrupt { key: key.clone(), details: e.to_string() })?;
                    let value = json!({
                        "state": LedgerState::Failed,
                        "owner": "",
                        "created_at": Utc::now(),
                        "error": error_json,
                    });
                    self.store.compare_and_set(key.clone(), expected_version, value).await?;
                    tracing::warn!(key = %key, "idempotency ledger: non-retryable failure recorded");
                    metrics::counter!("idempotency.failed").increment(1);
                }
                Err(LedgerError::Operation(error))
            }
        }
    }

    async fn resolve_existing<T, E, F, Fut>(
        &self,
        key: &RecordKey,
        ttl: Duration,
        mut record: LedgerRecord,
        mut record_version: u64,
        f: F,
    ) -> Result<T, LedgerError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned + Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            match record.state {
                LedgerState::Done => {
                    let result = record
                        .result
                        .ok_or_else(|| LedgerError::Corrupt { key: key.clone(), details: "DONE record missing result".into() })?;
                    return serde_json::from_value(result)
                        .map_err(|e| LedgerError::Corrupt { key: key.clone(), details: e.to_string() });
                }
                LedgerState::Failed => {
                    let error = record
                        .error
                        .ok_or_else(|| LedgerError::Corrupt { key: key.clone(), details: "FAILED record missing error".into() })?;
                    let error: E = serde_json::from_value(error)
                        .map_err(|e| LedgerError::Corrupt { key: key.clone(), details: e.to_string() })?;
                    return Err(LedgerError::Operation(error));
                }
                LedgerState::InProgress => {
                    let age = Utc::now().signed_duration_since(record.created_at);
                    let age = age.to_std().unwrap_or(Duration::ZERO);

                    if age < self.config.in_progress_timeout {
                        let retry_after = self.config.in_progress_timeout.saturating_sub(age);
                        return Err(LedgerError::InProgressConflict { retry_after });
                    }

                    tracing::warn!(key = %key, "idempotency ledger: reclaiming stale in-progress record");
                    let new_owner = uuid::Uuid::new_v4().to_string();
                    let value = json!({
                        "state": LedgerState::InProgress,
                        "owner": new_owner,
                        "created_at": Utc::now(),
                    });

                    match self.store.compare_and_set(key.clone(), record_version, value).await {
                        Ok(reclaimed) => return self.execute(key, reclaimed.version, f).await,
                        Err(RecordStoreError::VersionMismatch { .. }) => {
                            (record, record_version) = self.read_record(key).await?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    async fn read_record<E>(&self, key: &RecordKey) -> Result<(LedgerRecord, u64), LedgerError<E>> {
        let record: Record = self
            .store
            .get(key.clone(), cloudflow_store::Consistency::Strong)
            .await?
            .ok_or_else(|| LedgerError::Corrupt { key: key.clone(), details: "record vanished after CONFLICT".into() })?;
        let record_version = record.version;

        let ledger_record = serde_json::from_value(record.value)
            .map_err(|e| LedgerError::Corrupt { key: key.clone(), details: e.to_string() })?;
        Ok((ledger_record, record_version))
    }
}

enum Claim {
    Won,
    Existing(LedgerRecord, u64),
}

impl<E> From<RecordStoreError> for LedgerError<E> {
    fn from(e: RecordStoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudflow_store_memory::InMemoryRecordStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Retryable;

    impl Classify for Retryable {
        fn is_retryable(&self) -> bool {
            true
        }
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct NonRetryable(String);

    impl Classify for NonRetryable {
        fn is_retryable(&self) -> bool {
            false
        }
    }

    fn ledger() -> IdempotencyLedger<InMemoryRecordStore> {
        IdempotencyLedger::new(Arc::new(InMemoryRecordStore::new()), LedgerConfig::default())
    }

    #[tokio::test]
    async fn first_call_executes_and_second_replays() {
        let ledger = ledger();
        let calls = Arc::new(AtomicUsize::new(0));

        let run = || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Retryable>(42)
            }
        };

        let first: i32 = ledger.run("k1", Duration::from_secs(60), run).await.unwrap();
        let second: i32 = ledger.run("k1", Duration::from_secs(60), run).await.unwrap();

        assert_eq!(first, 42);
        assert_eq!(second, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_failure_clears_record_for_next_attempt() {
        let ledger = ledger();

        let fail_once = || async { Err::<i32, _>(Retryable) };
        let err = ledger.run("k1", Duration::from_secs(60), fail_once).await.unwrap_err();
        assert!(matches!(err, LedgerError::Operation(Retryable)));

        let succeed = || async { Ok::<_, Retryable>(7) };
        let value = ledger.run("k1", Duration::from_secs(60), succeed).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn non_retryable_failure_replays_same_error() {
        let ledger = ledger();

        let fail = || async { Err::<i32, _>(NonRetryable("card_declined".into())) };
        let first = ledger.run("k1", Duration::from_secs(60), fail).await.unwrap_err();
        let second = ledger.run("k1", Duration::from_secs(60), fail).await.unwrap_err();

        assert!(matches!(first, LedgerError::Operation(NonRetryable(ref r)) if r == "card_declined"));
        assert!(matches!(second, LedgerError::Operation(NonRetryable(ref r)) if r == "card_declined"));
    }

    #[tokio::test]
    async fn in_progress_within_timeout_is_conflict() {
        let store = Arc::new(InMemoryRecordStore::new());
        let key = RecordKey::new("k1");
        store
            .put_if_absent(
                key.clone(),
                json!({"state": "IN_PROGRESS", "owner": "other", "created_at": Utc::now()}),
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let ledger = IdempotencyLedger::new(store, LedgerConfig::default());
        let never_runs = || async { Ok::<_, Retryable>(1) };
        let err = ledger.run("k1", Duration::from_secs(60), never_runs).await.unwrap_err();
        assert!(matches!(err, LedgerError::InProgressConflict { .. }));
    }

    #[tokio::test]
    async fn stale_in_progress_record_is_reclaimed() {
        let store = Arc::new(InMemoryRecordStore::new());
        let key = RecordKey::new("k1");
        let stale_created_at = Utc::now() - chrono::Duration::seconds(30);
        store
            .put_if_absent(
                key.clone(),
                json!({"state": "IN_PROGRESS", "owner": "dead", "created_at": stale_created_at}),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        let ledger = IdempotencyLedger::new(store, LedgerConfig::new(Duration::from_millis(1)));
        let run = || async { Ok::<_, Retryable>(99) };
        let value = ledger.run("k1", Duration::from_secs(60), run).await.unwrap();
        assert_eq!(value, 99);
    }
}
