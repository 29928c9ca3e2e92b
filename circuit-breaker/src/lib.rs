//! Circuit Breaker Registry.
//!
//! Plays the same role the teacher's `runtime::circuit_breaker::CircuitBreaker`
//! plays — a three-state (`Closed`/`Open`/`HalfOpen`) machine guarding a
//! flaky dependency — but the state lives in the shared [`RecordStore`]
//! instead of an in-process `Arc<RwLock<_>>`, so every worker in the pool
//! observes one truth (`spec.md` §4.3, §5 "Shared resources"). The
//! `CircuitBreakerConfig` builder is kept close to the teacher's; only the
//! storage medium changes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use cloudflow_store::{Consistency, RecordKey, RecordStore, RecordStoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Circuit breaker configuration (`spec.md` §4.3 "Defaults").
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before the circuit opens.
    pub fail_threshold: usize,
    /// Consecutive probe successes in `HalfOpen` before the circuit closes.
    pub success_threshold: usize,
    /// How long the circuit stays `Open` before a probe is allowed.
    pub cooldown: Duration,
    /// How long a `HalfOpen` probe may remain in flight before it is
    /// considered stuck and forgotten.
    pub probe_in_flight_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
            probe_in_flight_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    /// Starts a builder seeded with the spec defaults.
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Sets `fail_threshold`.
    #[must_use]
    pub const fn fail_threshold(mut self, threshold: usize) -> Self {
        self.config.fail_threshold = threshold;
        self
    }

    /// Sets `success_threshold`.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Sets `cooldown`.
    #[must_use]
    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    /// Sets `probe_in_flight_timeout`.
    #[must_use]
    pub const fn probe_in_flight_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_in_flight_timeout = timeout;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub const fn build(self) -> CircuitBreakerConfig {
        self.config
    }
}

/// Circuit breaker state (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until `cooldown` elapses.
    Open,
    /// A single probe call is permitted to test recovery.
    HalfOpen,
}

/// Outcome of an [`CircuitBreakerRegistry::allow`] check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The call may proceed.
    Permit,
    /// The call must not proceed; retry no sooner than `retry_after`.
    Reject {
        /// Suggested minimum backoff before the caller tries again.
        retry_after: Duration,
    },
}

/// Outcome of a dependency call, reported via [`CircuitBreakerRegistry::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call succeeded.
    Success,
    /// The call failed.
    Failure,
}

/// Errors from the registry.
#[derive(Error, Debug)]
pub enum CircuitBreakerError {
    /// The backing store failed. The registry is fail-open for `allow`
    /// (callers receive [`Decision::Permit`] and a warning is logged), but
    /// `record` cannot silently succeed and surfaces the failure.
    #[error(transparent)]
    Store(#[from] RecordStoreError),

    /// A stored circuit record could not be deserialized.
    #[error("corrupt circuit state for {dependency}: {details}")]
    Corrupt {
        /// The dependency whose record was unreadable.
        dependency: String,
        /// What was wrong with the stored value.
        details: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CircuitRecord {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    probe_in_flight_at: Option<DateTime<Utc>>,
}

impl CircuitRecord {
    const fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probe_in_flight_at: None,
        }
    }
}

fn key_for(dependency: &str) -> RecordKey {
    RecordKey::new(format!("circuit:{dependency}"))
}

/// A per-dependency, store-backed circuit breaker (`spec.md` §4.3).
pub struct CircuitBreakerRegistry<S> {
    store: Arc<S>,
    config: CircuitBreakerConfig,
}

impl<S: RecordStore> CircuitBreakerRegistry<S> {
    /// Builds a registry over `store`, applying `config` to every
    /// dependency it guards.
    pub fn new(store: Arc<S>, config: CircuitBreakerConfig) -> Self {
        Self { store, config }
    }

    /// Decides whether a call to `dependency` may proceed, atomically
    /// performing any state transition this check triggers.
    ///
    /// Fail-open: if the store is `UNAVAILABLE`, returns
    /// [`Decision::Permit`] and logs a warning, favoring availability over
    /// perfect enforcement.
    pub async fn allow(&self, dependency: &str) -> Decision {
        match self.try_allow(dependency).await {
            Ok(decision) => decision,
            Err(CircuitBreakerError::Store(RecordStoreError::Unavailable(details))) => {
                tracing::warn!(dependency, %details, "circuit breaker store unavailable, failing open");
                metrics::counter!("circuit_breaker.fail_open", "dependency" => dependency.to_string()).increment(1);
                Decision::Permit
            }
            Err(e) => {
                tracing::error!(dependency, error = %e, "circuit breaker registry error, failing open");
                Decision::Permit
            }
        }
    }

    async fn try_allow(&self, dependency: &str) -> Result<Decision, CircuitBreakerError> {
        let key = key_for(dependency);
        let mut record = self.read_or_init(&key, dependency).await?;

        loop {
            let now = Utc::now();
            match record.state {
                CircuitState::Closed => return Ok(Decision::Permit),
                CircuitState::Open => {
                    let opened_at = record.opened_at.unwrap_or(now);
                    let cooldown_ends = opened_at + chrono_duration(self.config.cooldown);
                    if now < cooldown_ends {
                        let retry_after = (cooldown_ends - now).to_std().unwrap_or(Duration::ZERO);
                        return Ok(Decision::Reject { retry_after });
                    }

                    let next = CircuitRecord {
                        state: CircuitState::HalfOpen,
                        consecutive_failures: 0,
                        consecutive_successes: 0,
                        opened_at: record.opened_at,
                        probe_in_flight_at: None,
                    };
                    match self.cas(&key, dependency, next.clone()).await {
                        Ok(()) => {
                            record = next;
                        }
                        Err(CircuitBreakerError::Store(RecordStoreError::VersionMismatch { .. })) => {
                            record = self.read_or_init(&key, dependency).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                CircuitState::HalfOpen => {
                    let probe_stale = record.probe_in_flight_at.is_none_or(|started| {
                        now.signed_duration_since(started).to_std().unwrap_or(Duration::ZERO)
                            > self.config.probe_in_flight_timeout
                    });

                    if !probe_stale {
                        return Ok(Decision::Reject { retry_after: self.config.probe_in_flight_timeout });
                    }

                    let next = CircuitRecord { probe_in_flight_at: Some(now), ..record.clone() };
                    match self.cas(&key, dependency, next).await {
                        Ok(()) => return Ok(Decision::Permit),
                        Err(CircuitBreakerError::Store(RecordStoreError::VersionMismatch { .. })) => {
                            record = self.read_or_init(&key, dependency).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Records the outcome of a call to `dependency`, applying the state
    /// transitions in `spec.md` §4.3.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError::Store`] if the backing store fails.
    pub async fn record(&self, dependency: &str, outcome: Outcome) -> Result<(), CircuitBreakerError> {
        let key = key_for(dependency);
        let mut record = self.read_or_init(&key, dependency).await?;

        loop {
            let next = self.next_record(&record, outcome);
            if next_is_noop(&record, &next) {
                return Ok(());
            }

            match self.cas(&key, dependency, next.clone()).await {
                Ok(()) => return Ok(()),
                Err(CircuitBreakerError::Store(RecordStoreError::VersionMismatch { .. })) => {
                    record = self.read_or_init(&key, dependency).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_record(&self, record: &CircuitRecord, outcome: Outcome) -> CircuitRecord {
        match (record.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => CircuitRecord { consecutive_failures: 0, ..record.clone() },
            (CircuitState::Closed, Outcome::Failure) => {
                let failures = record.consecutive_failures + 1;
                if failures >= self.config.fail_threshold {
                    tracing::warn!(dependency = "closed->open", failures, "circuit breaker opening");
                    CircuitRecord {
                        state: CircuitState::Open,
                        consecutive_failures: 0,
                        consecutive_successes: 0,
                        opened_at: Some(Utc::now()),
                        probe_in_flight_at: None,
                    }
                } else {
                    CircuitRecord { consecutive_failures: failures, ..record.clone() }
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                let successes = record.consecutive_successes + 1;
                if successes >= self.config.success_threshold {
                    tracing::info!("circuit breaker closing after successful probes");
                    CircuitRecord::closed()
                } else {
                    CircuitRecord {
                        consecutive_successes: successes,
                        probe_in_flight_at: None,
                        ..record.clone()
                    }
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                tracing::warn!("circuit breaker probe failed, reopening");
                CircuitRecord {
                    state: CircuitState::Open,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    opened_at: Some(Utc::now()),
                    probe_in_flight_at: None,
                }
            }
            (CircuitState::Open, _) => record.clone(),
        }
    }

    async fn read_or_init(&self, key: &RecordKey, dependency: &str) -> Result<CircuitRecord, CircuitBreakerError> {
        if let Some(stored) = self.store.get(key.clone(), Consistency::Strong).await? {
            return serde_json::from_value(stored.value)
                .map_err(|e| CircuitBreakerError::Corrupt { dependency: dependency.to_string(), details: e.to_string() });
        }

        match self.store.put_if_absent(key.clone(), json!(CircuitRecord::closed()), None).await {
            Ok(_) | Err(RecordStoreError::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let stored = self
            .store
            .get(key.clone(), Consistency::Strong)
            .await?
            .ok_or_else(|| CircuitBreakerError::Corrupt {
                dependency: dependency.to_string(),
                details: "record vanished immediately after creation".into(),
            })?;

        serde_json::from_value(stored.value)
            .map_err(|e| CircuitBreakerError::Corrupt { dependency: dependency.to_string(), details: e.to_string() })
    }

    async fn cas(&self, key: &RecordKey, dependency: &str, next: CircuitRecord) -> Result<(), CircuitBreakerError> {
        let current = self
            .store
            .get(key.clone(), Consistency::Strong)
            .await?
            .ok_or_else(|| CircuitBreakerError::Corrupt { dependency: dependency.to_string(), details: "record missing before CAS".into() })?;

        self.store.compare_and_set(key.clone(), current.version, json!(next)).await?;
        Ok(())
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

fn next_is_noop(current: &CircuitRecord, next: &CircuitRecord) -> bool {
    current.state == next.state
        && current.consecutive_failures == next.consecutive_failures
        && current.consecutive_successes == next.consecutive_successes
        && current.probe_in_flight_at == next.probe_in_flight_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudflow_store_memory::InMemoryRecordStore;

    fn registry(config: CircuitBreakerConfig) -> CircuitBreakerRegistry<InMemoryRecordStore> {
        CircuitBreakerRegistry::new(Arc::new(InMemoryRecordStore::new()), config)
    }

    #[tokio::test]
    async fn closed_permits_and_tolerates_failures_below_threshold() {
        let registry = registry(CircuitBreakerConfig::builder().fail_threshold(3).build());
        for _ in 0..2 {
            assert_eq!(registry.allow("payment_provider").await, Decision::Permit);
            registry.record("payment_provider", Outcome::Failure).await.unwrap();
        }
        assert_eq!(registry.allow("payment_provider").await, Decision::Permit);
    }

    #[tokio::test]
    async fn opens_after_fail_threshold_and_rejects() {
        let registry = registry(CircuitBreakerConfig::builder().fail_threshold(2).build());
        registry.record("payment_provider", Outcome::Failure).await.unwrap();
        registry.record("payment_provider", Outcome::Failure).await.unwrap();

        match registry.allow("payment_provider").await {
            Decision::Reject { .. } => {}
            Decision::Permit => panic!("expected circuit to be open"),
        }
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold_probes() {
        let registry = registry(
            CircuitBreakerConfig::builder()
                .fail_threshold(1)
                .success_threshold(2)
                .cooldown(Duration::from_millis(1))
                .build(),
        );
        registry.record("payment_provider", Outcome::Failure).await.unwrap();
        assert!(matches!(registry.allow("payment_provider").await, Decision::Reject { .. }));

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(registry.allow("payment_provider").await, Decision::Permit);
        registry.record("payment_provider", Outcome::Success).await.unwrap();
        registry.record("payment_provider", Outcome::Success).await.unwrap();

        assert_eq!(registry.allow("payment_provider").await, Decision::Permit);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_circuit() {
        let registry = registry(
            CircuitBreakerConfig::builder().fail_threshold(1).cooldown(Duration::from_millis(1)).build(),
        );
        registry.record("payment_provider", Outcome::Failure).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.allow("payment_provider").await, Decision::Permit);

        registry.record("payment_provider", Outcome::Failure).await.unwrap();
        assert!(matches!(registry.allow("payment_provider").await, Decision::Reject { .. }));
    }
}
