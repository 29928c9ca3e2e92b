//! Cross-component error taxonomy.
//!
//! `spec.md` §7 names eight error *kinds*, not concrete types, and assigns
//! each a propagation policy. `CloudFlowError` is the type every
//! `cloudflow-*` crate eventually converts its own focused error enum into
//! at a component boundary, the same way the teacher converts
//! `EventStoreError` into an `anyhow::Error` at the binary boundary — except
//! here the conversion happens one layer lower, since the orchestrator
//! itself (not just the binary) needs to match on the kind to decide
//! retry/compensate/fail.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error kind, used by the orchestrator to decide retry vs.
/// compensation vs. terminal failure (`spec.md` §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client input failed validation. Surfaced at ingress only; never seen
    /// inside a running SAGA.
    Validation,
    /// A concurrent or duplicate logical operation collided.
    Conflict,
    /// Inventory reservation could not be satisfied.
    InsufficientStock,
    /// The payment provider declined the charge.
    PaymentDeclined,
    /// The circuit breaker rejected the call.
    CircuitOpen,
    /// Transient infrastructure failure; retryable.
    Unavailable,
    /// An operation exceeded its deadline; retryable.
    Timeout,
    /// An invariant was violated. Never retried; escalated to operators.
    Internal,
}

impl ErrorKind {
    /// Whether the per-step retry policy (`spec.md` §4.6) should retry an
    /// error of this kind. `CircuitOpen` is deliberately excluded: it
    /// propagates immediately without retry per the charge step's policy.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable | Self::Timeout)
    }
}

/// The top-level CloudFlow error type.
///
/// Carries enough structure for `GetOrder`-style callers to reconstruct the
/// HTTP status suggestions in `spec.md` §6, without this crate depending on
/// any HTTP framework.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum CloudFlowError {
    /// `spec.md` §6: rejected at ingress with validation details.
    #[error("validation failed: {details}")]
    Validation {
        /// Human-readable explanation of what failed validation.
        details: String,
    },

    /// `spec.md` §6: a concurrent or replayed idempotency key is still
    /// in flight.
    #[error("conflicting in-progress operation, retry after {retry_after_seconds}s")]
    Conflict {
        /// Suggested client backoff before retrying.
        retry_after_seconds: u64,
    },

    /// `spec.md` §6: reservation could not be satisfied.
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// The product that ran out of stock.
        product_id: String,
        /// Quantity the caller requested.
        requested: i64,
        /// Quantity actually observed available at decision time.
        available: i64,
    },

    /// `spec.md` §6: the payment provider declined the charge.
    #[error("payment declined: {reason}")]
    PaymentDeclined {
        /// Provider-supplied decline reason code.
        reason: String,
    },

    /// `spec.md` §6: the payment provider's circuit is open.
    #[error("payment provider unavailable, retry after {retry_after_seconds}s")]
    PaymentProviderUnavailable {
        /// Suggested client backoff before retrying.
        retry_after_seconds: u64,
    },

    /// Transient infrastructure failure.
    #[error("temporarily unavailable: {details}")]
    Unavailable {
        /// Description of the transient failure.
        details: String,
    },

    /// An operation exceeded its deadline.
    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout {
        /// How long the operation ran before the timeout fired.
        elapsed_ms: u64,
    },

    /// An invariant was violated. Never retried.
    #[error("internal invariant violated: {details}")]
    Internal {
        /// Description of the violated invariant.
        details: String,
    },
}

impl CloudFlowError {
    /// The error kind this variant belongs to.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::PaymentDeclined { .. } => ErrorKind::PaymentDeclined,
            Self::PaymentProviderUnavailable { .. } => ErrorKind::CircuitOpen,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator's per-step retry policy should retry this
    /// error (`spec.md` §4.6/§7).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
