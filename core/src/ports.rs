//! Injected dependency boundaries consumed by the SAGA Orchestrator
//! (`spec.md` §6 "Payment provider adapter", "Notification queue").
//!
//! These play the same role the teacher's `environment::Clock` trait
//! plays for its `Reducer`/`Store` engine: a thin, dyn-compatible seam that
//! production code is constructed against and tests substitute with a
//! fake. Production implementations of the payment provider and
//! notification queue are out of scope (`spec.md` §1 "Out of scope");
//! only the trait boundary lives here.

use crate::error::CloudFlowError;
use crate::money::MinorUnits;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Result of a charge attempt (`spec.md` §6 "Payment provider adapter").
///
/// Serializable because the charge step's Idempotency Ledger call
/// persists it as the record's completed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeOutcome {
    /// The charge was captured.
    Captured {
        /// Provider-assigned identifier for the captured charge.
        provider_charge_id: String,
    },
    /// The charge was declined.
    Declined {
        /// Provider-supplied decline reason code.
        reason_code: String,
    },
}

/// A charge request (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    /// Idempotency key the provider should deduplicate on.
    pub idempotency_key: String,
    /// Amount to charge, in integer minor units.
    pub amount_minor_units: MinorUnits,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Free-form metadata attached to the charge (e.g. `order_id`).
    pub metadata: serde_json::Value,
}

/// The payment provider boundary. A `TransientError` is surfaced to the
/// orchestrator as [`CloudFlowError::Unavailable`], which the charge step's
/// retry policy treats as retryable.
pub trait PaymentProvider: Send + Sync {
    /// Attempts to charge `request`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudFlowError::Unavailable`] for a `TransientError`
    /// response from the provider.
    fn charge(&self, request: ChargeRequest) -> Pin<Box<dyn Future<Output = Result<ChargeOutcome, CloudFlowError>> + Send + '_>>;
}

/// A notification message (`spec.md` §6 "Notification queue"). Consumers
/// are expected to dedupe on `(order_id, message_type)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// `"ORDER_CONFIRMED"` or `"ORDER_COMPENSATED"`.
    pub message_type: &'static str,
    /// The order this notification concerns.
    pub order_id: String,
    /// Propagated correlation identifier.
    pub correlation_id: String,
    /// The customer to notify.
    pub customer_id: String,
}

/// The outbound notification queue boundary.
pub trait NotificationSink: Send + Sync {
    /// Enqueues `notification`. Delivery is fire-and-forget from the
    /// orchestrator's perspective; the terminal transition does not wait
    /// for consumer acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`CloudFlowError::Unavailable`] if the queue cannot accept
    /// the message.
    fn enqueue(&self, notification: Notification) -> Pin<Box<dyn Future<Output = Result<(), CloudFlowError>> + Send + '_>>;
}
