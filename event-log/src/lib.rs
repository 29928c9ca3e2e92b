//! Event Log.
//!
//! Per order, the event log is the authoritative history; the order
//! summary is a denormalized cache kept in lockstep by a two-write,
//! lost-update-safe protocol (`spec.md` §4.5): append the event at
//! `seq = summary.version + 1`, then `compare_and_set` the summary. If the
//! `compare_and_set` loses, another writer won a concurrent transition and
//! this append is informational only — the writer re-reads the summary and
//! retries at the new `seq`.
//!
//! This protocol is new relative to the teacher's `EventStore` trait, which
//! assumes a single transactional `append_events` call per stream; `spec.md`
//! §9 "Reservations + summary atomicity" explains why that assumption
//! cannot be made here. The vocabulary is kept the same: `(OrderId, seq)`
//! plays the role of the teacher's `StreamId` + version, and append is
//! `put_if_absent`-based exactly as `EventStore::append_events` documents
//! optimistic concurrency via `expected_version`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use cloudflow_core::ids::{CorrelationId, CustomerId, OrderId, ReservationId};
use cloudflow_core::money::{LineItem, MinorUnits};
use cloudflow_store::{Consistency, RecordKey, RecordStore, RecordStoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// The order's current status (`spec.md` §3 Order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted, SAGA not yet started or reserve not yet completed.
    Pending,
    /// Inventory reserved; payment not yet attempted.
    StockReserved,
    /// Payment captured; order not yet confirmed.
    PaymentCharged,
    /// Terminal success.
    Confirmed,
    /// Compensation in progress.
    Compensating,
    /// Terminal: compensation completed, stock fully restored.
    Compensated,
    /// Terminal: failed with nothing to compensate (e.g. `INSUFFICIENT_STOCK`).
    Failed,
}

impl OrderStatus {
    /// Whether this status is terminal — the summary record becomes
    /// immutable once reached (`spec.md` §3 Order invariants).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Compensated | Self::Failed)
    }
}

/// The kind of an [`OrderEvent`] (`spec.md` §3 OrderEvent, §4.6 state
/// machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventType {
    /// The SAGA accepted the order and recorded its summary.
    OrderCreated,
    /// Inventory was reserved.
    StockReserved,
    /// Payment was captured.
    PaymentCharged,
    /// Payment failed (declined or circuit open).
    PaymentFailed,
    /// A reservation was released during compensation.
    StockReleased,
    /// The order reached terminal success.
    OrderConfirmed,
    /// Compensation completed; terminal.
    OrderCompensated,
    /// The order failed with nothing to compensate; terminal.
    OrderFailed,
}

impl OrderEventType {
    /// The summary `status` reachable after this event, per the state
    /// diagram in `spec.md` §4.6. Used by [`EventLog::append`] to compute
    /// the summary's next status in the same write that advances `version`.
    #[must_use]
    pub const fn terminal_status(self) -> OrderStatus {
        match self {
            Self::OrderCreated => OrderStatus::Pending,
            Self::StockReserved => OrderStatus::StockReserved,
            Self::PaymentCharged => OrderStatus::PaymentCharged,
            Self::PaymentFailed | Self::StockReleased => OrderStatus::Compensating,
            Self::OrderConfirmed => OrderStatus::Confirmed,
            Self::OrderCompensated => OrderStatus::Compensated,
            Self::OrderFailed => OrderStatus::Failed,
        }
    }
}

/// A single immutable event in an order's history (`spec.md` §3 OrderEvent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Position in this order's log. Contiguous from 1.
    pub seq: u64,
    /// The event's kind.
    pub event_type: OrderEventType,
    /// When the event occurred. Monotone per order.
    pub occurred_at: DateTime<Utc>,
    /// Event-specific data (e.g. `reservation_id`, decline reason).
    pub payload: serde_json::Value,
}

/// The denormalized current-state cache for an order (`spec.md` §3 Order).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    /// The order's identifier.
    pub order_id: OrderId,
    /// The customer who placed the order.
    pub customer_id: CustomerId,
    /// The line items, as validated at ingress.
    pub items: Vec<LineItem>,
    /// Server-computed total (`spec.md` §6).
    pub total_minor_units: MinorUnits,
    /// Current status.
    pub status: OrderStatus,
    /// Propagated to every step, event, log line, and outbound message.
    pub correlation_id: CorrelationId,
    /// When the order was accepted.
    pub created_at: DateTime<Utc>,
    /// Equal to the `seq` of the most recently applied event.
    pub version: u64,
}

/// Errors from the Event Log.
#[derive(Error, Debug)]
pub enum EventLogError {
    /// No summary exists for this order.
    #[error("no such order: {0}")]
    NotFound(OrderId),

    /// `create` was called for an `order_id` that already has a summary.
    #[error("order already exists: {0}")]
    AlreadyExists(OrderId),

    /// A stored record could not be deserialized.
    #[error("corrupt event log record for order {order_id}: {details}")]
    Corrupt {
        /// The order whose record was unreadable.
        order_id: OrderId,
        /// What was wrong with the stored value.
        details: String,
    },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] RecordStoreError),
}

fn summary_key(order_id: OrderId) -> RecordKey {
    RecordKey::new(format!("order:{order_id}"))
}

fn event_key(order_id: OrderId, seq: u64) -> RecordKey {
    RecordKey::new(format!("order:{order_id}:event:{seq}"))
}

/// Append-only per-order event log with a denormalized summary
/// (`spec.md` §4.5).
pub struct EventLog<S> {
    store: Arc<S>,
}

impl<S: RecordStore> EventLog<S> {
    /// Wraps `store`, shared with whichever other components
    /// (`IdempotencyLedger`, `CircuitBreakerRegistry`, `InventoryEngine`)
    /// the orchestrator constructs over the same backing store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Creates the order's summary and appends the genesis `OrderCreated`
    /// event. Called once by the orchestrator on intake.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::AlreadyExists`] if a summary already exists
    /// for `order_id` (this is how `SubmitOrder` detects a duplicate
    /// submission, `spec.md` §8 scenario S5).
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        order_id: OrderId,
        customer_id: CustomerId,
        items: Vec<LineItem>,
        total_minor_units: MinorUnits,
        correlation_id: CorrelationId,
    ) -> Result<OrderSummary, EventLogError> {
        let created_at = Utc::now();
        let summary = OrderSummary {
            order_id,
            customer_id,
            items,
            total_minor_units,
            status: OrderStatus::Pending,
            correlation_id,
            created_at,
            version: 0,
        };

        match self.store.put_if_absent(summary_key(order_id), json!(summary), None).await {
            Ok(_) => {}
            Err(RecordStoreError::Conflict(_)) => return Err(EventLogError::AlreadyExists(order_id)),
            Err(e) => return Err(e.into()),
        }

        self.append(order_id, OrderEventType::OrderCreated, json!({})).await?;
        tracing::info!(%order_id, %correlation_id, "order created");
        metrics::counter!("event_log.order_created").increment(1);

        self.current_strong(order_id).await
    }

    /// Appends an event to `order_id`'s log and advances the summary to
    /// match, retrying the two-write protocol until it wins a race or a
    /// hard error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] if no summary exists yet, or a
    /// store error on infrastructure failure.
    pub async fn append(
        &self,
        order_id: OrderId,
        event_type: OrderEventType,
        payload: serde_json::Value,
    ) -> Result<u64, EventLogError> {
        let (mut summary, mut record_version) = self.read_summary_versioned(order_id, Consistency::Strong).await?;

        loop {
            let seq = summary.version + 1;
            let event = OrderEvent { seq, event_type, occurred_at: Utc::now(), payload: payload.clone() };

            match self.store.put_if_absent(event_key(order_id, seq), json!(event), None).await {
                Ok(_) => {}
                Err(RecordStoreError::Conflict(_)) => {
                    (summary, record_version) = self.read_summary_versioned(order_id, Consistency::Strong).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let next_summary = OrderSummary { version: seq, status: event_type.terminal_status(), ..summary.clone() };
            match self.store.compare_and_set(summary_key(order_id), record_version, json!(next_summary)).await {
                Ok(_) => {
                    tracing::info!(%order_id, seq, ?event_type, "order event appended");
                    metrics::counter!("event_log.appended").increment(1);
                    return Ok(seq);
                }
                Err(RecordStoreError::VersionMismatch { .. }) => {
                    // Another writer advanced the summary first; our append
                    // is informational. Re-read and try again at the new seq.
                    (summary, record_version) = self.read_summary_versioned(order_id, Consistency::Strong).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the complete event sequence in `seq` order (strong read).
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] if no summary exists for
    /// `order_id`.
    pub async fn history(&self, order_id: OrderId) -> Result<Vec<OrderEvent>, EventLogError> {
        let summary = self.current_strong(order_id).await?;
        let mut events = Vec::with_capacity(summary.version as usize);

        for seq in 1..=summary.version {
            let Some(record) = self.store.get(event_key(order_id, seq), Consistency::Strong).await? else {
                break;
            };
            let event: OrderEvent = serde_json::from_value(record.value)
                .map_err(|e| EventLogError::Corrupt { order_id, details: e.to_string() })?;
            events.push(event);
        }

        Ok(events)
    }

    /// Returns the order summary. Eventual read by default; callers
    /// needing read-your-writes should call [`EventLog::current_strong`].
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] if no summary exists.
    pub async fn current(&self, order_id: OrderId) -> Result<OrderSummary, EventLogError> {
        self.read_summary(order_id, Consistency::Eventual).await
    }

    /// Returns the order summary with a strongly-consistent read.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] if no summary exists.
    pub async fn current_strong(&self, order_id: OrderId) -> Result<OrderSummary, EventLogError> {
        self.read_summary(order_id, Consistency::Strong).await
    }

    async fn read_summary(&self, order_id: OrderId, consistency: Consistency) -> Result<OrderSummary, EventLogError> {
        self.read_summary_versioned(order_id, consistency).await.map(|(summary, _record_version)| summary)
    }

    /// Reads the summary together with the backing store's own record
    /// version (`store/src/lib.rs` `Record::version`, 1-based and
    /// advanced by every `compare_and_set`). This is distinct from
    /// `OrderSummary::version`, the domain `seq` counter, which starts at
    /// 0 on `create` — the two share no common origin, so `append`'s CAS
    /// must condition on the store's version, not the domain one.
    async fn read_summary_versioned(
        &self,
        order_id: OrderId,
        consistency: Consistency,
    ) -> Result<(OrderSummary, u64), EventLogError> {
        let record = self
            .store
            .get(summary_key(order_id), consistency)
            .await?
            .ok_or(EventLogError::NotFound(order_id))?;
        let record_version = record.version;

        let summary = serde_json::from_value(record.value).map_err(|e| EventLogError::Corrupt { order_id, details: e.to_string() })?;
        Ok((summary, record_version))
    }
}

/// Convenience payload for a `StockReserved` event.
#[derive(Debug, Serialize, Deserialize)]
pub struct StockReservedPayload {
    /// The reservation created by this step.
    pub reservation_id: ReservationId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudflow_store_memory::InMemoryRecordStore;

    fn line_items() -> Vec<LineItem> {
        vec![LineItem {
            product_id: cloudflow_core::ids::ProductId::new("KEYBD-01"),
            quantity: 1,
            unit_price_minor_units: MinorUnits::new(8999),
        }]
    }

    #[tokio::test]
    async fn create_then_append_advances_status_and_seq() {
        let log = EventLog::new(Arc::new(InMemoryRecordStore::new()));
        let order_id = OrderId::new();

        log.create(order_id, CustomerId::new("c1"), line_items(), MinorUnits::new(8999), CorrelationId::new())
            .await
            .unwrap();

        let reservation_id = ReservationId::new();
        log.append(
            order_id,
            OrderEventType::StockReserved,
            json!(StockReservedPayload { reservation_id }),
        )
        .await
        .unwrap();

        let summary = log.current_strong(order_id).await.unwrap();
        assert_eq!(summary.status, OrderStatus::StockReserved);
        assert_eq!(summary.version, 2);

        let history = log.history(order_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].seq, 1);
        assert_eq!(history[1].seq, 2);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let log = EventLog::new(Arc::new(InMemoryRecordStore::new()));
        let order_id = OrderId::new();
        log.create(order_id, CustomerId::new("c1"), line_items(), MinorUnits::new(8999), CorrelationId::new())
            .await
            .unwrap();

        let err = log
            .create(order_id, CustomerId::new("c1"), line_items(), MinorUnits::new(8999), CorrelationId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn full_happy_path_sequence_is_contiguous() {
        let log = EventLog::new(Arc::new(InMemoryRecordStore::new()));
        let order_id = OrderId::new();
        log.create(order_id, CustomerId::new("c1"), line_items(), MinorUnits::new(8999), CorrelationId::new())
            .await
            .unwrap();

        log.append(order_id, OrderEventType::StockReserved, json!({})).await.unwrap();
        log.append(order_id, OrderEventType::PaymentCharged, json!({})).await.unwrap();
        log.append(order_id, OrderEventType::OrderConfirmed, json!({})).await.unwrap();

        let summary = log.current_strong(order_id).await.unwrap();
        assert_eq!(summary.status, OrderStatus::Confirmed);
        assert!(summary.status.is_terminal());

        let history = log.history(order_id).await.unwrap();
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let log = EventLog::new(Arc::new(InMemoryRecordStore::new()));
        let err = log.current(OrderId::new()).await.unwrap_err();
        assert!(matches!(err, EventLogError::NotFound(_)));
    }
}
