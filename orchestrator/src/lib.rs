//! # CloudFlow SAGA Orchestrator
//!
//! Wires the Idempotency Ledger, Circuit Breaker Registry, Inventory
//! Engine, and Event Log into the top-level coordinator named in
//! `spec.md` §2 item 6: "the top-level coordinator ... drives the
//! forward-and-compensation state machine for each order." `submit_order`
//! validates and records intake, then spawns [`saga::run`] on the
//! workspace's async runtime; `get_order` answers the `GetOrder` query
//! straight from the Event Log.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod ingress;
mod policy;
mod saga;

pub use ingress::{Accepted, EventSummary, GetOrderResponse, ItemInput, SubmitOrder, ValidatedOrder};
pub use policy::StepPolicy;

use cloudflow_circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use cloudflow_core::error::CloudFlowError;
use cloudflow_core::ids::OrderId;
use cloudflow_core::ports::{NotificationSink, PaymentProvider};
use cloudflow_event_log::{EventLog, EventLogError};
use cloudflow_idempotency::{IdempotencyLedger, LedgerConfig};
use cloudflow_inventory::InventoryEngine;
use cloudflow_store::RecordStore;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// `spec.md` §4.4: the compensation backstop for a `HELD` reservation
/// that outlives bounded release retries.
const RESERVATION_TTL: Duration = Duration::from_secs(24 * 3600);

/// The SAGA Orchestrator (`spec.md` §4.6), generic over the backing
/// [`RecordStore`] so the same code runs against
/// `cloudflow-store-memory` in tests and `cloudflow-store-postgres` in
/// production.
pub struct Orchestrator<S> {
    event_log: EventLog<S>,
    ledger: Arc<IdempotencyLedger<S>>,
    circuit_breaker: Arc<CircuitBreakerRegistry<S>>,
    inventory: Arc<InventoryEngine<S>>,
    payment_provider: Arc<dyn PaymentProvider>,
    notifications: Arc<dyn NotificationSink>,
}

impl<S: RecordStore + Send + Sync + 'static> Orchestrator<S> {
    /// Builds an orchestrator over `store`, with production-shaped
    /// defaults for every component's tunables (`spec.md` §4.2, §4.3,
    /// §4.4).
    pub fn new(store: Arc<S>, payment_provider: Arc<dyn PaymentProvider>, notifications: Arc<dyn NotificationSink>) -> Self {
        let ledger = Arc::new(IdempotencyLedger::new(Arc::clone(&store), LedgerConfig::default()));
        let circuit_breaker = Arc::new(CircuitBreakerRegistry::new(Arc::clone(&store), CircuitBreakerConfig::default()));
        let inventory = Arc::new(InventoryEngine::new(Arc::clone(&store), Arc::clone(&ledger), RESERVATION_TTL));

        Self {
            event_log: EventLog::new(Arc::clone(&store)),
            ledger,
            circuit_breaker,
            inventory,
            payment_provider,
            notifications,
        }
    }

    /// Accepts a `SubmitOrder` command: validates it, records the order's
    /// summary and genesis event, then spawns its SAGA in the background
    /// (`spec.md` §6: "submission never waits for the SAGA to finish").
    ///
    /// Re-submitting an `order_id` that already exists is treated as a
    /// duplicate delivery of the same command (`spec.md` §8 scenario S5)
    /// and returns `Accepted` without starting a second SAGA.
    ///
    /// # Errors
    ///
    /// Returns [`CloudFlowError::Validation`] if `command` fails
    /// validation, or [`CloudFlowError::Unavailable`] if the event log
    /// could not be written.
    pub async fn submit_order(self: &Arc<Self>, command: SubmitOrder) -> Result<Accepted, CloudFlowError> {
        let validated = ingress::validate(command)?;
        let order_id = validated.order_id;

        let summary = match self
            .event_log
            .create(order_id, validated.customer_id, validated.items, validated.total_minor_units, validated.correlation_id)
            .await
        {
            Ok(summary) => summary,
            Err(EventLogError::AlreadyExists(_)) => {
                tracing::info!(%order_id, "duplicate order submission, SAGA already running or complete");
                return Ok(Accepted { order_id: order_id.to_string(), status: "PENDING" });
            }
            Err(e) => return Err(CloudFlowError::Unavailable { details: e.to_string() }),
        };

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            saga::run(
                order_id,
                summary,
                &orchestrator.event_log,
                &orchestrator.ledger,
                &orchestrator.circuit_breaker,
                &orchestrator.inventory,
                orchestrator.payment_provider.as_ref(),
                orchestrator.notifications.as_ref(),
            )
            .await;
        });

        Ok(Accepted { order_id: order_id.to_string(), status: "PENDING" })
    }

    /// Answers a `GetOrder` query from the Event Log (`spec.md` §6).
    /// `total_minor_units` and `status` are read with the default eventual
    /// consistency named in `spec.md` §4.5 `current(order_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudFlowError::Validation`] if `order_id` does not
    /// parse, or [`CloudFlowError::Unavailable`] if no such order exists
    /// or the store failed.
    pub async fn get_order(&self, order_id: &str) -> Result<GetOrderResponse, CloudFlowError> {
        let order_id = OrderId::from_str(order_id).map_err(|e| CloudFlowError::Validation { details: format!("invalid order_id: {e}") })?;

        let summary = self.event_log.current(order_id).await.map_err(|e| CloudFlowError::Unavailable { details: e.to_string() })?;
        let events = self.event_log.history(order_id).await.map_err(|e| CloudFlowError::Unavailable { details: e.to_string() })?;

        Ok(GetOrderResponse {
            order_id: order_id.to_string(),
            status: summary.status,
            customer_id: summary.customer_id.to_string(),
            total_minor_units: summary.total_minor_units.value(),
            correlation_id: summary.correlation_id.to_string(),
            events: events
                .into_iter()
                .map(|e| EventSummary { seq: e.seq, event_type: format!("{:?}", e.event_type), occurred_at: e.occurred_at })
                .collect(),
        })
    }
}
