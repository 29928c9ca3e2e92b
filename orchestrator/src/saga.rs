//! The per-order SAGA state machine (`spec.md` §4.6).
//!
//! An explicit, linear async function per order rather than a generic
//! reducer engine — see `SPEC_FULL.md` §C.6 for why this departs from the
//! teacher's `Reducer`/`Store`/`Effect` machinery. Every forward step runs
//! through the Idempotency Ledger under a key stable across retries, so a
//! retried step is a no-op on replay; every outbound call is retried per
//! [`StepPolicy`] with jittered exponential backoff on top of that.

use crate::policy::StepPolicy;
use cloudflow_circuit_breaker::{CircuitBreakerRegistry, Decision, Outcome};
use cloudflow_core::error::CloudFlowError;
use cloudflow_core::ids::{CorrelationId, OrderId, ReservationId};
use cloudflow_core::ports::{ChargeOutcome, ChargeRequest, Notification, NotificationSink, PaymentProvider};
use cloudflow_event_log::{EventLog, OrderEventType, OrderSummary, StockReservedPayload};
use cloudflow_idempotency::{Classify, IdempotencyLedger, LedgerError};
use cloudflow_inventory::{InventoryEngine, InventoryError};
use cloudflow_store::RecordStore;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

/// The one dependency name the circuit breaker guards in this workspace
/// (`spec.md` §4.6 "Charge step").
const PAYMENT_PROVIDER: &str = "payment_provider";

/// Idempotency record TTL for the charge and confirm saga steps. An hour
/// comfortably outlives every step's retry budget (at most a few seconds)
/// while still expiring well before a genuinely new order would reuse the
/// same `order_id`.
const SAGA_STEP_LEDGER_TTL: Duration = Duration::from_secs(3600);

/// Runs the forward-and-compensation SAGA for `summary` to completion,
/// appending every transition to `event_log` and driving the injected
/// ports. Returns once the order has reached a terminal status. Never
/// panics on infrastructure failure: retry exhaustion itself becomes a
/// `FAILED`/`COMPENSATED` terminal transition, so a crashed worker's
/// replacement can always resume purely from the event log (`spec.md` §8
/// scenario S6).
pub async fn run<S: RecordStore>(
    order_id: OrderId,
    summary: OrderSummary,
    event_log: &EventLog<S>,
    ledger: &IdempotencyLedger<S>,
    circuit_breaker: &CircuitBreakerRegistry<S>,
    inventory: &InventoryEngine<S>,
    payment_provider: &dyn PaymentProvider,
    notifications: &dyn NotificationSink,
) {
    let correlation_id = summary.correlation_id;

    let reservations = match reserve_step(order_id, &summary, event_log, inventory).await {
        Ok(reservations) => reservations,
        Err(()) => return, // terminal FAILED already recorded; nothing to compensate.
    };

    if let Err(()) = charge_step(order_id, &summary, event_log, ledger, circuit_breaker, payment_provider).await {
        compensate(order_id, &reservations, event_log, inventory).await;
        notify(notifications, "ORDER_COMPENSATED", order_id, correlation_id, &summary).await;
        return;
    }

    match confirm_step(order_id, event_log, ledger).await {
        Ok(()) => {
            for reservation_id in &reservations {
                if let Err(e) = inventory.consume(*reservation_id).await {
                    tracing::error!(%order_id, %reservation_id, error = %e, "failed to consume reservation after confirm");
                }
            }
            notify(notifications, "ORDER_CONFIRMED", order_id, correlation_id, &summary).await;
        }
        Err(()) => {
            compensate(order_id, &reservations, event_log, inventory).await;
            notify(notifications, "ORDER_COMPENSATED", order_id, correlation_id, &summary).await;
        }
    }
}

/// Step 1: reserve inventory for every line item. `spec.md` §4.6 names a
/// single `reserve` step; `InventoryEngine::reserve` only reserves one
/// `product_id` at a time, so a multi-item order reserves each line under
/// its own step id, and the step as a whole fails (releasing every
/// already-held line) the moment any single line is short.
async fn reserve_step<S: RecordStore>(
    order_id: OrderId,
    summary: &OrderSummary,
    event_log: &EventLog<S>,
    inventory: &InventoryEngine<S>,
) -> Result<Vec<ReservationId>, ()> {
    let policy = StepPolicy::RESERVE;
    let mut reservations = Vec::with_capacity(summary.items.len());

    for (index, item) in summary.items.iter().enumerate() {
        let step_id = format!("saga:{order_id}:reserve:{index}");
        let product_id = item.product_id.clone();
        let quantity = item.quantity;

        match retry_step(policy, || inventory.reserve(order_id, product_id.clone(), quantity, &step_id)).await {
            Ok(reservation_id) => reservations.push(reservation_id),
            Err(LedgerError::Operation(InventoryError::InsufficientStock { product_id, requested, available })) => {
                tracing::warn!(%order_id, product_id, requested, available, "insufficient stock, failing order");
                release_all(&reservations, inventory).await;
                fail_order(order_id, event_log, json!({"reason": "INSUFFICIENT_STOCK", "product_id": product_id})).await;
                return Err(());
            }
            Err(e) => {
                tracing::error!(%order_id, error = %e, "reserve step exhausted retries");
                release_all(&reservations, inventory).await;
                fail_order(order_id, event_log, json!({"reason": "RESERVE_UNAVAILABLE"})).await;
                return Err(());
            }
        }
    }

    for reservation_id in &reservations {
        if let Err(e) = event_log
            .append(order_id, OrderEventType::StockReserved, json!(StockReservedPayload { reservation_id: *reservation_id }))
            .await
        {
            tracing::error!(%order_id, error = %e, "failed to record stock-reserved event");
        }
    }

    Ok(reservations)
}

async fn release_all<S: RecordStore>(reservations: &[ReservationId], inventory: &InventoryEngine<S>) {
    for reservation_id in reservations {
        if let Err(e) = inventory.release(*reservation_id).await {
            tracing::error!(%reservation_id, error = %e, "failed to release reservation during rollback");
        }
    }
}

/// Step 2: charge payment. Consults the Circuit Breaker Registry before
/// every attempt (`spec.md` §4.6 "Charge step specifically consults...");
/// a rejected circuit surfaces as a non-retryable error so `retry_step`
/// stops immediately rather than burning the retry budget. The charge
/// itself, plus recording its outcome against the breaker, runs inside the
/// Idempotency Ledger so a retried attempt never double-charges.
async fn charge_step<S: RecordStore>(
    order_id: OrderId,
    summary: &OrderSummary,
    event_log: &EventLog<S>,
    ledger: &IdempotencyLedger<S>,
    circuit_breaker: &CircuitBreakerRegistry<S>,
    payment_provider: &dyn PaymentProvider,
) -> Result<(), ()> {
    let policy = StepPolicy::CHARGE;
    let step_id = format!("saga:{order_id}:charge");
    let request = ChargeRequest {
        idempotency_key: step_id.clone(),
        amount_minor_units: summary.total_minor_units,
        currency: "USD".into(),
        metadata: json!({"order_id": order_id.to_string()}),
    };

    let outcome = retry_step(policy, || async {
        if let Decision::Reject { retry_after } = circuit_breaker.allow(PAYMENT_PROVIDER).await {
            tracing::warn!(%order_id, ?retry_after, "payment provider circuit open");
            return Err(LedgerError::Operation(CloudFlowError::PaymentProviderUnavailable {
                retry_after_seconds: retry_after.as_secs(),
            }));
        }

        let request = request.clone();
        ledger
            .run(&step_id, SAGA_STEP_LEDGER_TTL, || async {
                let result = payment_provider.charge(request).await;
                let breaker_outcome = if result.is_ok() { Outcome::Success } else { Outcome::Failure };
                if let Err(e) = circuit_breaker.record(PAYMENT_PROVIDER, breaker_outcome).await {
                    tracing::error!(error = %e, "failed to record circuit breaker outcome");
                }
                result
            })
            .await
    })
    .await;

    match outcome {
        Ok(ChargeOutcome::Captured { provider_charge_id }) => {
            if let Err(e) = event_log
                .append(order_id, OrderEventType::PaymentCharged, json!({"provider_charge_id": provider_charge_id}))
                .await
            {
                tracing::error!(%order_id, error = %e, "failed to record payment-charged event");
            }
            Ok(())
        }
        Ok(ChargeOutcome::Declined { reason_code }) => {
            tracing::warn!(%order_id, reason_code, "payment declined");
            if let Err(e) = event_log.append(order_id, OrderEventType::PaymentFailed, json!({"reason": reason_code})).await {
                tracing::error!(%order_id, error = %e, "failed to record payment-failed event");
            }
            Err(())
        }
        Err(e) => {
            tracing::error!(%order_id, error = %e, "charge step exhausted retries");
            if let Err(e) = event_log.append(order_id, OrderEventType::PaymentFailed, json!({"reason": "UNAVAILABLE"})).await {
                tracing::error!(%order_id, error = %e, "failed to record payment-failed event");
            }
            Err(())
        }
    }
}

/// Step 3: confirm the order, closing out the SAGA. Confirm has no
/// external dependency of its own — the work is the ledger-guarded
/// transition itself, which is what makes re-delivery of a `confirm`
/// instruction after a crash a safe no-op.
async fn confirm_step<S: RecordStore>(order_id: OrderId, event_log: &EventLog<S>, ledger: &IdempotencyLedger<S>) -> Result<(), ()> {
    let policy = StepPolicy::CONFIRM;
    let step_id = format!("saga:{order_id}:confirm");

    let result = retry_step(policy, || ledger.run(&step_id, SAGA_STEP_LEDGER_TTL, || async { Ok::<(), CloudFlowError>(()) })).await;

    match result {
        Ok(()) => {
            if let Err(e) = event_log.append(order_id, OrderEventType::OrderConfirmed, json!({})).await {
                tracing::error!(%order_id, error = %e, "failed to record order-confirmed event");
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!(%order_id, error = %e, "confirm step exhausted retries");
            Err(())
        }
    }
}

/// Retries `f` per `policy`: backs off with jitter between attempts,
/// bounds each attempt with `policy.timeout`, and stops as soon as an
/// error classifies as non-retryable. Returns the first success, or the
/// last error once either the retry budget or retryability is exhausted.
async fn retry_step<T, E, F, Fut>(policy: StepPolicy, mut f: F) -> Result<T, LedgerError<E>>
where
    E: Classify,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, LedgerError<E>>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match timeout(policy.timeout, f()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(LedgerError::InProgressConflict { retry_after: policy.timeout }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && is_retryable(&err) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(attempt, ?delay, "step attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_retryable<E: Classify>(err: &LedgerError<E>) -> bool {
    match err {
        LedgerError::Operation(e) => e.is_retryable(),
        LedgerError::Store(_) | LedgerError::InProgressConflict { .. } => true,
        LedgerError::Corrupt { .. } => false,
    }
}

async fn compensate<S: RecordStore>(order_id: OrderId, reservations: &[ReservationId], event_log: &EventLog<S>, inventory: &InventoryEngine<S>) {
    for reservation_id in reservations {
        release_with_unlimited_retry(*reservation_id, inventory).await;
        if let Err(e) = event_log
            .append(order_id, OrderEventType::StockReleased, json!({"reservation_id": reservation_id.to_string()}))
            .await
        {
            tracing::error!(%order_id, error = %e, "failed to record stock-released event");
        }
    }

    if let Err(e) = event_log.append(order_id, OrderEventType::OrderCompensated, json!({})).await {
        tracing::error!(%order_id, error = %e, "failed to record order-compensated event");
    }
}

/// `spec.md` §4.6: "unlimited retries and exponential backoff" for release
/// during compensation — "must succeed; the guarantee ... depends on
/// this". Backoff is the reserve step's shape, capped at 30s between
/// attempts so a prolonged store outage doesn't spin unboundedly fast; the
/// reservation's own TTL is the documented final backstop.
async fn release_with_unlimited_retry<S: RecordStore>(reservation_id: ReservationId, inventory: &InventoryEngine<S>) {
    let mut attempt = 0usize;
    loop {
        match inventory.release(reservation_id).await {
            Ok(()) => return,
            Err(InventoryError::ReleaseAfterConsume { .. }) => {
                tracing::error!(%reservation_id, "release during compensation found reservation already consumed");
                return;
            }
            Err(e) => {
                let delay = StepPolicy::RESERVE.delay_for_attempt(attempt).min(Duration::from_secs(30));
                tracing::warn!(%reservation_id, error = %e, attempt, ?delay, "release failed during compensation, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn fail_order<S: RecordStore>(order_id: OrderId, event_log: &EventLog<S>, payload: serde_json::Value) {
    if let Err(e) = event_log.append(order_id, OrderEventType::OrderFailed, payload).await {
        tracing::error!(%order_id, error = %e, "failed to record order-failed event");
    }
}

async fn notify(sink: &dyn NotificationSink, message_type: &'static str, order_id: OrderId, correlation_id: CorrelationId, summary: &OrderSummary) {
    let notification = Notification {
        message_type,
        order_id: order_id.to_string(),
        correlation_id: correlation_id.to_string(),
        customer_id: summary.customer_id.to_string(),
    };
    if let Err(e) = sink.enqueue(notification).await {
        tracing::error!(%order_id, error = %e, "failed to enqueue notification");
    }
}
