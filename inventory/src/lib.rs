//! Inventory Engine.
//!
//! Conditional-decrement reservation and unconditional-increment release
//! over the shared [`RecordStore`] (`spec.md` §4.4). Grounded in the
//! teacher's `checkout-saga` example `InventoryReducer`
//! (reserve/release/insufficient-inventory shape), redone against real
//! conditional arithmetic instead of an in-process `HashMap`, and with
//! `reserve` wrapped in the Idempotency Ledger so a retried SAGA step never
//! double-decrements stock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use cloudflow_core::ids::{OrderId, ProductId, ReservationId};
use cloudflow_idempotency::{Classify, IdempotencyLedger, LedgerError};
use cloudflow_store::{AddGuard, Consistency, RecordKey, RecordStore, RecordStoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The idempotency record TTL used for `reserve` (`spec.md` §3
/// `IdempotencyRecord` default TTL: 24h).
const RESERVE_LEDGER_TTL: Duration = Duration::from_secs(24 * 3600);

/// State of a [`Reservation`] (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    /// Stock is decremented and held against this reservation.
    Held,
    /// Stock has been returned; terminal.
    Released,
    /// The SAGA succeeded; stock was consumed, not returned; terminal.
    Consumed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reservation {
    order_id: OrderId,
    product_id: ProductId,
    quantity: i64,
    state: ReservationState,
    created_at: DateTime<Utc>,
}

/// Errors from the Inventory Engine (`spec.md` §4.4, §7).
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum InventoryError {
    /// `reserve` could not be satisfied at the observed stock level.
    /// Non-retryable: short-circuits the SAGA to `FAILED`.
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// The product that ran out of stock.
        product_id: String,
        /// Quantity requested.
        requested: i64,
        /// Quantity observed available at decision time.
        available: i64,
    },

    /// `release` was called on a reservation already `CONSUMED`.
    /// Non-retryable: this is a caller bug, not a transient condition.
    #[error("cannot release reservation {reservation_id}: already consumed")]
    ReleaseAfterConsume {
        /// The offending reservation.
        reservation_id: String,
    },

    /// The reservation does not exist.
    #[error("no such reservation: {0}")]
    NotFound(String),

    /// Transient infrastructure failure. Retryable.
    #[error("inventory store unavailable: {0}")]
    Unavailable(String),
}

impl Classify for InventoryError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<RecordStoreError> for InventoryError {
    fn from(e: RecordStoreError) -> Self {
        match e {
            RecordStoreError::Unavailable(details) => Self::Unavailable(details),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

fn inventory_key(product_id: &ProductId) -> RecordKey {
    RecordKey::new(format!("inventory:{product_id}"))
}

fn reservation_key(reservation_id: ReservationId) -> RecordKey {
    RecordKey::new(format!("reservation:{reservation_id}"))
}

/// Atomic reservation of stock, backed by a shared [`RecordStore`]
/// (`spec.md` §4.4).
pub struct InventoryEngine<S> {
    store: Arc<S>,
    ledger: Arc<IdempotencyLedger<S>>,
    /// How long a `HELD` reservation lives before its TTL serves as the
    /// compensation backstop (`spec.md` §4.6 "Compensation").
    reservation_ttl: Duration,
}

impl<S: RecordStore> InventoryEngine<S> {
    /// Builds an engine over `store`, sharing `ledger` with every other
    /// idempotency-wrapped operation in the workspace.
    pub fn new(store: Arc<S>, ledger: Arc<IdempotencyLedger<S>>, reservation_ttl: Duration) -> Self {
        Self { store, ledger, reservation_ttl }
    }

    /// Reserves `quantity` units of `product_id` for `order_id`.
    ///
    /// Wrapped in the Idempotency Ledger under
    /// `key = "reserve:" + saga_step_id`, so re-invocation on retry returns
    /// the same [`ReservationId`] instead of double-decrementing stock.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::InsufficientStock`] (wrapped in
    /// [`LedgerError::Operation`]) if fewer than `quantity` units are
    /// available, or a ledger/store error on infrastructure failure.
    pub async fn reserve(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        quantity: i64,
        saga_step_id: &str,
    ) -> Result<ReservationId, LedgerError<InventoryError>> {
        let store = Arc::clone(&self.store);
        let ttl = self.reservation_ttl;
        let key = format!("reserve:{saga_step_id}");

        self.ledger
            .run(&key, RESERVE_LEDGER_TTL, move || {
                let product_id = product_id.clone();
                async move { Self::do_reserve(&store, order_id, product_id, quantity, ttl).await }
            })
            .await
    }

    async fn do_reserve(
        store: &S,
        order_id: OrderId,
        product_id: ProductId,
        quantity: i64,
        ttl: Duration,
    ) -> Result<ReservationId, InventoryError> {
        let stock_key = inventory_key(&product_id);
        match store.add(stock_key.clone(), "available", -quantity, Some(AddGuard::non_negative())).await {
            Ok(_) => {
                let reservation_id = ReservationId::new();
                let reservation = Reservation {
                    order_id,
                    product_id: product_id.clone(),
                    quantity,
                    state: ReservationState::Held,
                    created_at: Utc::now(),
                };
                store
                    .put_if_absent(reservation_key(reservation_id), json!(reservation), Some(ttl))
                    .await?;

                tracing::info!(%order_id, %product_id, quantity, %reservation_id, "inventory reserved");
                metrics::counter!("inventory.reserved", "product_id" => product_id.to_string()).increment(1);
                Ok(reservation_id)
            }
            Err(RecordStoreError::GuardFailed(_)) => {
                let available = store
                    .get(stock_key, Consistency::Eventual)
                    .await?
                    .and_then(|r| r.value.get("available").and_then(serde_json::Value::as_i64))
                    .unwrap_or(0);

                tracing::warn!(%product_id, quantity, available, "insufficient stock");
                Err(InventoryError::InsufficientStock {
                    product_id: product_id.to_string(),
                    requested: quantity,
                    available,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Releases a `HELD` reservation, returning its quantity to available
    /// stock. Idempotent: releasing an already-`RELEASED` reservation
    /// succeeds without effect.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::ReleaseAfterConsume`] (non-retryable) if
    /// the reservation was already consumed, or
    /// [`InventoryError::Unavailable`] on transient failure.
    pub async fn release(&self, reservation_id: ReservationId) -> Result<(), InventoryError> {
        let key = reservation_key(reservation_id);

        loop {
            let record = self
                .store
                .get(key.clone(), Consistency::Strong)
                .await?
                .ok_or_else(|| InventoryError::NotFound(reservation_id.to_string()))?;
            let reservation: Reservation = serde_json::from_value(record.value.clone())
                .map_err(|e| InventoryError::Unavailable(e.to_string()))?;

            match reservation.state {
                ReservationState::Released => return Ok(()),
                ReservationState::Consumed => {
                    return Err(InventoryError::ReleaseAfterConsume { reservation_id: reservation_id.to_string() });
                }
                ReservationState::Held => {
                    self.store
                        .add(inventory_key(&reservation.product_id), "available", reservation.quantity, None)
                        .await?;

                    let next = Reservation { state: ReservationState::Released, ..reservation };
                    match self.store.compare_and_set(key.clone(), record.version, json!(next)).await {
                        Ok(_) => {
                            tracing::info!(%reservation_id, "inventory released");
                            metrics::counter!("inventory.released").increment(1);
                            return Ok(());
                        }
                        Err(RecordStoreError::VersionMismatch { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Marks a `HELD` reservation `CONSUMED`, called by the orchestrator on
    /// SAGA success to close the reservation without returning stock.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Unavailable`] on transient failure.
    pub async fn consume(&self, reservation_id: ReservationId) -> Result<(), InventoryError> {
        let key = reservation_key(reservation_id);

        loop {
            let record = self
                .store
                .get(key.clone(), Consistency::Strong)
                .await?
                .ok_or_else(|| InventoryError::NotFound(reservation_id.to_string()))?;
            let reservation: Reservation = serde_json::from_value(record.value.clone())
                .map_err(|e| InventoryError::Unavailable(e.to_string()))?;

            if matches!(reservation.state, ReservationState::Consumed) {
                return Ok(());
            }

            let next = Reservation { state: ReservationState::Consumed, ..reservation };
            match self.store.compare_and_set(key.clone(), record.version, json!(next)).await {
                Ok(_) => {
                    tracing::info!(%reservation_id, "inventory consumed");
                    metrics::counter!("inventory.consumed").increment(1);
                    return Ok(());
                }
                Err(RecordStoreError::VersionMismatch { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudflow_idempotency::LedgerConfig;
    use cloudflow_store_memory::InMemoryRecordStore;

    fn engine() -> InventoryEngine<InMemoryRecordStore> {
        let store = Arc::new(InMemoryRecordStore::new());
        let ledger = Arc::new(IdempotencyLedger::new(Arc::clone(&store), LedgerConfig::default()));
        InventoryEngine::new(store, ledger, Duration::from_secs(3600))
    }

    async fn seed(engine: &InventoryEngine<InMemoryRecordStore>, product_id: &ProductId, available: i64) {
        engine.store.put_if_absent(inventory_key(product_id), json!({"available": available}), None).await.unwrap();
    }

    #[tokio::test]
    async fn reserve_decrements_and_release_restores() {
        let engine = engine();
        let product_id = ProductId::new("KEYBD-01");
        seed(&engine, &product_id, 10).await;

        let reservation_id = engine.reserve(OrderId::new(), product_id.clone(), 3, "step-1").await.unwrap();
        let available = engine.store.get(inventory_key(&product_id), Consistency::Strong).await.unwrap().unwrap();
        assert_eq!(available.value["available"], 7);

        engine.release(reservation_id).await.unwrap();
        let available = engine.store.get(inventory_key(&product_id), Consistency::Strong).await.unwrap().unwrap();
        assert_eq!(available.value["available"], 10);
    }

    #[tokio::test]
    async fn reserve_more_than_available_is_insufficient_stock() {
        let engine = engine();
        let product_id = ProductId::new("WEBCAM-4K");
        seed(&engine, &product_id, 1).await;

        let err = engine.reserve(OrderId::new(), product_id, 2, "step-1").await.unwrap_err();
        match err {
            LedgerError::Operation(InventoryError::InsufficientStock { requested, available, .. }) => {
                assert_eq!(requested, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reserve_exactly_available_succeeds() {
        let engine = engine();
        let product_id = ProductId::new("WEBCAM-4K");
        seed(&engine, &product_id, 1).await;

        engine.reserve(OrderId::new(), product_id.clone(), 1, "step-1").await.unwrap();
        let available = engine.store.get(inventory_key(&product_id), Consistency::Strong).await.unwrap().unwrap();
        assert_eq!(available.value["available"], 0);
    }

    #[tokio::test]
    async fn retried_step_id_returns_same_reservation() {
        let engine = engine();
        let product_id = ProductId::new("KEYBD-01");
        seed(&engine, &product_id, 10).await;

        let first = engine.reserve(OrderId::new(), product_id.clone(), 3, "step-1").await.unwrap();
        let second = engine.reserve(OrderId::new(), product_id.clone(), 3, "step-1").await.unwrap();
        assert_eq!(first, second);

        let available = engine.store.get(inventory_key(&product_id), Consistency::Strong).await.unwrap().unwrap();
        assert_eq!(available.value["available"], 7);
    }

    #[tokio::test]
    async fn release_after_consume_is_rejected() {
        let engine = engine();
        let product_id = ProductId::new("KEYBD-01");
        seed(&engine, &product_id, 10).await;

        let reservation_id = engine.reserve(OrderId::new(), product_id, 1, "step-1").await.unwrap();
        engine.consume(reservation_id).await.unwrap();

        let err = engine.release(reservation_id).await.unwrap_err();
        assert!(matches!(err, InventoryError::ReleaseAfterConsume { .. }));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let engine = engine();
        let product_id = ProductId::new("KEYBD-01");
        seed(&engine, &product_id, 10).await;

        let reservation_id = engine.reserve(OrderId::new(), product_id, 1, "step-1").await.unwrap();
        engine.release(reservation_id).await.unwrap();
        engine.release(reservation_id).await.unwrap();
    }

    proptest::proptest! {
        #[test]
        fn reserve_then_release_conserves_available(available in 1i64..1000, quantity in 1i64..1000) {
            let quantity = quantity.min(available);
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let engine = engine();
                let product_id = ProductId::new("PROP-1");
                seed(&engine, &product_id, available).await;

                let reservation_id = engine.reserve(OrderId::new(), product_id.clone(), quantity, "step-1").await.unwrap();
                engine.release(reservation_id).await.unwrap();

                let record = engine.store.get(inventory_key(&product_id), Consistency::Strong).await.unwrap().unwrap();
                prop_assert_eq!(record.value["available"], json!(available));
                Ok(())
            })?;
        }
    }
}
