//! Integration tests for the SAGA Orchestrator.
//!
//! Exercises `submit_order`/`get_order` end to end over an in-memory store
//! and scripted payment provider, covering the scenarios named in
//! `spec.md` §8: happy path, insufficient stock, payment declined
//! (compensation), and duplicate submission (idempotent resume).

#![allow(clippy::unwrap_used, clippy::expect_used)]

use cloudflow_event_log::OrderStatus;
use cloudflow_orchestrator::{ItemInput, Orchestrator, SubmitOrder};
use cloudflow_store::RecordKey;
use cloudflow_store_memory::InMemoryRecordStore;
use cloudflow_testing::{FakeNotificationSink, FakePaymentProvider};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn item(product_id: &str, quantity: i64, unit_price_minor_units: i64) -> ItemInput {
    ItemInput { product_id: product_id.into(), quantity, unit_price_minor_units }
}

async fn seed_stock(store: &InMemoryRecordStore, product_id: &str, available: i64) {
    use cloudflow_store::RecordStore;
    store
        .put_if_absent(RecordKey::new(format!("inventory:{product_id}")), json!({"available": available}), None)
        .await
        .unwrap();
}

async fn wait_for_terminal(orchestrator: &Arc<Orchestrator<InMemoryRecordStore>>, order_id: &str) -> OrderStatus {
    for _ in 0..200 {
        let response = orchestrator.get_order(order_id).await.unwrap();
        if matches!(response.status, OrderStatus::Confirmed | OrderStatus::Compensated | OrderStatus::Failed) {
            return response.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("order {order_id} never reached a terminal status");
}

#[tokio::test]
async fn happy_path_reserves_charges_and_confirms() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_stock(&store, "KEYBD-01", 10).await;

    let payment = Arc::new(FakePaymentProvider::always(cloudflow_testing::ScriptedCharge::Captured { provider_charge_id: "ch_1".into() }));
    let notifications = Arc::new(FakeNotificationSink::new());
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), payment, notifications.clone()));

    let accepted = orchestrator
        .submit_order(SubmitOrder {
            order_id: None,
            customer_id: "cust-1".into(),
            correlation_id: None,
            items: vec![item("KEYBD-01", 3, 1000)],
        })
        .await
        .unwrap();
    assert_eq!(accepted.status, "PENDING");

    let status = wait_for_terminal(&orchestrator, &accepted.order_id).await;
    assert_eq!(status, OrderStatus::Confirmed);

    let sent = notifications.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, "ORDER_CONFIRMED");
}

#[tokio::test]
async fn insufficient_stock_fails_without_compensation() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_stock(&store, "WEBCAM-4K", 1).await;

    let payment = Arc::new(FakePaymentProvider::always(cloudflow_testing::ScriptedCharge::Captured { provider_charge_id: "ch_1".into() }));
    let notifications = Arc::new(FakeNotificationSink::new());
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), payment, notifications.clone()));

    let accepted = orchestrator
        .submit_order(SubmitOrder {
            order_id: None,
            customer_id: "cust-1".into(),
            correlation_id: None,
            items: vec![item("WEBCAM-4K", 2, 5000)],
        })
        .await
        .unwrap();

    let status = wait_for_terminal(&orchestrator, &accepted.order_id).await;
    assert_eq!(status, OrderStatus::Failed);
    assert!(notifications.sent().is_empty(), "a failed-at-reserve order never notifies");
}

#[tokio::test]
async fn payment_declined_compensates_reservations() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_stock(&store, "KEYBD-01", 5).await;

    let payment = Arc::new(FakePaymentProvider::always(cloudflow_testing::ScriptedCharge::Declined { reason_code: "insufficient_funds".into() }));
    let notifications = Arc::new(FakeNotificationSink::new());
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), payment, notifications.clone()));

    let accepted = orchestrator
        .submit_order(SubmitOrder {
            order_id: None,
            customer_id: "cust-1".into(),
            correlation_id: None,
            items: vec![item("KEYBD-01", 2, 1000)],
        })
        .await
        .unwrap();

    let status = wait_for_terminal(&orchestrator, &accepted.order_id).await;
    assert_eq!(status, OrderStatus::Compensated);

    use cloudflow_store::{Consistency, RecordStore};
    let stock = store.get(RecordKey::new("inventory:KEYBD-01"), Consistency::Strong).await.unwrap().unwrap();
    assert_eq!(stock.value["available"], json!(5), "released stock must return to the pre-reservation level");

    let sent = notifications.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, "ORDER_COMPENSATED");
}

#[tokio::test]
async fn duplicate_submission_does_not_start_a_second_saga() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_stock(&store, "KEYBD-01", 10).await;

    let payment = Arc::new(FakePaymentProvider::always(cloudflow_testing::ScriptedCharge::Captured { provider_charge_id: "ch_1".into() }));
    let notifications = Arc::new(FakeNotificationSink::new());
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), payment, notifications.clone()));

    let command = SubmitOrder {
        order_id: Some(cloudflow_core::ids::OrderId::new().to_string()),
        customer_id: "cust-1".into(),
        correlation_id: None,
        items: vec![item("KEYBD-01", 1, 1000)],
    };

    let first = orchestrator.submit_order(command.clone()).await.unwrap();
    let second = orchestrator.submit_order(command).await.unwrap();
    assert_eq!(first.order_id, second.order_id);
    assert_eq!(second.status, "PENDING");

    let status = wait_for_terminal(&orchestrator, &first.order_id).await;
    assert_eq!(status, OrderStatus::Confirmed);

    // Exactly one reservation's worth of stock was consumed, not two.
    use cloudflow_store::{Consistency, RecordStore};
    let stock = store.get(RecordKey::new("inventory:KEYBD-01"), Consistency::Strong).await.unwrap().unwrap();
    assert_eq!(stock.value["available"], json!(9));
}

#[tokio::test]
async fn get_order_reports_full_event_history() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_stock(&store, "KEYBD-01", 10).await;

    let payment = Arc::new(FakePaymentProvider::always(cloudflow_testing::ScriptedCharge::Captured { provider_charge_id: "ch_1".into() }));
    let notifications = Arc::new(FakeNotificationSink::new());
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), payment, notifications));

    let accepted = orchestrator
        .submit_order(SubmitOrder {
            order_id: None,
            customer_id: "cust-1".into(),
            correlation_id: None,
            items: vec![item("KEYBD-01", 1, 1000)],
        })
        .await
        .unwrap();
    wait_for_terminal(&orchestrator, &accepted.order_id).await;

    let response = orchestrator.get_order(&accepted.order_id).await.unwrap();
    let kinds: Vec<String> = response.events.iter().map(|e| e.event_type.clone()).collect();
    assert_eq!(kinds, vec!["OrderCreated", "StockReserved", "PaymentCharged", "OrderConfirmed"]);
}

#[tokio::test]
async fn get_order_on_unknown_id_is_unavailable() {
    let store = Arc::new(InMemoryRecordStore::new());
    let payment = Arc::new(FakePaymentProvider::always(cloudflow_testing::ScriptedCharge::Captured { provider_charge_id: "ch_1".into() }));
    let notifications = Arc::new(FakeNotificationSink::new());
    let orchestrator = Arc::new(Orchestrator::new(store, payment, notifications));

    let err = orchestrator.get_order(&cloudflow_core::ids::OrderId::new().to_string()).await.unwrap_err();
    assert!(matches!(err, cloudflow_core::error::CloudFlowError::Unavailable { .. }));
}
