//! External interfaces (`spec.md` §6): the `SubmitOrder` ingress command and
//! the `GetOrder` query. Server-side input validation is a single parsing
//! step that either yields a fully-typed, normalized command or a
//! `VALIDATION` error; internal components never re-validate (`spec.md` §9
//! "Schema-validation objects → typed request model").

use chrono::{DateTime, Utc};
use cloudflow_core::error::CloudFlowError;
use cloudflow_core::ids::{CorrelationId, CustomerId, OrderId, ProductId};
use cloudflow_core::money::{LineItem, MinorUnits};
use cloudflow_event_log::OrderStatus;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A single requested line item, as received at ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemInput {
    /// The product being purchased.
    pub product_id: String,
    /// Quantity requested.
    pub quantity: i64,
    /// Unit price, in integer minor units.
    pub unit_price_minor_units: i64,
}

/// The `SubmitOrder` ingress command (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOrder {
    /// Generated if absent.
    pub order_id: Option<String>,
    /// Must be non-empty.
    pub customer_id: String,
    /// Generated if absent.
    pub correlation_id: Option<String>,
    /// Must be non-empty; every item's `quantity` and
    /// `unit_price_minor_units` must be ≥ 1.
    pub items: Vec<ItemInput>,
}

/// A validated, normalized `SubmitOrder`. Internal components only ever see
/// this type, never the raw ingress command.
#[derive(Debug, Clone)]
pub struct ValidatedOrder {
    /// The order's identifier (generated if the caller didn't supply one).
    pub order_id: OrderId,
    /// The customer placing the order.
    pub customer_id: CustomerId,
    /// Propagated correlation identifier.
    pub correlation_id: CorrelationId,
    /// Normalized line items.
    pub items: Vec<LineItem>,
    /// Server-computed total (`spec.md` §6: client-supplied totals are
    /// always ignored).
    pub total_minor_units: MinorUnits,
}

/// Validates and normalizes a raw [`SubmitOrder`] command.
///
/// # Errors
///
/// Returns [`CloudFlowError::Validation`] if `customer_id` is empty,
/// `items` is empty, or any item's `quantity` or
/// `unit_price_minor_units` is less than 1.
pub fn validate(command: SubmitOrder) -> Result<ValidatedOrder, CloudFlowError> {
    if command.customer_id.trim().is_empty() {
        return Err(CloudFlowError::Validation { details: "customer_id must not be empty".into() });
    }
    if command.items.is_empty() {
        return Err(CloudFlowError::Validation { details: "items must not be empty".into() });
    }

    let mut items = Vec::with_capacity(command.items.len());
    for (index, item) in command.items.into_iter().enumerate() {
        if item.quantity < 1 {
            return Err(CloudFlowError::Validation { details: format!("items[{index}].quantity must be >= 1") });
        }
        if item.unit_price_minor_units < 1 {
            return Err(CloudFlowError::Validation {
                details: format!("items[{index}].unit_price_minor_units must be >= 1"),
            });
        }
        items.push(LineItem {
            product_id: ProductId::new(item.product_id),
            quantity: item.quantity,
            unit_price_minor_units: MinorUnits::new(item.unit_price_minor_units),
        });
    }

    let order_id = match command.order_id {
        Some(raw) => OrderId::from_str(&raw).map_err(|e| CloudFlowError::Validation { details: format!("invalid order_id: {e}") })?,
        None => OrderId::new(),
    };
    let correlation_id = match command.correlation_id {
        Some(raw) => {
            CorrelationId::from_str(&raw).map_err(|e| CloudFlowError::Validation { details: format!("invalid correlation_id: {e}") })?
        }
        None => CorrelationId::new(),
    };

    let total_minor_units = cloudflow_core::money::compute_total(&items);

    Ok(ValidatedOrder {
        order_id,
        customer_id: CustomerId::new(command.customer_id),
        correlation_id,
        items,
        total_minor_units,
    })
}

/// Response to a successfully accepted `SubmitOrder`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accepted {
    /// The order's identifier.
    pub order_id: String,
    /// Always `"PENDING"` — submission never waits for the SAGA to finish.
    pub status: &'static str,
}

/// Response to a single event in a [`GetOrderResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    /// Position in the order's log.
    pub seq: u64,
    /// The event's kind, as a stable string.
    pub event_type: String,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// Response to a `GetOrder` query (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOrderResponse {
    /// The order's identifier.
    pub order_id: String,
    /// Current status.
    pub status: OrderStatus,
    /// The customer who placed the order.
    pub customer_id: String,
    /// Server-computed total.
    pub total_minor_units: i64,
    /// Propagated correlation identifier.
    pub correlation_id: String,
    /// The order's event history in `seq` order.
    pub events: Vec<EventSummary>,
}
