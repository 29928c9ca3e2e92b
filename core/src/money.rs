//! Money as integer minor units.
//!
//! `spec.md` §6: "All monetary amounts are integer minor units; floating
//! point is never used for money." `MinorUnits` is a thin newtype over
//! `i64` so a raw `i64` quantity and a money amount can never be passed to
//! the wrong parameter by accident.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;

/// An amount of money expressed in integer minor units (e.g. cents).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinorUnits(i64);

impl MinorUnits {
    /// Wraps a raw minor-unit amount.
    #[must_use]
    pub const fn new(amount: i64) -> Self {
        Self(amount)
    }

    /// Returns the raw minor-unit amount.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// `spec.md` §3: `total_minor_units ≥ 1`.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 >= 1
    }
}

impl fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for MinorUnits {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sum for MinorUnits {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|m| m.0).sum())
    }
}

/// A single line item on an order, as carried on `SubmitOrder` (`spec.md`
/// §6) and summed to produce `total_minor_units` server-side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// The product being purchased.
    pub product_id: crate::ids::ProductId,
    /// Quantity requested, must be ≥ 1.
    pub quantity: i64,
    /// Unit price in minor units, must be ≥ 1.
    pub unit_price_minor_units: MinorUnits,
}

impl LineItem {
    /// Total contribution of this line item to the order total.
    #[must_use]
    pub const fn line_total(&self) -> MinorUnits {
        MinorUnits(self.quantity * self.unit_price_minor_units.value())
    }
}

/// Computes `total_minor_units` as `Σ items[i].quantity *
/// items[i].unit_price_minor_units`, per `spec.md` §6. Any client-supplied
/// total is ignored; this is the only way a total is produced.
#[must_use]
pub fn compute_total(items: &[LineItem]) -> MinorUnits {
    items.iter().map(LineItem::line_total).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ProductId;

    #[test]
    fn total_ignores_anything_the_client_might_have_sent() {
        let items = vec![
            LineItem {
                product_id: ProductId::new("KEYBD-01"),
                quantity: 2,
                unit_price_minor_units: MinorUnits::new(8999),
            },
            LineItem {
                product_id: ProductId::new("MOUSE-01"),
                quantity: 1,
                unit_price_minor_units: MinorUnits::new(2999),
            },
        ];

        assert_eq!(compute_total(&items), MinorUnits::new(2 * 8999 + 2999));
    }

    #[test]
    fn empty_order_totals_zero() {
        assert_eq!(compute_total(&[]), MinorUnits::new(0));
    }
}
