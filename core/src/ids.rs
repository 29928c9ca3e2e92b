//! Opaque identifier newtypes.
//!
//! Each identity in `spec.md` §3 gets its own newtype instead of a bare
//! `String`/`Uuid`, so the compiler rejects an `OrderId` passed where a
//! `ReservationId` is expected. Construction and display follow the same
//! shape as the teacher's `AccountId`/`TransferId` in its banking example.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID (e.g. one supplied by a caller at
            /// ingress, or read back from storage).
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

opaque_id!(OrderId, "Unique identifier for an order (`spec.md` §3 Order).");
opaque_id!(
    ReservationId,
    "Unique identifier for an inventory reservation (`spec.md` §3 Reservation)."
);
opaque_id!(
    CorrelationId,
    "Opaque identifier propagated to every step, event, log line, and outbound message (`spec.md` §4.6)."
);

macro_rules! string_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from any string-like value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(ProductId, "Identifier for an inventory item (`spec.md` §3 InventoryItem `product_id: string`), a caller-chosen SKU rather than a generated ID.");
string_id!(
    CustomerId,
    "Identifier for a customer (`spec.md` §6 `customer_id: non-empty string`), supplied by the ingress caller rather than generated."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ids_are_distinct() {
        assert_ne!(OrderId::new(), OrderId::new());
    }

    #[test]
    fn order_id_roundtrips_through_display_and_parse() {
        let id = OrderId::new();
        let parsed: OrderId = id.to_string().parse().expect("valid uuid");
        assert_eq!(id, parsed);
    }

    #[test]
    fn product_id_compares_by_value() {
        assert_eq!(ProductId::new("KEYBD-01"), ProductId::from("KEYBD-01"));
    }
}
