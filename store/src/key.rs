//! Record key type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A key into the Record Store.
///
/// Every component in this workspace builds its own key namespace by
/// formatting into this newtype (`"reserve:" + saga_step_id`,
/// `"saga:" + order_id + ":" + step_name`, `(order_id, seq)`, ...), the same
/// role the teacher's `StreamId` plays for event streams.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey(String);

impl RecordKey {
    /// Creates a new key from any string-like value.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_compare_by_value() {
        assert_eq!(RecordKey::new("a"), RecordKey::from("a".to_string()));
    }
}
