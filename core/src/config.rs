//! Environment-variable configuration.
//!
//! The teacher wires `DATABASE_URL` straight from `std::env::var` in its
//! binaries and has no configuration-file crate anywhere in the workspace
//! (`examples/order-processing/src/main.rs`). This crate follows the same
//! convention: one small struct read from the environment, everything else
//! passed explicitly as constructor parameters and builder calls.

/// Storage backend configuration, read from the environment.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// `DATABASE_URL`, if set. When absent, callers fall back to the
    /// in-memory `RecordStore` (`cloudflow-store-memory`), the same
    /// fallback the teacher's `order-processing` example uses for its
    /// event store.
    pub database_url: Option<String>,
}

impl StoreConfig {
    /// Reads configuration from process environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_url_yields_none() {
        let cfg = StoreConfig { database_url: None };
        assert!(cfg.database_url.is_none());
    }
}
