//! # CloudFlow Core
//!
//! Shared domain types for the CloudFlow SAGA coordination core: opaque
//! identifiers, money in integer minor units, the cross-component error
//! taxonomy, the `Clock` dependency-injection trait, and the
//! `PaymentProvider`/`NotificationSink` port traits the orchestrator is
//! constructed against.
//!
//! Every other `cloudflow-*` crate depends on this one and nothing else in
//! the workspace; it performs no I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod ids;
pub mod money;
pub mod ports;

pub use chrono::{DateTime, Utc};
pub use error::{CloudFlowError, ErrorKind};

/// Clock trait — abstracts time operations for testability.
///
/// Production code reads the system clock; tests inject a fixed clock so
/// that retry backoff, TTL expiry, and circuit breaker cooldowns are
/// deterministic.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
