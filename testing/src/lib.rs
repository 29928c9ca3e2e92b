//! # CloudFlow Testing
//!
//! Test doubles shared across every `cloudflow-*` crate's test suite:
//! a deterministic clock, scriptable fakes for the two injected ports
//! (`PaymentProvider`, `NotificationSink`), and a `RecordStore`
//! conformance suite run against both the in-memory and Postgres
//! backends.
//!
//! Mirrors the teacher's `composable-rust-testing` crate in shape and
//! purpose — `mocks::FixedClock` is carried over almost verbatim.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod conformance;
pub mod mocks;

pub use mocks::{FakeNotificationSink, FakePaymentProvider, FixedClock, test_clock};
