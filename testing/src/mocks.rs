//! Mock implementations of the injected dependency traits.

use chrono::{DateTime, Utc};
use cloudflow_core::ports::{ChargeOutcome, ChargeRequest, Notification, NotificationSink, PaymentProvider};
use cloudflow_core::{CloudFlowError, Clock};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// Fixed clock for deterministic tests.
///
/// Always returns the same time, the same way `composable_rust_testing::mocks::FixedClock`
/// does for the teacher's `Clock` trait.
///
/// # Example
///
/// ```
/// use cloudflow_testing::FixedClock;
/// use cloudflow_core::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Creates a fixed clock always returning `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// A default fixed clock for tests (2025-01-01 00:00:00 UTC).
///
/// # Panics
///
/// Panics if the hardcoded timestamp fails to parse, which never happens
/// in practice.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc),
    )
}

/// A scripted response for [`FakePaymentProvider`].
#[derive(Debug, Clone)]
pub enum ScriptedCharge {
    /// The charge is captured.
    Captured {
        /// Provider-assigned charge identifier to return.
        provider_charge_id: String,
    },
    /// The charge is declined.
    Declined {
        /// Decline reason code to return.
        reason_code: String,
    },
    /// The call fails as if the provider were transiently unreachable.
    Unavailable,
}

/// A scriptable [`PaymentProvider`] fake. Each call to `charge` consumes
/// the next entry in the script (in order); once exhausted, the last entry
/// repeats. Every request received is recorded for assertions.
pub struct FakePaymentProvider {
    script: Mutex<Vec<ScriptedCharge>>,
    received: Mutex<Vec<ChargeRequest>>,
}

impl FakePaymentProvider {
    /// Builds a fake that always returns `outcome`.
    #[must_use]
    pub fn always(outcome: ScriptedCharge) -> Self {
        Self::scripted(vec![outcome])
    }

    /// Builds a fake that returns each entry in `script` in order, in
    /// response to successive `charge` calls, repeating the last entry
    /// once exhausted.
    #[must_use]
    pub fn scripted(script: Vec<ScriptedCharge>) -> Self {
        Self {
            script: Mutex::new(script),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Returns every request this fake has received, in call order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned, which only happens if a
    /// prior call panicked while holding the lock.
    #[must_use]
    pub fn received(&self) -> Vec<ChargeRequest> {
        self.received.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl PaymentProvider for FakePaymentProvider {
    fn charge(&self, request: ChargeRequest) -> Pin<Box<dyn Future<Output = Result<ChargeOutcome, CloudFlowError>> + Send + '_>> {
        Box::pin(async move {
            self.received.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(request);

            let mut script = self.script.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let next = if script.len() > 1 { script.remove(0) } else { script.first().cloned().unwrap_or(ScriptedCharge::Unavailable) };

            match next {
                ScriptedCharge::Captured { provider_charge_id } => Ok(ChargeOutcome::Captured { provider_charge_id }),
                ScriptedCharge::Declined { reason_code } => Ok(ChargeOutcome::Declined { reason_code }),
                ScriptedCharge::Unavailable => Err(CloudFlowError::Unavailable { details: "fake payment provider: unavailable".into() }),
            }
        })
    }
}

/// A [`NotificationSink`] fake that captures every enqueued notification.
#[derive(Default)]
pub struct FakeNotificationSink {
    sent: Mutex<Vec<Notification>>,
}

impl FakeNotificationSink {
    /// Builds an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every notification enqueued so far, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl NotificationSink for FakeNotificationSink {
    fn enqueue(&self, notification: Notification) -> Pin<Box<dyn Future<Output = Result<(), CloudFlowError>> + Send + '_>> {
        Box::pin(async move {
            self.sent.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(notification);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_always_returns_same_time() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[tokio::test]
    async fn fake_payment_provider_replays_scripted_outcomes_in_order() {
        let provider = FakePaymentProvider::scripted(vec![
            ScriptedCharge::Unavailable,
            ScriptedCharge::Captured { provider_charge_id: "ch_1".into() },
        ]);
        let request = ChargeRequest {
            idempotency_key: "k1".into(),
            amount_minor_units: cloudflow_core::money::MinorUnits::new(100),
            currency: "USD".into(),
            metadata: serde_json::json!({}),
        };

        let first = provider.charge(request.clone()).await;
        assert!(first.is_err());

        let second = provider.charge(request).await.unwrap();
        assert!(matches!(second, ChargeOutcome::Captured { .. }));
        assert_eq!(provider.received().len(), 2);
    }

    #[tokio::test]
    async fn fake_notification_sink_captures_every_message() {
        let sink = FakeNotificationSink::new();
        sink.enqueue(Notification {
            message_type: "ORDER_CONFIRMED",
            order_id: "o1".into(),
            correlation_id: "c1".into(),
            customer_id: "cust1".into(),
        })
        .await
        .unwrap();

        assert_eq!(sink.sent().len(), 1);
    }
}
