//! Event subscriptions
//!
//! - [`SubscriptionRegistry`]: active subscriptions keyed by SID, at most one
//!   per service, plus the set of services whose subscription expired
//! - [`RenewalScheduler`]: background loop renewing subscriptions before they
//!   expire and evicting failed or orphaned ones

mod registry;
mod renewal;

pub use registry::SubscriptionRegistry;
pub use renewal::{ExpiryReason, RenewalScheduler, SubscriptionOwner};

use std::time::{Duration, Instant};

use crate::device::ServiceRef;

/// Bounds applied to every granted timeout
const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_TIMEOUT: Duration = Duration::from_secs(86_400);

/// One active GENA subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// SID assigned by the publisher
    pub id: String,
    pub service: ServiceRef,
    /// Duration granted by the publisher
    pub timeout: Duration,
    pub started_at: Instant,
    /// When the renewal scheduler renews this subscription
    pub renew_at: Instant,
    pub expires_at: Instant,
    pub keep_renewing: bool,
    /// Consecutive failed renewals
    pub failure_count: u32,
    /// Event key expected on the next NOTIFY
    pub next_seq: u32,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        service: ServiceRef,
        timeout: Duration,
        keep_renewing: bool,
        renewal_margin: Duration,
        now: Instant,
    ) -> Self {
        let mut subscription = Self {
            id,
            service,
            timeout,
            started_at: now,
            renew_at: now,
            expires_at: now,
            keep_renewing,
            failure_count: 0,
            next_seq: 0,
        };
        subscription.refresh(timeout, renewal_margin, now);
        subscription
    }

    /// Restart the lifetime from `now` with the `timeout` just granted
    pub(crate) fn refresh(&mut self, timeout: Duration, renewal_margin: Duration, now: Instant) {
        let timeout = timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        self.timeout = timeout;
        self.started_at = now;
        self.expires_at = now.checked_add(timeout).unwrap_or(now);
        self.renew_at = self.expires_at - renewal_lead(timeout, renewal_margin);
        self.failure_count = 0;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Time left before the publisher drops the subscription
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// How long before expiry a renewal is attempted.
///
/// A margin of zero, or one reaching the timeout, falls back to half the
/// timeout so `renew_at` always precedes `expires_at`.
pub(crate) fn renewal_lead(timeout: Duration, margin: Duration) -> Duration {
    if margin.is_zero() || margin >= timeout {
        timeout / 2
    } else {
        margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn service() -> ServiceRef {
        ServiceRef {
            device_udn: "uuid:device".to_string(),
            service_id: "urn:upnp-org:serviceId:AVTransport".to_string(),
            service_type: "urn:schemas-upnp-org:service:AVTransport:1".to_string(),
            event_sub_url: "http://10.0.0.5/avt/event".to_string(),
            control_url: "http://10.0.0.5/avt/control".to_string(),
        }
    }

    #[rstest]
    #[case(300, 10, 10)]
    #[case(300, 0, 150)]
    #[case(10, 10, 5)]
    #[case(10, 30, 5)]
    fn test_renewal_lead(#[case] timeout: u64, #[case] margin: u64, #[case] expected: u64) {
        assert_eq!(
            renewal_lead(Duration::from_secs(timeout), Duration::from_secs(margin)),
            Duration::from_secs(expected)
        );
    }

    #[test]
    fn test_new_subscription_schedules_renewal_before_expiry() {
        let now = Instant::now();
        let subscription = Subscription::new(
            "uuid:sid-1".to_string(),
            service(),
            Duration::from_secs(300),
            true,
            Duration::from_secs(10),
            now,
        );

        assert_eq!(subscription.expires_at, now + Duration::from_secs(300));
        assert_eq!(subscription.renew_at, now + Duration::from_secs(290));
        assert_eq!(subscription.remaining(now), Duration::from_secs(300));
        assert!(!subscription.is_expired(now + Duration::from_secs(299)));
        assert!(subscription.is_expired(now + Duration::from_secs(300)));
    }

    #[test]
    fn test_zero_timeout_is_treated_as_one_second() {
        let now = Instant::now();
        let subscription = Subscription::new(
            "uuid:sid-1".to_string(),
            service(),
            Duration::ZERO,
            true,
            Duration::from_secs(10),
            now,
        );
        assert_eq!(subscription.timeout, Duration::from_secs(1));
        assert!(subscription.renew_at < subscription.expires_at);
    }

    #[test]
    fn test_huge_timeout_is_clamped() {
        let now = Instant::now();
        let mut subscription = Subscription::new(
            "uuid:sid-1".to_string(),
            service(),
            Duration::from_secs(u64::MAX),
            true,
            Duration::from_secs(10),
            now,
        );
        assert_eq!(subscription.timeout, MAX_TIMEOUT);
        assert_eq!(subscription.expires_at, now + MAX_TIMEOUT);
        assert_eq!(subscription.renew_at, now + MAX_TIMEOUT - Duration::from_secs(10));

        subscription.refresh(Duration::MAX, Duration::from_secs(10), now);
        assert_eq!(subscription.timeout, MAX_TIMEOUT);
    }

    proptest! {
        #[test]
        fn prop_renew_at_precedes_expiry(timeout_ms in 0u64..10_000_000, margin_ms in 0u64..10_000_000) {
            let now = Instant::now();
            let subscription = Subscription::new(
                "uuid:sid".to_string(),
                service(),
                Duration::from_millis(timeout_ms),
                true,
                Duration::from_millis(margin_ms),
                now,
            );
            prop_assert!(subscription.renew_at < subscription.expires_at);
            prop_assert!(subscription.renew_at >= now);
        }
    }
}
