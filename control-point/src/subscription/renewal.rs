//! Renewal scheduler
//!
//! Keeps `keep_renewing` subscriptions alive and evicts the ones that can no
//! longer be: devices that disappeared, publishers that refused renewal
//! twice, and subscriptions whose expiry simply passed.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver};
use crossbeam::select;
use gena_client::GenaError;
use parking_lot::Mutex;

use super::{Subscription, SubscriptionRegistry};
use crate::schedule::LoopHandle;

/// Why a subscription was evicted by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// The owning device is no longer discovered
    DeviceGone,
    /// Renewal failed more often than allowed
    RenewalFailed,
    /// The expiry passed without a renewal
    TimedOut,
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceGone => write!(f, "device gone"),
            Self::RenewalFailed => write!(f, "renewal failed"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// What the scheduler needs from whoever owns the subscriptions.
pub trait SubscriptionOwner: Send + Sync {
    /// Whether the device owning a subscribed service is still discovered
    fn device_present(&self, device_udn: &str) -> bool;

    /// Renew with the publisher; returns the granted duration
    fn renew(&self, subscription: &Subscription) -> Result<Duration, GenaError>;

    /// A subscription was evicted
    fn expired(&self, subscription: Subscription, reason: ExpiryReason);
}

#[derive(Clone)]
struct RenewalPolicy {
    floor: Duration,
    max_retries: u32,
}

/// Background renewal of subscriptions
pub struct RenewalScheduler {
    registry: Arc<SubscriptionRegistry>,
    owner: Arc<dyn SubscriptionOwner>,
    policy: RenewalPolicy,
    handle: Mutex<Option<LoopHandle>>,
}

impl RenewalScheduler {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        owner: Arc<dyn SubscriptionOwner>,
        floor: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            registry,
            owner,
            policy: RenewalPolicy { floor, max_retries },
            handle: Mutex::new(None),
        }
    }

    /// Recompute the wait
    pub fn wake(&self) {
        self.registry.wakeup().notify();
    }

    /// Start the loop thread; a no-op when already running
    pub fn start(&self) -> std::io::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        let registry = Arc::clone(&self.registry);
        let owner = Arc::clone(&self.owner);
        let policy = self.policy.clone();
        let wake_rx = self.registry.wakeup().receiver();
        *handle = Some(LoopHandle::spawn("upnp-renewal", move |shutdown_rx| {
            run(&registry, owner.as_ref(), &policy, &wake_rx, &shutdown_rx)
        })?);
        tracing::debug!("Renewal scheduler started");
        Ok(())
    }

    /// Interrupt and join the loop thread
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.stop();
            tracing::debug!("Renewal scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Run one renewal and eviction pass as of `now`
    pub fn run_pass(&self, now: Instant) {
        renewal_pass(&self.registry, self.owner.as_ref(), &self.policy, now);
    }
}

fn run(
    registry: &SubscriptionRegistry,
    owner: &dyn SubscriptionOwner,
    policy: &RenewalPolicy,
    wake_rx: &Receiver<()>,
    shutdown_rx: &Receiver<()>,
) {
    loop {
        let timer = match registry.next_wake() {
            Some(at) => channel::at(at.max(Instant::now() + policy.floor)),
            None => channel::never(),
        };

        select! {
            recv(shutdown_rx) -> _ => break,
            recv(wake_rx) -> _ => {},
            recv(timer) -> _ => renewal_pass(registry, owner, policy, Instant::now()),
        }
    }
}

fn renewal_pass(
    registry: &SubscriptionRegistry,
    owner: &dyn SubscriptionOwner,
    policy: &RenewalPolicy,
    now: Instant,
) {
    // Passes may be driven with a future instant; never record results earlier than it
    let current = || now.max(Instant::now());

    for subscription in registry.due_for_renewal(now) {
        if !owner.device_present(&subscription.service.device_udn) {
            if let Some(evicted) = registry.evict(&subscription.id) {
                tracing::debug!("Dropping {}: device {} is gone", evicted.id, evicted.service.device_udn);
                owner.expired(evicted, ExpiryReason::DeviceGone);
            }
            continue;
        }

        match owner.renew(&subscription) {
            Ok(granted) => {
                if registry.renewed(&subscription.id, granted, current()) {
                    tracing::debug!("Renewed {} for {:?}", subscription.id, granted);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Renewal of {} for {} failed: {}",
                    subscription.id,
                    subscription.service,
                    e
                );
                if let Some(evicted) = registry.renewal_failed(
                    &subscription.id,
                    current(),
                    policy.floor,
                    policy.max_retries,
                ) {
                    owner.expired(evicted, ExpiryReason::RenewalFailed);
                }
            }
        }
    }

    for evicted in registry.evict_expired(current()) {
        tracing::debug!("Subscription {} expired", evicted.id);
        owner.expired(evicted, ExpiryReason::TimedOut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ServiceRef;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedOwner {
        device_gone: bool,
        results: Mutex<VecDeque<Result<Duration, GenaError>>>,
        renew_calls: Mutex<Vec<String>>,
        expired: Mutex<Vec<(String, ExpiryReason)>>,
    }

    impl SubscriptionOwner for ScriptedOwner {
        fn device_present(&self, _device_udn: &str) -> bool {
            !self.device_gone
        }

        fn renew(&self, subscription: &Subscription) -> Result<Duration, GenaError> {
            self.renew_calls.lock().push(subscription.id.clone());
            self.results
                .lock()
                .pop_front()
                .unwrap_or(Err(GenaError::Network("unscripted".to_string())))
        }

        fn expired(&self, subscription: Subscription, reason: ExpiryReason) {
            self.expired.lock().push((subscription.id, reason));
        }
    }

    fn service() -> ServiceRef {
        ServiceRef {
            device_udn: "uuid:device".to_string(),
            service_id: "urn:upnp-org:serviceId:AVTransport".to_string(),
            service_type: "urn:schemas-upnp-org:service:AVTransport:1".to_string(),
            event_sub_url: "http://10.0.0.5/avt/event".to_string(),
            control_url: "http://10.0.0.5/avt/control".to_string(),
        }
    }

    fn scheduler(owner: Arc<ScriptedOwner>) -> (RenewalScheduler, Arc<SubscriptionRegistry>) {
        let registry = Arc::new(SubscriptionRegistry::new(Duration::from_secs(10)));
        let scheduler = RenewalScheduler::new(
            Arc::clone(&registry),
            owner,
            Duration::from_secs(1),
            1,
        );
        (scheduler, registry)
    }

    #[test]
    fn test_due_subscription_is_renewed() {
        let owner = Arc::new(ScriptedOwner::default());
        owner.results.lock().push_back(Ok(Duration::from_secs(300)));
        let (scheduler, registry) = scheduler(Arc::clone(&owner));

        registry.register("uuid:s1", service(), Duration::from_secs(300), true);
        let renew_at = registry.get("uuid:s1").unwrap().renew_at;

        scheduler.run_pass(renew_at - Duration::from_secs(1));
        assert!(owner.renew_calls.lock().is_empty());

        scheduler.run_pass(renew_at);
        assert_eq!(*owner.renew_calls.lock(), vec!["uuid:s1"]);
        assert!(registry.get("uuid:s1").unwrap().renew_at > renew_at);
        assert!(owner.expired.lock().is_empty());
    }

    #[test]
    fn test_two_failures_evict() {
        let owner = Arc::new(ScriptedOwner::default());
        let (scheduler, registry) = scheduler(Arc::clone(&owner));

        registry.register("uuid:s1", service(), Duration::from_secs(300), true);
        let renew_at = registry.get("uuid:s1").unwrap().renew_at;

        scheduler.run_pass(renew_at);
        assert!(registry.contains("uuid:s1"));
        assert_eq!(registry.get("uuid:s1").unwrap().failure_count, 1);

        let retry_at = registry.get("uuid:s1").unwrap().renew_at;
        scheduler.run_pass(retry_at);
        assert!(!registry.contains("uuid:s1"));
        assert!(registry.is_marked_expired(&service()));
        assert_eq!(
            *owner.expired.lock(),
            vec![("uuid:s1".to_string(), ExpiryReason::RenewalFailed)]
        );
        assert_eq!(owner.renew_calls.lock().len(), 2);
    }

    #[test]
    fn test_orphaned_subscription_is_evicted_without_network_call() {
        let owner = Arc::new(ScriptedOwner {
            device_gone: true,
            ..Default::default()
        });
        let (scheduler, registry) = scheduler(Arc::clone(&owner));

        registry.register("uuid:s1", service(), Duration::from_secs(300), true);
        let renew_at = registry.get("uuid:s1").unwrap().renew_at;
        scheduler.run_pass(renew_at);

        assert!(owner.renew_calls.lock().is_empty());
        assert!(!registry.contains("uuid:s1"));
        assert_eq!(
            *owner.expired.lock(),
            vec![("uuid:s1".to_string(), ExpiryReason::DeviceGone)]
        );
    }

    #[test]
    fn test_non_renewing_subscription_times_out() {
        let owner = Arc::new(ScriptedOwner::default());
        let (scheduler, registry) = scheduler(Arc::clone(&owner));

        registry.register("uuid:s1", service(), Duration::from_secs(60), false);
        let subscription = registry.get("uuid:s1").unwrap();

        scheduler.run_pass(subscription.renew_at);
        assert!(registry.contains("uuid:s1"));

        scheduler.run_pass(subscription.expires_at);
        assert!(owner.renew_calls.lock().is_empty());
        assert_eq!(
            *owner.expired.lock(),
            vec![("uuid:s1".to_string(), ExpiryReason::TimedOut)]
        );
    }

    #[test]
    fn test_loop_renews_in_background() {
        let owner = Arc::new(ScriptedOwner::default());
        owner.results.lock().push_back(Ok(Duration::from_secs(300)));
        let registry = Arc::new(SubscriptionRegistry::new(Duration::from_secs(10)));
        let scheduler = RenewalScheduler::new(
            Arc::clone(&registry),
            owner.clone(),
            Duration::from_millis(20),
            1,
        );
        scheduler.start().unwrap();
        assert!(scheduler.is_running());

        // A 2 s grant with a 10 s margin renews after 1 s
        registry.register("uuid:s1", service(), Duration::from_secs(2), true);

        let deadline = Instant::now() + Duration::from_secs(5);
        while owner.renew_calls.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        scheduler.stop();
        assert!(!scheduler.is_running());

        assert_eq!(*owner.renew_calls.lock(), vec!["uuid:s1"]);
        let renewed = registry.get("uuid:s1").unwrap();
        assert_eq!(renewed.timeout, Duration::from_secs(300));
    }
}
