//! Registry of active subscriptions.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::Subscription;
use crate::device::ServiceRef;
use crate::schedule::Wakeup;

/// Services are identified by owning device and service ID.
type ServiceKey = (String, String);

fn service_key(service: &ServiceRef) -> ServiceKey {
    (service.device_udn.clone(), service.service_id.clone())
}

#[derive(Default)]
struct SubscriptionState {
    by_id: HashMap<String, Subscription>,
    by_service: HashMap<ServiceKey, String>,
    /// Services whose subscription was evicted by the renewal scheduler
    expired: HashSet<ServiceKey>,
}

impl SubscriptionState {
    fn remove(&mut self, id: &str) -> Option<Subscription> {
        let subscription = self.by_id.remove(id)?;
        let key = service_key(&subscription.service);
        if self.by_service.get(&key).is_some_and(|owner| owner == id) {
            self.by_service.remove(&key);
        }
        Some(subscription)
    }

    fn expire(&mut self, id: &str) -> Option<Subscription> {
        let subscription = self.remove(id)?;
        self.expired.insert(service_key(&subscription.service));
        Some(subscription)
    }
}

/// Active subscriptions keyed by SID, at most one per service.
pub struct SubscriptionRegistry {
    state: Mutex<SubscriptionState>,
    renewal_margin: Duration,
    wakeup: Wakeup,
}

impl SubscriptionRegistry {
    pub fn new(renewal_margin: Duration) -> Self {
        Self {
            state: Mutex::new(SubscriptionState::default()),
            renewal_margin,
            wakeup: Wakeup::new(),
        }
    }

    pub(crate) fn wakeup(&self) -> &Wakeup {
        &self.wakeup
    }

    /// Store a subscription granted for `timeout`.
    ///
    /// An empty SID is never registered. A new SID for an already subscribed
    /// service replaces the previous entry.
    pub fn register(
        &self,
        id: &str,
        service: ServiceRef,
        timeout: Duration,
        keep_renewing: bool,
    ) -> bool {
        self.register_replacing(id, service, timeout, keep_renewing)
            .is_some()
    }

    /// [`register`](Self::register), handing back the stored subscription and
    /// the entry of another SID it displaced for the same service.
    ///
    /// Returns `None` when the SID is empty and nothing was registered.
    pub fn register_replacing(
        &self,
        id: &str,
        service: ServiceRef,
        timeout: Duration,
        keep_renewing: bool,
    ) -> Option<(Subscription, Option<Subscription>)> {
        let id = id.trim();
        if id.is_empty() {
            return None;
        }

        let registered = {
            let mut state = self.state.lock();
            let key = service_key(&service);

            state.remove(id);
            let displaced = match state.by_service.get(&key).cloned() {
                Some(previous) => {
                    tracing::debug!("{} replaces subscription {} for {}", id, previous, service);
                    state.remove(&previous)
                }
                None => None,
            };

            state.expired.remove(&key);
            state.by_service.insert(key, id.to_string());
            let subscription = Subscription::new(
                id.to_string(),
                service,
                timeout,
                keep_renewing,
                self.renewal_margin,
                Instant::now(),
            );
            state.by_id.insert(id.to_string(), subscription.clone());
            (subscription, displaced)
        };

        self.wakeup.notify();
        Some(registered)
    }

    /// Remove a subscription without any other side effect
    pub fn unregister(&self, id: &str) -> Option<Subscription> {
        self.state.lock().remove(id)
    }

    /// Remove the subscription of `service` and forget its expired mark
    pub fn unregister_service(&self, service: &ServiceRef) -> Option<Subscription> {
        let mut state = self.state.lock();
        let key = service_key(service);
        state.expired.remove(&key);
        let id = state.by_service.get(&key).cloned()?;
        state.remove(&id)
    }

    pub fn get(&self, id: &str) -> Option<Subscription> {
        self.state.lock().by_id.get(id).cloned()
    }

    pub fn for_service(&self, service: &ServiceRef) -> Option<Subscription> {
        let state = self.state.lock();
        let id = state.by_service.get(&service_key(service))?;
        state.by_id.get(id).cloned()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().by_id.values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the subscription of `service` was evicted by the scheduler
    pub fn is_marked_expired(&self, service: &ServiceRef) -> bool {
        self.state.lock().expired.contains(&service_key(service))
    }

    /// Clear the expired mark of `service`; returns whether it was set
    pub fn take_expired_mark(&self, service: &ServiceRef) -> bool {
        self.state.lock().expired.remove(&service_key(service))
    }

    /// Remove and return every subscription, clearing all marks
    pub fn drain(&self) -> Vec<Subscription> {
        let mut state = self.state.lock();
        state.by_service.clear();
        state.expired.clear();
        state.by_id.drain().map(|(_, subscription)| subscription).collect()
    }

    /// Earliest renewal (for renewing entries) or expiry (for all entries)
    pub(crate) fn next_wake(&self) -> Option<Instant> {
        self.state
            .lock()
            .by_id
            .values()
            .map(|subscription| {
                if subscription.keep_renewing {
                    subscription.renew_at.min(subscription.expires_at)
                } else {
                    subscription.expires_at
                }
            })
            .min()
    }

    pub(crate) fn due_for_renewal(&self, now: Instant) -> Vec<Subscription> {
        self.state
            .lock()
            .by_id
            .values()
            .filter(|subscription| subscription.keep_renewing && subscription.renew_at <= now)
            .cloned()
            .collect()
    }

    /// Record a successful renewal; false when the subscription is gone
    pub(crate) fn renewed(&self, id: &str, granted: Duration, now: Instant) -> bool {
        let mut state = self.state.lock();
        match state.by_id.get_mut(id) {
            Some(subscription) => {
                subscription.refresh(granted, self.renewal_margin, now);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_keep_renewing(&self, id: &str, keep_renewing: bool) {
        if let Some(subscription) = self.state.lock().by_id.get_mut(id) {
            subscription.keep_renewing = keep_renewing;
        }
        self.wakeup.notify();
    }

    /// Record a failed renewal.
    ///
    /// Past `max_retries` consecutive failures, or when the retry one `floor`
    /// later would land at or after expiry, the subscription is removed, its
    /// service marked expired, and the evicted entry returned.
    pub(crate) fn renewal_failed(
        &self,
        id: &str,
        now: Instant,
        floor: Duration,
        max_retries: u32,
    ) -> Option<Subscription> {
        let mut state = self.state.lock();
        let subscription = state.by_id.get_mut(id)?;
        subscription.failure_count += 1;

        let retry_at = now + floor;
        if subscription.failure_count > max_retries || retry_at >= subscription.expires_at {
            return state.expire(id);
        }

        subscription.renew_at = retry_at;
        None
    }

    /// Remove a subscription and mark its service expired
    pub(crate) fn evict(&self, id: &str) -> Option<Subscription> {
        self.state.lock().expire(id)
    }

    /// Remove every subscription whose expiry is at or before `now`
    pub(crate) fn evict_expired(&self, now: Instant) -> Vec<Subscription> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .by_id
            .values()
            .filter(|subscription| subscription.is_expired(now))
            .map(|subscription| subscription.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| state.expire(id))
            .collect()
    }

    /// Check an incoming event key against the expected one.
    ///
    /// Returns the subscribed service and, when events were skipped, the key
    /// that was expected. `None` means the SID is unknown.
    pub(crate) fn accept_event(
        &self,
        id: &str,
        seq: Option<u32>,
    ) -> Option<(ServiceRef, Option<u32>)> {
        let mut state = self.state.lock();
        let subscription = state.by_id.get_mut(id)?;

        let gap = match seq {
            Some(seq) => {
                let expected = subscription.next_seq;
                // Keys wrap from u32::MAX to 1; 0 only marks the initial event
                subscription.next_seq = if seq == u32::MAX { 1 } else { seq + 1 };
                (seq != expected).then_some(expected)
            }
            None => None,
        };

        Some((subscription.service.clone(), gap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str) -> ServiceRef {
        ServiceRef {
            device_udn: "uuid:device".to_string(),
            service_id: id.to_string(),
            service_type: "urn:schemas-upnp-org:service:Dummy:1".to_string(),
            event_sub_url: "http://10.0.0.5/event".to_string(),
            control_url: "http://10.0.0.5/control".to_string(),
        }
    }

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Duration::from_secs(10))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry();
        assert!(registry.register("uuid:s1", service("a"), Duration::from_secs(300), true));

        assert!(registry.contains("uuid:s1"));
        assert_eq!(registry.get("uuid:s1").unwrap().service, service("a"));
        assert_eq!(registry.for_service(&service("a")).unwrap().id, "uuid:s1");
        assert!(registry.for_service(&service("b")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_sid_is_never_registered() {
        let registry = registry();
        assert!(!registry.register("", service("a"), Duration::from_secs(300), true));
        assert!(!registry.register("   ", service("a"), Duration::from_secs(300), true));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_new_sid_replaces_subscription_of_same_service() {
        let registry = registry();
        registry.register("uuid:s1", service("a"), Duration::from_secs(300), true);
        registry.register("uuid:s2", service("a"), Duration::from_secs(300), true);

        assert!(!registry.contains("uuid:s1"));
        assert_eq!(registry.for_service(&service("a")).unwrap().id, "uuid:s2");
        assert_eq!(registry.len(), 1);

        // Unregistering the replaced SID leaves the new one alone
        assert!(registry.unregister("uuid:s1").is_none());
        assert!(registry.contains("uuid:s2"));
    }

    #[test]
    fn test_register_replacing_returns_displaced_subscription() {
        let registry = registry();
        let (first, displaced) = registry
            .register_replacing("uuid:s1", service("a"), Duration::from_secs(300), true)
            .unwrap();
        assert_eq!(first.id, "uuid:s1");
        assert!(displaced.is_none());

        let (second, displaced) = registry
            .register_replacing("uuid:s2", service("a"), Duration::from_secs(300), true)
            .unwrap();
        assert_eq!(second.id, "uuid:s2");
        assert_eq!(displaced.map(|s| s.id), Some("uuid:s1".to_string()));

        // Re-registering the same SID displaces nothing
        let (_, displaced) = registry
            .register_replacing("uuid:s2", service("a"), Duration::from_secs(300), true)
            .unwrap();
        assert!(displaced.is_none());
        assert!(registry
            .register_replacing(" ", service("a"), Duration::from_secs(300), true)
            .is_none());
    }

    #[test]
    fn test_registration_wakes_scheduler() {
        let registry = registry();
        let wake_rx = registry.wakeup().receiver();
        registry.register("uuid:s1", service("a"), Duration::from_secs(300), true);
        assert!(wake_rx.try_recv().is_ok());
    }

    #[test]
    fn test_renewal_failures_evict_and_mark_expired() {
        let registry = registry();
        registry.register("uuid:s1", service("a"), Duration::from_secs(300), true);
        let now = Instant::now();
        let floor = Duration::from_secs(1);

        assert!(registry.renewal_failed("uuid:s1", now, floor, 1).is_none());
        let retry = registry.get("uuid:s1").unwrap();
        assert_eq!(retry.failure_count, 1);
        assert_eq!(retry.renew_at, now + floor);

        let evicted = registry.renewal_failed("uuid:s1", now + floor, floor, 1).unwrap();
        assert_eq!(evicted.id, "uuid:s1");
        assert!(!registry.contains("uuid:s1"));
        assert!(registry.is_marked_expired(&service("a")));

        assert!(registry.take_expired_mark(&service("a")));
        assert!(!registry.take_expired_mark(&service("a")));
    }

    #[test]
    fn test_failed_renewal_too_close_to_expiry_evicts() {
        let registry = registry();
        registry.register("uuid:s1", service("a"), Duration::from_secs(2), true);
        let expires_at = registry.get("uuid:s1").unwrap().expires_at;

        let evicted = registry.renewal_failed(
            "uuid:s1",
            expires_at - Duration::from_millis(500),
            Duration::from_secs(1),
            1,
        );
        assert!(evicted.is_some());
    }

    #[test]
    fn test_success_resets_failures() {
        let registry = registry();
        registry.register("uuid:s1", service("a"), Duration::from_secs(300), true);
        let now = Instant::now();
        registry.renewal_failed("uuid:s1", now, Duration::from_secs(1), 1);

        assert!(registry.renewed("uuid:s1", Duration::from_secs(300), now));
        let renewed = registry.get("uuid:s1").unwrap();
        assert_eq!(renewed.failure_count, 0);
        assert_eq!(renewed.renew_at, now + Duration::from_secs(290));
        assert!(!registry.renewed("uuid:missing", Duration::from_secs(300), now));
    }

    #[test]
    fn test_next_wake_and_due_for_renewal() {
        let registry = registry();
        registry.register("uuid:renewing", service("a"), Duration::from_secs(300), true);
        registry.register("uuid:once", service("b"), Duration::from_secs(100), false);

        let renewing = registry.get("uuid:renewing").unwrap();
        let once = registry.get("uuid:once").unwrap();
        assert_eq!(registry.next_wake(), Some(once.expires_at.min(renewing.renew_at)));

        assert!(registry.due_for_renewal(Instant::now()).is_empty());
        let due = registry.due_for_renewal(renewing.renew_at);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "uuid:renewing");

        registry.set_keep_renewing("uuid:renewing", false);
        assert!(registry.due_for_renewal(renewing.renew_at).is_empty());
    }

    #[test]
    fn test_evict_expired() {
        let registry = registry();
        registry.register("uuid:short", service("a"), Duration::from_secs(5), false);
        registry.register("uuid:long", service("b"), Duration::from_secs(500), true);

        let short = registry.get("uuid:short").unwrap();
        assert!(registry.evict_expired(short.expires_at - Duration::from_millis(1)).is_empty());

        let evicted = registry.evict_expired(short.expires_at);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "uuid:short");
        assert!(registry.is_marked_expired(&service("a")));
        assert!(!registry.is_marked_expired(&service("b")));

        // Subscribing again clears the mark
        registry.register("uuid:short-2", service("a"), Duration::from_secs(5), false);
        assert!(!registry.is_marked_expired(&service("a")));
    }

    #[test]
    fn test_unregister_service_and_drain() {
        let registry = registry();
        registry.register("uuid:s1", service("a"), Duration::from_secs(300), true);
        registry.register("uuid:s2", service("b"), Duration::from_secs(300), true);

        assert_eq!(registry.unregister_service(&service("a")).unwrap().id, "uuid:s1");
        assert!(registry.unregister_service(&service("a")).is_none());

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.subscriptions().is_empty());
    }

    #[test]
    fn test_accept_event_tracks_sequence() {
        let registry = registry();
        registry.register("uuid:s1", service("a"), Duration::from_secs(300), true);

        assert!(registry.accept_event("uuid:unknown", Some(0)).is_none());

        let (svc, gap) = registry.accept_event("uuid:s1", Some(0)).unwrap();
        assert_eq!(svc, service("a"));
        assert_eq!(gap, None);
        assert_eq!(registry.accept_event("uuid:s1", Some(1)).unwrap().1, None);

        // Event 2 was lost
        assert_eq!(registry.accept_event("uuid:s1", Some(3)).unwrap().1, Some(2));
        assert_eq!(registry.accept_event("uuid:s1", Some(4)).unwrap().1, None);

        // Missing SEQ is not checked
        assert_eq!(registry.accept_event("uuid:s1", None).unwrap().1, None);
    }
}
