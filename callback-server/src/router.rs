//! Event routing for HTTP callback notifications.
//!
//! The router hands each well-formed NOTIFY to a sink supplied by the owner
//! of the subscriptions. The sink decides whether the SID is one it knows;
//! the server turns that answer into the HTTP status.

use std::fmt;
use std::sync::Arc;

/// Receives notifications; returns `false` when the subscription is unknown.
pub type NotificationSink = Arc<dyn Fn(NotificationPayload) -> bool + Send + Sync>;

/// Generic notification payload for UPnP event notifications.
///
/// Carries the subscription ID, event key and raw XML body of one NOTIFY,
/// with no device-specific context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    /// The subscription ID from the SID header
    pub subscription_id: String,
    /// Event key from the SEQ header
    pub seq: Option<u32>,
    /// The raw XML event body
    pub event_xml: String,
}

/// Routes events from HTTP callbacks to a sink.
#[derive(Clone)]
pub struct EventRouter {
    sink: NotificationSink,
}

impl EventRouter {
    /// Create a new event router.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use callback_server::router::{EventRouter, NotificationPayload};
    ///
    /// let router = EventRouter::new(Arc::new(|payload: NotificationPayload| {
    ///     payload.subscription_id == "uuid:subscription-123"
    /// }));
    /// ```
    pub fn new(sink: NotificationSink) -> Self {
        Self { sink }
    }

    /// Build a router from a plain closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(NotificationPayload) -> bool + Send + Sync + 'static,
    {
        Self::new(Arc::new(f))
    }

    /// Route an incoming event to the sink.
    ///
    /// Returns `true` if the sink accepted the event, `false` if the
    /// subscription ID was not recognised.
    ///
    /// # Example
    ///
    /// ```
    /// # use callback_server::router::{EventRouter, NotificationPayload};
    /// let router = EventRouter::from_fn(|p| p.subscription_id == "uuid:subscription-123");
    /// let routed = router.route_event(NotificationPayload {
    ///     subscription_id: "uuid:subscription-123".to_string(),
    ///     seq: Some(0),
    ///     event_xml: "<e:propertyset/>".to_string(),
    /// });
    /// assert!(routed);
    /// ```
    pub fn route_event(&self, payload: NotificationPayload) -> bool {
        let subscription_id = payload.subscription_id.clone();
        let routed = (self.sink)(payload);
        if !routed {
            tracing::debug!("Dropping event for unknown subscription {}", subscription_id);
        }
        routed
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter").finish_non_exhaustive()
    }
}
