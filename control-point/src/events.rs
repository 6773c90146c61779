//! Application-facing events and listeners.
//!
//! Every listener call happens on the sequential queue, so a listener never
//! runs concurrently with another listener and sees events in the order the
//! control point produced them.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::device::{Device, ServiceRef};
use crate::subscription::{ExpiryReason, Subscription};

/// One received NOTIFY, parsed into state variable changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    pub subscription_id: String,
    pub service: ServiceRef,
    /// Event key from the SEQ header
    pub seq: Option<u32>,
    /// State variable name and new value, in document order
    pub properties: Vec<(String, String)>,
}

impl NotifyEvent {
    /// Value of the first property named `name`
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Everything the control point reports to the application
#[derive(Debug, Clone)]
pub enum ControlPointEvent {
    Discovered(Device),
    Lost(Device),
    Notify(NotifyEvent),
    SubscriptionExpired {
        subscription: Subscription,
        reason: ExpiryReason,
    },
}

/// Receives device discovery and loss
pub trait DiscoveryListener: Send + Sync {
    fn device_discovered(&self, device: &Device);
    fn device_lost(&self, device: &Device);
}

/// Receives event notifications
pub trait NotifyListener: Send + Sync {
    fn event_received(&self, event: &NotifyEvent);

    /// A subscription was dropped by the renewal scheduler
    fn subscription_expired(&self, _subscription: &Subscription, _reason: ExpiryReason) {}
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Registered listeners
#[derive(Default)]
pub(crate) struct Listeners {
    discovery: Mutex<Vec<Arc<dyn DiscoveryListener>>>,
    notify: Mutex<Vec<Arc<dyn NotifyListener>>>,
}

impl Listeners {
    pub(crate) fn add_discovery(&self, listener: Arc<dyn DiscoveryListener>) {
        let mut discovery = self.discovery.lock();
        if !discovery.iter().any(|existing| same_listener(existing, &listener)) {
            discovery.push(listener);
        }
    }

    pub(crate) fn remove_discovery(&self, listener: &Arc<dyn DiscoveryListener>) -> bool {
        let mut discovery = self.discovery.lock();
        let before = discovery.len();
        discovery.retain(|existing| !same_listener(existing, listener));
        discovery.len() != before
    }

    pub(crate) fn add_notify(&self, listener: Arc<dyn NotifyListener>) {
        let mut notify = self.notify.lock();
        if !notify.iter().any(|existing| same_listener(existing, &listener)) {
            notify.push(listener);
        }
    }

    pub(crate) fn remove_notify(&self, listener: &Arc<dyn NotifyListener>) -> bool {
        let mut notify = self.notify.lock();
        let before = notify.len();
        notify.retain(|existing| !same_listener(existing, listener));
        notify.len() != before
    }

    pub(crate) fn clear(&self) {
        self.discovery.lock().clear();
        self.notify.lock().clear();
    }

    pub(crate) fn discovered(&self, device: &Device) {
        let listeners = self.discovery.lock().clone();
        for listener in listeners {
            guarded("device_discovered", || listener.device_discovered(device));
        }
    }

    pub(crate) fn lost(&self, device: &Device) {
        let listeners = self.discovery.lock().clone();
        for listener in listeners {
            guarded("device_lost", || listener.device_lost(device));
        }
    }

    pub(crate) fn notify(&self, event: &NotifyEvent) {
        let listeners = self.notify.lock().clone();
        for listener in listeners {
            guarded("event_received", || listener.event_received(event));
        }
    }

    pub(crate) fn subscription_expired(&self, subscription: &Subscription, reason: ExpiryReason) {
        let listeners = self.notify.lock().clone();
        for listener in listeners {
            guarded("subscription_expired", || {
                listener.subscription_expired(subscription, reason)
            });
        }
    }
}

/// Run one listener callback; a panic is logged and the next listener still runs
fn guarded<F: FnOnce()>(callback: &str, f: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::warn!("Listener panicked in {}", callback);
    }
}

/// Parse a GENA `<e:propertyset>` body into `(name, value)` pairs.
///
/// Each `<e:property>` contributes its child elements; values are unescaped
/// text, and an empty element yields an empty value.
pub fn parse_property_set(xml: &str) -> Result<Vec<(String, String)>, String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut properties = Vec::new();
    let mut depth = 0usize;
    let mut current: Option<(String, String)> = None;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                depth += 1;
                let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                match depth {
                    1 if name != "propertyset" => {
                        return Err(format!("unexpected root element <{}>", name));
                    }
                    1 => saw_root = true,
                    3 => current = Some((name, String::new())),
                    _ => {}
                }
            }
            Ok(Event::Empty(element)) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                match depth {
                    0 if name == "propertyset" => saw_root = true,
                    0 => return Err(format!("unexpected root element <{}>", name)),
                    2 => properties.push((name, String::new())),
                    _ => {}
                }
            }
            Ok(Event::Text(text)) => {
                if let (3, Some((_, value))) = (depth, current.as_mut()) {
                    let unescaped = text.unescape().map_err(|e| e.to_string())?;
                    value.push_str(&unescaped);
                }
            }
            Ok(Event::CData(data)) => {
                if let (3, Some((_, value))) = (depth, current.as_mut()) {
                    value.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 3 {
                    if let Some(property) = current.take() {
                        properties.push(property);
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("at position {}: {}", reader.buffer_position(), e)),
        }
    }

    if !saw_root {
        return Err("missing propertyset element".to_string());
    }
    Ok(properties)
}

/// Listener forwarding every event into a channel
pub(crate) struct ChannelListener {
    tx: Mutex<mpsc::Sender<ControlPointEvent>>,
}

impl ChannelListener {
    pub(crate) fn new(tx: mpsc::Sender<ControlPointEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, event: ControlPointEvent) {
        let _ = self.tx.lock().send(event);
    }
}

impl DiscoveryListener for ChannelListener {
    fn device_discovered(&self, device: &Device) {
        self.send(ControlPointEvent::Discovered(device.clone()));
    }

    fn device_lost(&self, device: &Device) {
        self.send(ControlPointEvent::Lost(device.clone()));
    }
}

impl NotifyListener for ChannelListener {
    fn event_received(&self, event: &NotifyEvent) {
        self.send(ControlPointEvent::Notify(event.clone()));
    }

    fn subscription_expired(&self, subscription: &Subscription, reason: ExpiryReason) {
        self.send(ControlPointEvent::SubscriptionExpired {
            subscription: subscription.clone(),
            reason,
        });
    }
}

/// Blocking iterator over control point events
///
/// This iterator blocks on `next()` until an event is available or the
/// control point is terminated. Use `try_recv()` for non-blocking access.
/// Clones share one receiver, so each event is seen by exactly one of them.
pub struct EventIterator {
    rx: Arc<Mutex<mpsc::Receiver<ControlPointEvent>>>,
}

impl EventIterator {
    pub(crate) fn new(rx: mpsc::Receiver<ControlPointEvent>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Block until an event is available
    ///
    /// Returns `None` once the control point is terminated.
    pub fn recv(&self) -> Option<ControlPointEvent> {
        self.rx.lock().recv().ok()
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<ControlPointEvent> {
        self.rx.lock().try_recv().ok()
    }

    /// Block until an event is available or `timeout` expires
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ControlPointEvent> {
        self.rx.lock().recv_timeout(timeout).ok()
    }

    /// Non-blocking iterator over currently available events
    pub fn try_iter(&self) -> TryIterator<'_> {
        TryIterator { inner: self }
    }

    /// Iterator blocking for up to `timeout` on each call to `next()`
    pub fn timeout_iter(&self, timeout: Duration) -> TimeoutIterator<'_> {
        TimeoutIterator {
            inner: self,
            timeout,
        }
    }
}

impl Iterator for EventIterator {
    type Item = ControlPointEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Clone for EventIterator {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

/// Non-blocking iterator over currently available events
pub struct TryIterator<'a> {
    inner: &'a EventIterator,
}

impl<'a> Iterator for TryIterator<'a> {
    type Item = ControlPointEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.try_recv()
    }
}

/// Blocking iterator with timeout
pub struct TimeoutIterator<'a> {
    inner: &'a EventIterator,
    timeout: Duration,
}

impl<'a> Iterator for TimeoutIterator<'a> {
    type Item = ControlPointEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.recv_timeout(self.timeout)
    }
}
