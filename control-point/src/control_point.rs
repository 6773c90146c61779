//! The control point facade.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use callback_server::{NotificationPayload, NotificationSink};
use gena_client::{GenaClient, GenaError};
use parking_lot::Mutex;
use upnp_discovery::{HttpDescriptionLoader, NetworkInterface};

use crate::callback::HttpEventServer;
use crate::config::ControlPointConfig;
use crate::device::{Device, ServiceRef};
use crate::error::{ControlPointError, Result};
use crate::events::{
    parse_property_set, ChannelListener, DiscoveryListener, EventIterator, Listeners,
    NotifyEvent, NotifyListener,
};
use crate::executor::TaskExecutors;
use crate::expiration::ExpirationScheduler;
use crate::registry::{DeviceEvents, DeviceRegistry};
use crate::schedule::Wakeup;
use crate::subscription::{
    ExpiryReason, RenewalScheduler, Subscription, SubscriptionOwner, SubscriptionRegistry,
};
use crate::transport::{
    DatagramSink, DescriptionLoader, EventClient, EventServer, MulticastTransport, SsdpTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Initialized,
    Started,
    Stopped,
    Terminated,
}

/// Builder for [`ControlPoint`] with custom configuration or collaborators
///
/// Any collaborator left unset gets its network-backed default.
#[derive(Default)]
pub struct ControlPointBuilder {
    config: Option<ControlPointConfig>,
    description_loader: Option<Arc<dyn DescriptionLoader>>,
    event_client: Option<Arc<dyn EventClient>>,
    ssdp_transport: Option<Arc<dyn SsdpTransport>>,
    event_server: Option<Arc<dyn EventServer>>,
}

impl ControlPointBuilder {
    pub fn config(mut self, config: ControlPointConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn description_loader(mut self, loader: Arc<dyn DescriptionLoader>) -> Self {
        self.description_loader = Some(loader);
        self
    }

    pub fn event_client(mut self, client: Arc<dyn EventClient>) -> Self {
        self.event_client = Some(client);
        self
    }

    pub fn ssdp_transport(mut self, transport: Arc<dyn SsdpTransport>) -> Self {
        self.ssdp_transport = Some(transport);
        self
    }

    pub fn event_server(mut self, server: Arc<dyn EventServer>) -> Self {
        self.event_server = Some(server);
        self
    }

    /// Validate the configuration and assemble the control point.
    ///
    /// Worker threads of the task substrate start here; network activity
    /// only starts with [`ControlPoint::start`].
    pub fn build(self) -> Result<ControlPoint> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let loader: Arc<dyn DescriptionLoader> = match self.description_loader {
            Some(loader) => loader,
            None => Arc::new(HttpDescriptionLoader::new(config.network_timeout)?),
        };
        let event_client: Arc<dyn EventClient> = match self.event_client {
            Some(client) => client,
            None => Arc::new(GenaClient::new(config.network_timeout)),
        };
        let ssdp: Arc<dyn SsdpTransport> = match self.ssdp_transport {
            Some(transport) => transport,
            None => Arc::new(MulticastTransport::new()),
        };
        let event_server: Arc<dyn EventServer> = match self.event_server {
            Some(server) => server,
            None => Arc::new(HttpEventServer::new(config.callback_port_range)),
        };

        let executors = Arc::new(
            TaskExecutors::new(config.parallel_workers, config.shutdown_timeout).map_err(|e| {
                ControlPointError::Configuration(format!("Failed to start worker threads: {}", e))
            })?,
        );
        let listeners = Arc::new(Listeners::default());
        let subscriptions = Arc::new(SubscriptionRegistry::new(config.renewal_margin));
        let expiration_wakeup = Wakeup::new();

        let bridge = Arc::new(RegistryBridge {
            executors: Arc::clone(&executors),
            listeners: Arc::clone(&listeners),
            subscriptions: Arc::clone(&subscriptions),
            expiration_wakeup: expiration_wakeup.clone(),
        });
        let devices = Arc::new(DeviceRegistry::new(loader, Arc::clone(&executors), bridge));
        let expiration = ExpirationScheduler::new(
            Arc::clone(&devices),
            config.expiration_margin,
            expiration_wakeup,
        );

        let renewer = Arc::new(Renewer {
            devices: Arc::clone(&devices),
            event_client: Arc::clone(&event_client),
            timeout: config.subscription_timeout,
            executors: Arc::clone(&executors),
            listeners: Arc::clone(&listeners),
        });
        let renewal = RenewalScheduler::new(
            Arc::clone(&subscriptions),
            renewer,
            config.renewal_floor,
            config.max_renewal_retries,
        );

        Ok(ControlPoint {
            config,
            executors,
            devices,
            subscriptions,
            expiration,
            renewal,
            listeners,
            ssdp,
            event_server,
            event_client,
            lifecycle: Mutex::new(Lifecycle::Created),
            started: Arc::new(AtomicBool::new(false)),
            iterator: Mutex::new(None),
        })
    }
}

/// A UPnP control point.
///
/// Discovers devices through SSDP, tracks their liveness, and keeps GENA
/// event subscriptions alive. Applications observe it through listeners or
/// the blocking [`EventIterator`] returned by [`iter`](Self::iter); every
/// listener call happens on one thread, in the order the control point
/// produced the events.
///
/// # Example
///
/// ```rust,no_run
/// use upnp_control_point::{ControlPoint, ControlPointEvent};
///
/// let control_point = ControlPoint::new()?;
/// let events = control_point.iter();
/// control_point.start()?;
/// control_point.search(None)?;
///
/// for event in events {
///     match event {
///         ControlPointEvent::Discovered(device) => println!("+ {}", device.friendly_name()),
///         ControlPointEvent::Lost(device) => println!("- {}", device.udn),
///         _ => {}
///     }
/// }
/// # Ok::<(), upnp_control_point::ControlPointError>(())
/// ```
pub struct ControlPoint {
    config: ControlPointConfig,
    executors: Arc<TaskExecutors>,
    devices: Arc<DeviceRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    expiration: ExpirationScheduler,
    renewal: RenewalScheduler,
    listeners: Arc<Listeners>,
    ssdp: Arc<dyn SsdpTransport>,
    event_server: Arc<dyn EventServer>,
    event_client: Arc<dyn EventClient>,
    lifecycle: Mutex<Lifecycle>,
    /// Read by the transport receive path without taking the lifecycle lock
    started: Arc<AtomicBool>,
    iterator: Mutex<Option<EventIterator>>,
}

impl ControlPoint {
    /// Control point with default configuration and network collaborators
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ControlPointBuilder {
        ControlPointBuilder::default()
    }

    pub fn config(&self) -> &ControlPointConfig {
        &self.config
    }

    // ---- lifecycle ----

    /// Prepare for start; a no-op when already initialized.
    pub fn initialize(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Terminated => Err(ControlPointError::Terminated),
            Lifecycle::Created => {
                *lifecycle = Lifecycle::Initialized;
                tracing::debug!("Control point initialized");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Start the event server, the SSDP transport and both schedulers.
    ///
    /// Implies [`initialize`](Self::initialize). A stopped control point can
    /// be started again; a terminated one cannot.
    pub fn start(&self) -> Result<()> {
        self.initialize()?;

        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Terminated => return Err(ControlPointError::Terminated),
            Lifecycle::Started => return Ok(()),
            _ => {}
        }

        self.event_server.start(self.notification_sink())?;

        if let Err(e) = self.ssdp.start(self.datagram_sink()) {
            self.event_server.stop();
            return Err(e);
        }

        let schedulers = self
            .expiration
            .start()
            .and_then(|_| self.renewal.start());
        if let Err(e) = schedulers {
            self.expiration.stop();
            self.renewal.stop();
            self.ssdp.stop();
            self.event_server.stop();
            return Err(ControlPointError::Transport(format!(
                "Failed to start scheduler thread: {}",
                e
            )));
        }

        self.started.store(true, Ordering::SeqCst);
        *lifecycle = Lifecycle::Started;
        tracing::info!("Control point started");
        Ok(())
    }

    /// Stop network activity; a no-op unless started.
    ///
    /// Every subscription is dropped and unsubscribed in the background, and
    /// every device is removed with a lost announcement.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle != Lifecycle::Started {
            return;
        }
        self.started.store(false, Ordering::SeqCst);

        self.ssdp.stop();

        for subscription in self.subscriptions.drain() {
            let client = Arc::clone(&self.event_client);
            let submitted = self.executors.parallel.submit(move || {
                if let Err(e) = client.unsubscribe(&subscription.service, &subscription.id) {
                    tracing::debug!("Unsubscribe of {} failed: {}", subscription.id, e);
                }
            });
            if !submitted {
                tracing::debug!("Unsubscribe not submitted; shutting down");
            }
        }

        self.expiration.stop();
        self.renewal.stop();
        self.event_server.stop();

        let removed = self.devices.remove_all();
        *lifecycle = Lifecycle::Stopped;
        tracing::info!("Control point stopped; {} device(s) removed", removed);
    }

    /// Stop, then drain and shut down the task substrate.
    ///
    /// Listeners are released afterwards, which ends any [`EventIterator`].
    pub fn terminate(&self) {
        if *self.lifecycle.lock() == Lifecycle::Terminated {
            return;
        }
        self.stop();

        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Terminated {
            return;
        }
        *lifecycle = Lifecycle::Terminated;
        drop(lifecycle);

        self.executors.terminate();
        self.listeners.clear();
        self.iterator.lock().take();
        tracing::info!("Control point terminated");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Terminated
    }

    fn ensure_started(&self) -> Result<()> {
        match *self.lifecycle.lock() {
            Lifecycle::Started => Ok(()),
            Lifecycle::Terminated => Err(ControlPointError::Terminated),
            _ => Err(ControlPointError::NotStarted),
        }
    }

    fn ensure_not_terminated(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(ControlPointError::Terminated);
        }
        Ok(())
    }

    // ---- discovery ----

    /// Multicast an M-SEARCH for `target`, or the configured default target.
    pub fn search(&self, target: Option<&str>) -> Result<()> {
        self.ensure_started()?;
        let target = target.unwrap_or(&self.config.default_search_target);
        let request = upnp_discovery::search_request(target, self.config.search_mx);
        tracing::debug!("Searching for {}", target);
        self.ssdp.send_multicast(request.as_bytes())
    }

    /// Transport receive callback: ingest one datagram.
    ///
    /// Ignored unless started. Rejected datagrams are logged at trace.
    pub fn handle_datagram(&self, raw: &[u8], source: SocketAddr, interface: &NetworkInterface) {
        ingest_datagram(&self.devices, &self.started, raw, source, interface);
    }

    fn datagram_sink(&self) -> DatagramSink {
        let devices = Arc::clone(&self.devices);
        let started = Arc::clone(&self.started);
        Arc::new(
            move |raw: &[u8], source: SocketAddr, interface: &NetworkInterface| {
                ingest_datagram(&devices, &started, raw, source, interface)
            },
        )
    }

    // ---- listeners ----

    pub fn add_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) {
        self.listeners.add_discovery(listener);
    }

    pub fn remove_discovery_listener(&self, listener: &Arc<dyn DiscoveryListener>) -> bool {
        self.listeners.remove_discovery(listener)
    }

    pub fn add_notify_listener(&self, listener: Arc<dyn NotifyListener>) {
        self.listeners.add_notify(listener);
    }

    pub fn remove_notify_listener(&self, listener: &Arc<dyn NotifyListener>) -> bool {
        self.listeners.remove_notify(listener)
    }

    /// Blocking iterator over every event of this control point.
    ///
    /// All returned iterators share one channel. After
    /// [`terminate`](Self::terminate) the iterator ends.
    pub fn iter(&self) -> EventIterator {
        let mut iterator = self.iterator.lock();
        if let Some(existing) = iterator.as_ref() {
            return existing.clone();
        }

        let (tx, rx) = mpsc::channel();
        let events = EventIterator::new(rx);
        if self.is_terminated() {
            return events;
        }

        let listener = Arc::new(ChannelListener::new(tx));
        self.listeners.add_discovery(listener.clone());
        self.listeners.add_notify(listener);
        *iterator = Some(events.clone());
        events
    }

    // ---- queries ----

    pub fn devices(&self) -> Vec<Device> {
        self.devices.devices()
    }

    /// Device by UDN; an embedded UDN resolves to its root device
    pub fn device(&self, udn: &str) -> Option<Device> {
        self.devices.device(udn)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.subscriptions()
    }

    pub fn subscription(&self, service: &ServiceRef) -> Option<Subscription> {
        self.subscriptions.for_service(service)
    }

    // ---- pinned devices ----

    /// Load the description at `location` and add the device as pinned.
    ///
    /// Blocks on the description load.
    pub fn add_pinned_device(&self, location: &str) -> Result<Device> {
        self.ensure_not_terminated()?;
        Ok(self.devices.add_pinned(location)?)
    }

    pub fn remove_pinned_device(&self, location: &str) -> bool {
        self.devices.remove_pinned(location)
    }

    // ---- subscriptions ----

    /// Subscribe to events of `service`.
    ///
    /// An existing subscription for the service is renewed instead; if that
    /// renewal fails a fresh subscription replaces it. With `keep_renewing`
    /// the renewal scheduler keeps the subscription alive until it is
    /// unsubscribed or its device goes away.
    pub fn subscribe(&self, service: &ServiceRef, keep_renewing: bool) -> Result<Subscription> {
        self.ensure_started()?;

        if !self.devices.contains(&service.device_udn) {
            return Err(ControlPointError::DeviceNotFound(service.device_udn.clone()));
        }
        if !service.is_evented() {
            return Err(ControlPointError::SubscriptionFailed(format!(
                "{} publishes no events",
                service
            )));
        }

        let timeout = self.config.subscription_timeout;

        if let Some(existing) = self.subscriptions.for_service(service) {
            match self.event_client.renew(service, &existing.id, timeout) {
                Ok(granted) => {
                    self.subscriptions.renewed(&existing.id, granted, Instant::now());
                    self.subscriptions.set_keep_renewing(&existing.id, keep_renewing);
                    if let Some(renewed) = self.subscriptions.get(&existing.id) {
                        tracing::debug!("Renewed existing subscription {} for {}", renewed.id, service);
                        return Ok(renewed);
                    }
                }
                Err(e) => {
                    tracing::debug!("Renewal of {} failed, subscribing again: {}", existing.id, e);
                    self.subscriptions.unregister(&existing.id);
                }
            }
        }

        let host = upnp_discovery::device::host_of(&service.event_sub_url).ok_or_else(|| {
            ControlPointError::SubscriptionFailed(format!(
                "Invalid event URL {}",
                service.event_sub_url
            ))
        })?;
        let callback_url = self.event_server.callback_url(&host).ok_or_else(|| {
            ControlPointError::SubscriptionFailed("Event server is not running".to_string())
        })?;

        let response = self.event_client.subscribe(service, &callback_url, timeout)?;
        let sid = response.sid.trim().to_string();
        if sid.is_empty() {
            return Err(ControlPointError::SubscriptionFailed(format!(
                "{} answered without a SID",
                service
            )));
        }

        if !self.devices.contains(&service.device_udn) {
            self.unsubscribe_in_background(service.clone(), sid);
            return Err(ControlPointError::DeviceNotFound(service.device_udn.clone()));
        }

        let (subscription, displaced) = self
            .subscriptions
            .register_replacing(&sid, service.clone(), response.timeout, keep_renewing)
            .ok_or_else(|| {
                ControlPointError::SubscriptionFailed(format!("{} answered without a SID", service))
            })?;
        if let Some(previous) = displaced {
            self.unsubscribe_in_background(previous.service, previous.id);
        }

        tracing::debug!(
            "Subscribed to {} as {} for {:?}",
            service,
            subscription.id,
            subscription.timeout
        );
        Ok(subscription)
    }

    /// Cancel the subscription of `service`.
    ///
    /// Succeeds without a network call when the subscription already expired.
    pub fn unsubscribe(&self, service: &ServiceRef) -> Result<()> {
        if let Some(subscription) = self.subscriptions.for_service(service) {
            self.subscriptions.unregister(&subscription.id);
            self.event_client
                .unsubscribe(service, &subscription.id)
                .map_err(ControlPointError::from)?;
            tracing::debug!("Unsubscribed {} from {}", subscription.id, service);
            return Ok(());
        }

        if self.subscriptions.take_expired_mark(service) {
            tracing::debug!("Subscription for {} had already expired", service);
            return Ok(());
        }

        Err(ControlPointError::NotSubscribed(service.to_string()))
    }

    fn unsubscribe_in_background(&self, service: ServiceRef, sid: String) {
        let client = Arc::clone(&self.event_client);
        self.executors.parallel.submit(move || {
            if let Err(e) = client.unsubscribe(&service, &sid) {
                tracing::debug!("Unsubscribe of {} failed: {}", sid, e);
            }
        });
    }

    // ---- events ----

    /// NOTIFY callback; returns `false` for an unknown SID.
    pub fn handle_notification(&self, payload: NotificationPayload) -> bool {
        self.notification_handler().handle(payload)
    }

    fn notification_handler(&self) -> NotificationHandler {
        NotificationHandler {
            subscriptions: Arc::clone(&self.subscriptions),
            executors: Arc::clone(&self.executors),
            listeners: Arc::clone(&self.listeners),
        }
    }

    fn notification_sink(&self) -> NotificationSink {
        let handler = self.notification_handler();
        Arc::new(move |payload: NotificationPayload| handler.handle(payload))
    }
}

impl Drop for ControlPoint {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn ingest_datagram(
    devices: &Arc<DeviceRegistry>,
    started: &AtomicBool,
    raw: &[u8],
    source: SocketAddr,
    interface: &NetworkInterface,
) {
    if !started.load(Ordering::SeqCst) {
        return;
    }
    match upnp_discovery::ingest(raw, source, interface) {
        Ok(message) => devices.on_message(message),
        Err(rejection) => tracing::trace!("Rejected datagram from {}: {}", source, rejection),
    }
}

/// Turns NOTIFY payloads into [`NotifyEvent`]s on the sequential queue
struct NotificationHandler {
    subscriptions: Arc<SubscriptionRegistry>,
    executors: Arc<TaskExecutors>,
    listeners: Arc<Listeners>,
}

impl NotificationHandler {
    fn handle(&self, payload: NotificationPayload) -> bool {
        let Some((service, gap)) = self
            .subscriptions
            .accept_event(&payload.subscription_id, payload.seq)
        else {
            return false;
        };

        if let Some(expected) = gap {
            tracing::warn!(
                "Event sequence gap on {}: expected {}, got {:?}",
                payload.subscription_id,
                expected,
                payload.seq
            );
        }

        let properties = match parse_property_set(&payload.event_xml) {
            Ok(properties) => properties,
            Err(e) => {
                tracing::warn!("Malformed event body for {}: {}", payload.subscription_id, e);
                return true;
            }
        };

        let event = NotifyEvent {
            subscription_id: payload.subscription_id,
            service,
            seq: payload.seq,
            properties,
        };
        let listeners = Arc::clone(&self.listeners);
        if !self.executors.sequential.submit(move || listeners.notify(&event)) {
            tracing::debug!("Event dropped; shutting down");
        }
        true
    }
}

/// Forwards registry changes to listeners and the other components
struct RegistryBridge {
    executors: Arc<TaskExecutors>,
    listeners: Arc<Listeners>,
    subscriptions: Arc<SubscriptionRegistry>,
    expiration_wakeup: Wakeup,
}

impl DeviceEvents for RegistryBridge {
    fn discovered(&self, device: Device) {
        let listeners = Arc::clone(&self.listeners);
        self.executors
            .sequential
            .submit(move || listeners.discovered(&device));
    }

    fn lost(&self, device: Device) {
        let listeners = Arc::clone(&self.listeners);
        self.executors
            .sequential
            .submit(move || listeners.lost(&device));
    }

    fn services_removed(&self, services: Vec<ServiceRef>) {
        for service in services {
            if let Some(subscription) = self.subscriptions.unregister_service(&service) {
                tracing::debug!("Dropped subscription {} of lost service {}", subscription.id, service);
            }
        }
    }

    fn deadline_changed(&self) {
        self.expiration_wakeup.notify();
    }
}

/// Renews with the event client and reports evictions to listeners
struct Renewer {
    devices: Arc<DeviceRegistry>,
    event_client: Arc<dyn EventClient>,
    timeout: Duration,
    executors: Arc<TaskExecutors>,
    listeners: Arc<Listeners>,
}

impl SubscriptionOwner for Renewer {
    fn device_present(&self, device_udn: &str) -> bool {
        self.devices.contains(device_udn)
    }

    fn renew(&self, subscription: &Subscription) -> std::result::Result<Duration, GenaError> {
        self.event_client
            .renew(&subscription.service, &subscription.id, self.timeout)
    }

    fn expired(&self, subscription: Subscription, reason: ExpiryReason) {
        tracing::info!(
            "Subscription {} for {} expired: {}",
            subscription.id,
            subscription.service,
            reason
        );
        let listeners = Arc::clone(&self.listeners);
        self.executors
            .sequential
            .submit(move || listeners.subscription_expired(&subscription, reason));
    }
}
