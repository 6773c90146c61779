//! Device registry
//!
//! Tracks every device the control point knows about, in one of two states:
//!
//! - **pending**: an announcement was accepted and the description load is
//!   queued or running on the parallel pool
//! - **discovered**: the description loaded; the device is visible to the
//!   application until it says byebye, its liveness deadline passes, or it is
//!   removed explicitly
//!
//! All state lives behind one lock. Observers are told about changes through
//! [`DeviceEvents`]: discover and lost calls happen while the lock is held so
//! they are queued in mutation order, while `services_removed` runs after the
//! lock is released but before the mutating call returns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use upnp_discovery::{DeviceDescriptor, DiscoveryError, DiscoveryMessage};

use crate::device::{Device, ServiceRef};
use crate::executor::TaskExecutors;
use crate::transport::DescriptionLoader;

/// Observer of registry changes.
pub trait DeviceEvents: Send + Sync {
    /// A device became visible. Called with the registry lock held; must not
    /// call back into the registry.
    fn discovered(&self, device: Device);

    /// A discovered device went away. Called with the registry lock held.
    fn lost(&self, device: Device);

    /// Services of removed devices. Called after the lock is released.
    fn services_removed(&self, services: Vec<ServiceRef>);

    /// The earliest liveness deadline may have changed.
    fn deadline_changed(&self);
}

#[derive(Debug, Clone)]
struct PendingDevice {
    location: String,
    expires_at: Instant,
    source: SocketAddr,
}

#[derive(Default)]
struct RegistryState {
    pending: HashMap<String, PendingDevice>,
    discovered: HashMap<String, Device>,
    /// Embedded UDN to the UDN of its root device
    embedded_index: HashMap<String, String>,
    /// Pinned location to UDN
    pinned_locations: HashMap<String, String>,
}

impl RegistryState {
    fn remove_device(&mut self, udn: &str) -> Option<Device> {
        let device = self.discovered.remove(udn)?;
        self.embedded_index.retain(|_, root| root != udn);
        if device.is_pinned {
            self.pinned_locations.retain(|_, pinned| pinned != udn);
        }
        Some(device)
    }

    /// Index the embedded devices of `device`, dropping pending entries for
    /// them and evicting any that were discovered as top-level devices.
    fn index_embedded(&mut self, device: &Device, events: &dyn DeviceEvents) -> Vec<ServiceRef> {
        let mut removed = Vec::new();
        for embedded in &device.embedded_udns {
            self.pending.remove(embedded);
            if let Some(evicted) = self.remove_device(embedded) {
                tracing::debug!(
                    "{} is embedded in {}; dropping top-level entry",
                    embedded,
                    device.udn
                );
                removed.extend(evicted.services.iter().cloned());
                events.lost(evicted);
            }
            self.embedded_index
                .insert(embedded.clone(), device.udn.clone());
        }
        removed
    }
}

/// Registry of pending and discovered root devices.
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
    loader: Arc<dyn DescriptionLoader>,
    executors: Arc<TaskExecutors>,
    events: Arc<dyn DeviceEvents>,
}

impl DeviceRegistry {
    pub fn new(
        loader: Arc<dyn DescriptionLoader>,
        executors: Arc<TaskExecutors>,
        events: Arc<dyn DeviceEvents>,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            loader,
            executors,
            events,
        }
    }

    /// Apply one ingested discovery message.
    pub fn on_message(self: &Arc<Self>, msg: DiscoveryMessage) {
        let mut removed = Vec::new();
        let mut deadline_changed = false;

        {
            let mut state = self.state.lock();
            let id = msg.stable_id.as_str();

            if state.embedded_index.contains_key(id) {
                tracing::trace!("Ignoring announcement for embedded device {}", id);
                return;
            }

            if let Some(pinned) = state.discovered.get(id).map(|device| device.is_pinned) {
                if pinned {
                    tracing::trace!("Ignoring announcement for pinned device {}", id);
                    return;
                }

                if msg.is_byebye() {
                    if let Some(device) = state.remove_device(id) {
                        tracing::debug!("Device {} said byebye", id);
                        removed = device.services.clone();
                        self.events.lost(device);
                    }
                } else if let Some(device) = state.discovered.get_mut(id) {
                    let expires_at = msg.expires_at();
                    if device.expires_at != Some(expires_at) {
                        device.expires_at = Some(expires_at);
                        deadline_changed = true;
                    }
                    if let Some(location) = msg.location {
                        device.location = location;
                    }
                    device.source = Some(msg.source);
                }
            } else if state.pending.contains_key(id) {
                if msg.is_byebye() {
                    tracing::debug!("Pending device {} said byebye; load result will be dropped", id);
                    state.pending.remove(id);
                } else if let Some(pending) = state.pending.get_mut(id) {
                    pending.expires_at = msg.expires_at();
                    pending.source = msg.source;
                    if let Some(location) = msg.location {
                        pending.location = location;
                    }
                }
            } else if !msg.is_byebye() {
                let Some(location) = msg.location.clone() else {
                    return;
                };
                let udn = msg.stable_id.clone();
                tracing::debug!("New device {} at {}", udn, location);

                state.pending.insert(
                    udn.clone(),
                    PendingDevice {
                        location,
                        expires_at: msg.expires_at(),
                        source: msg.source,
                    },
                );

                let registry = Arc::downgrade(self);
                let task_udn = udn.clone();
                let submitted = self
                    .executors
                    .parallel
                    .submit(move || load_pending(registry, &task_udn));
                if !submitted {
                    tracing::debug!("Load of {} not submitted; shutting down", udn);
                    state.pending.remove(&udn);
                }
            }
        }

        if !removed.is_empty() {
            self.events.services_removed(removed);
        }
        if deadline_changed {
            self.events.deadline_changed();
        }
    }

    /// Complete a description load started for a pending device.
    pub fn on_load_complete(
        &self,
        udn: &str,
        result: Result<DeviceDescriptor, DiscoveryError>,
    ) {
        let removed;
        {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.remove(udn) else {
                tracing::debug!("Load finished for {} which is no longer pending", udn);
                return;
            };

            let descriptor = match result {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::debug!("Failed to load {} from {}: {}", udn, pending.location, e);
                    return;
                }
            };

            if descriptor.udn != udn {
                tracing::debug!(
                    "Description at {} describes {} instead of {}; dropping",
                    pending.location,
                    descriptor.udn,
                    udn
                );
                return;
            }

            if state.discovered.contains_key(udn) {
                tracing::debug!("{} was discovered while its load was running", udn);
                return;
            }

            let device = Device::new(
                descriptor,
                pending.location,
                Some(pending.expires_at),
                Some(pending.source),
            );
            removed = state.index_embedded(&device, self.events.as_ref());
            state.discovered.insert(device.udn.clone(), device.clone());
            tracing::debug!("Device {} discovered", udn);
            self.events.discovered(device);
        }

        if !removed.is_empty() {
            self.events.services_removed(removed);
        }
        self.events.deadline_changed();
    }

    /// Load the description at `location` on the calling thread and add the
    /// device as pinned.
    ///
    /// Pinned devices never expire and ignore SSDP announcements. Pinning an
    /// already pinned location returns the existing device.
    pub fn add_pinned(&self, location: &str) -> Result<Device, DiscoveryError> {
        if let Some(existing) = self.pinned_device(location) {
            return Ok(existing);
        }

        let descriptor = self.loader.load(location)?;

        let mut removed = Vec::new();
        let device;
        {
            let mut state = self.state.lock();
            let existing = state
                .pinned_locations
                .get(location)
                .and_then(|udn| state.discovered.get(udn))
                .cloned();
            if let Some(existing) = existing {
                return Ok(existing);
            }

            let udn = descriptor.udn.clone();
            state.pending.remove(&udn);
            if let Some(replaced) = state.remove_device(&udn) {
                tracing::debug!("Pinned {} replaces the discovered device", udn);
                removed.extend(replaced.services.iter().cloned());
                self.events.lost(replaced);
            }

            device = Device::pinned(descriptor, location.to_string());
            removed.extend(state.index_embedded(&device, self.events.as_ref()));
            state
                .pinned_locations
                .insert(location.to_string(), udn.clone());
            state.discovered.insert(udn, device.clone());
            tracing::info!("Pinned device {} at {}", device.udn, location);
            self.events.discovered(device.clone());
        }

        if !removed.is_empty() {
            self.events.services_removed(removed);
        }
        Ok(device)
    }

    /// Remove the device pinned at `location`; returns whether one was removed.
    pub fn remove_pinned(&self, location: &str) -> bool {
        let removed;
        {
            let mut state = self.state.lock();
            let Some(udn) = state.pinned_locations.remove(location) else {
                return false;
            };
            let Some(device) = state.remove_device(&udn) else {
                return false;
            };
            tracing::info!("Unpinned device {} at {}", udn, location);
            removed = device.services.clone();
            self.events.lost(device);
        }

        if !removed.is_empty() {
            self.events.services_removed(removed);
        }
        true
    }

    /// Remove every device, announcing each discovered one as lost.
    pub fn remove_all(&self) -> usize {
        let mut removed = Vec::new();
        let count;
        {
            let mut state = self.state.lock();
            state.pending.clear();
            state.embedded_index.clear();
            state.pinned_locations.clear();

            let devices: Vec<Device> = state.discovered.drain().map(|(_, device)| device).collect();
            count = devices.len();
            for device in devices {
                removed.extend(device.services.iter().cloned());
                self.events.lost(device);
            }
        }

        if !removed.is_empty() {
            self.events.services_removed(removed);
        }
        count
    }

    /// Evict every device whose deadline is at or before `now`.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut removed = Vec::new();
        let mut count = 0;
        {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .discovered
                .values()
                .filter(|device| device.is_expired(now))
                .map(|device| device.udn.clone())
                .collect();

            for udn in expired {
                if let Some(device) = state.remove_device(&udn) {
                    tracing::debug!("Device {} expired", udn);
                    removed.extend(device.services.iter().cloned());
                    self.events.lost(device);
                    count += 1;
                }
            }
        }

        if !removed.is_empty() {
            self.events.services_removed(removed);
        }
        count
    }

    /// Earliest deadline among discovered, non-pinned devices
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .discovered
            .values()
            .filter_map(|device| device.expires_at)
            .min()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.state.lock().discovered.values().cloned().collect()
    }

    /// The root device with `udn`, or the root device embedding it
    pub fn device(&self, udn: &str) -> Option<Device> {
        let state = self.state.lock();
        let root = state
            .embedded_index
            .get(udn)
            .map(String::as_str)
            .unwrap_or(udn);
        state.discovered.get(root).cloned()
    }

    /// Whether `udn` is a discovered root device or embedded in one
    pub fn contains(&self, udn: &str) -> bool {
        let state = self.state.lock();
        state.discovered.contains_key(udn) || state.embedded_index.contains_key(udn)
    }

    pub fn is_pending(&self, udn: &str) -> bool {
        self.state.lock().pending.contains_key(udn)
    }

    /// Number of discovered root devices
    pub fn len(&self) -> usize {
        self.state.lock().discovered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pinned_device(&self, location: &str) -> Option<Device> {
        let state = self.state.lock();
        let udn = state.pinned_locations.get(location)?;
        state.discovered.get(udn).cloned()
    }
}

/// Body of a load task: reads the latest pending location when it starts.
fn load_pending(registry: Weak<DeviceRegistry>, udn: &str) {
    let Some(registry) = registry.upgrade() else {
        return;
    };

    let location = match registry.state.lock().pending.get(udn) {
        Some(pending) => pending.location.clone(),
        None => return,
    };

    let result = registry.loader.load(&location);
    registry.on_load_complete(udn, result);
}
