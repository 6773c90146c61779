//! Discovered devices and references to their services.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use upnp_discovery::DeviceDescriptor;

/// Reference to one service of a discovered device.
///
/// Identifies the service by device UDN and service ID; it never keeps the
/// device alive. Look the device up again through the control point when
/// current state is needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    /// UDN of the root or embedded device that owns the service
    pub device_udn: String,
    pub service_id: String,
    pub service_type: String,
    /// Absolute event subscription URL; empty when the service has no events
    pub event_sub_url: String,
    pub control_url: String,
}

impl ServiceRef {
    /// Whether the service publishes events
    pub fn is_evented(&self) -> bool {
        !self.event_sub_url.is_empty()
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.device_udn, self.service_id)
    }
}

/// A discovered root device.
#[derive(Debug, Clone)]
pub struct Device {
    pub udn: String,
    /// Description URL the device was loaded from
    pub location: String,
    /// Liveness deadline; `None` for pinned devices, which never expire
    pub expires_at: Option<Instant>,
    /// UDNs of all embedded devices, at any depth
    pub embedded_udns: HashSet<String>,
    pub is_pinned: bool,
    /// Services of the root device and every embedded device
    pub services: Vec<ServiceRef>,
    pub descriptor: DeviceDescriptor,
    /// Address of the last announcement; `None` for pinned devices
    pub source: Option<SocketAddr>,
}

impl Device {
    pub(crate) fn new(
        descriptor: DeviceDescriptor,
        location: String,
        expires_at: Option<Instant>,
        source: Option<SocketAddr>,
    ) -> Self {
        let services = descriptor
            .all_services()
            .into_iter()
            .map(|(udn, service)| ServiceRef {
                device_udn: udn.to_string(),
                service_id: service.service_id.clone(),
                service_type: service.service_type.clone(),
                event_sub_url: service.event_sub_url.clone(),
                control_url: service.control_url.clone(),
            })
            .collect();

        Self {
            udn: descriptor.udn.clone(),
            location,
            is_pinned: false,
            expires_at,
            embedded_udns: descriptor.embedded_udns().into_iter().collect(),
            services,
            descriptor,
            source,
        }
    }

    pub(crate) fn pinned(descriptor: DeviceDescriptor, location: String) -> Self {
        Self {
            is_pinned: true,
            ..Self::new(descriptor, location, None, None)
        }
    }

    pub fn friendly_name(&self) -> &str {
        &self.descriptor.friendly_name
    }

    pub fn device_type(&self) -> &str {
        &self.descriptor.device_type
    }

    /// Find a service by its service ID
    pub fn service(&self, service_id: &str) -> Option<&ServiceRef> {
        self.services
            .iter()
            .find(|service| service.service_id == service_id)
    }

    /// Find the first service whose type starts with `service_type`
    ///
    /// Matching by prefix lets `urn:schemas-upnp-org:service:AVTransport`
    /// find any version of the service.
    pub fn service_by_type(&self, service_type: &str) -> Option<&ServiceRef> {
        self.services
            .iter()
            .find(|service| service.service_type.starts_with(service_type))
    }

    /// Whether `udn` names this device or one of its embedded devices
    pub fn owns(&self, udn: &str) -> bool {
        self.udn == udn || self.embedded_udns.contains(udn)
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use upnp_discovery::ServiceDescriptor;

    fn service(id: &str, event_sub_url: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            service_type: format!("urn:schemas-upnp-org:service:{}:1", id),
            service_id: format!("urn:upnp-org:serviceId:{}", id),
            scpd_url: format!("http://10.0.0.5/{}.xml", id),
            control_url: format!("http://10.0.0.5/{}/control", id),
            event_sub_url: event_sub_url.to_string(),
        }
    }

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            udn: "uuid:root".to_string(),
            device_type: "urn:schemas-upnp-org:device:MediaRenderer:1".to_string(),
            friendly_name: "Living Room".to_string(),
            manufacturer: "Acme".to_string(),
            model_name: "One".to_string(),
            location: "http://10.0.0.5/desc.xml".to_string(),
            services: vec![service("AVTransport", "http://10.0.0.5/avt/event")],
            embedded: vec![DeviceDescriptor {
                udn: "uuid:child".to_string(),
                device_type: "urn:schemas-upnp-org:device:Child:1".to_string(),
                friendly_name: "Child".to_string(),
                manufacturer: String::new(),
                model_name: String::new(),
                location: "http://10.0.0.5/desc.xml".to_string(),
                services: vec![service("RenderingControl", "")],
                embedded: vec![],
            }],
        }
    }

    #[test]
    fn test_device_collects_services_of_embedded_devices() {
        let device = Device::new(
            descriptor(),
            "http://10.0.0.5/desc.xml".to_string(),
            Some(Instant::now() + Duration::from_secs(60)),
            Some("10.0.0.5:1900".parse().unwrap()),
        );

        assert_eq!(device.udn, "uuid:root");
        assert!(!device.is_pinned);
        assert_eq!(device.services.len(), 2);
        assert!(device.owns("uuid:child"));
        assert!(!device.owns("uuid:other"));

        let rendering = device
            .service_by_type("urn:schemas-upnp-org:service:RenderingControl")
            .unwrap();
        assert_eq!(rendering.device_udn, "uuid:child");
        assert!(!rendering.is_evented());

        let transport = device.service("urn:upnp-org:serviceId:AVTransport").unwrap();
        assert_eq!(transport.device_udn, "uuid:root");
        assert!(transport.is_evented());
        assert_eq!(
            transport.to_string(),
            "uuid:root::urn:upnp-org:serviceId:AVTransport"
        );
    }

    #[test]
    fn test_pinned_device_never_expires() {
        let device = Device::pinned(descriptor(), "http://10.0.0.5/desc.xml".to_string());
        assert!(device.is_pinned);
        assert!(device.expires_at.is_none());
        assert!(device.source.is_none());
        assert!(!device.is_expired(Instant::now() + Duration::from_secs(86_400)));
    }

    #[test]
    fn test_is_expired() {
        let now = Instant::now();
        let device = Device::new(
            descriptor(),
            "http://10.0.0.5/desc.xml".to_string(),
            Some(now + Duration::from_secs(5)),
            None,
        );
        assert!(!device.is_expired(now));
        assert!(device.is_expired(now + Duration::from_secs(5)));
    }
}
