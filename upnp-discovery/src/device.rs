//! UPnP device description parsing.
//!
//! Parses the XML served at a device's `LOCATION` into a [`DeviceDescriptor`]
//! tree. Relative service URLs are resolved against `URLBase` when the
//! document declares one, otherwise against the location itself.

use serde::Deserialize;
use url::Url;

use crate::error::{DiscoveryError, Result};

/// UPnP device description root element.
#[derive(Debug, Deserialize)]
struct Root {
    #[serde(rename = "URLBase")]
    url_base: Option<String>,
    device: RawDevice,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDevice {
    device_type: String,
    #[serde(default)]
    friendly_name: String,
    #[serde(default)]
    manufacturer: String,
    #[serde(default)]
    model_name: String,
    #[serde(rename = "UDN")]
    udn: String,
    service_list: Option<RawServiceList>,
    device_list: Option<RawDeviceList>,
}

#[derive(Debug, Deserialize)]
struct RawServiceList {
    #[serde(rename = "service", default)]
    services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceList {
    #[serde(rename = "device", default)]
    devices: Vec<RawDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawService {
    service_type: String,
    service_id: String,
    #[serde(rename = "SCPDURL", default)]
    scpd_url: String,
    #[serde(rename = "controlURL", default)]
    control_url: String,
    #[serde(rename = "eventSubURL", default)]
    event_sub_url: String,
}

/// A service advertised by a device, with absolute URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service_type: String,
    pub service_id: String,
    pub scpd_url: String,
    pub control_url: String,
    /// Empty when the service does not publish events
    pub event_sub_url: String,
}

/// A parsed device description, including nested embedded devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub udn: String,
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    /// URL the description was fetched from
    pub location: String,
    pub services: Vec<ServiceDescriptor>,
    pub embedded: Vec<DeviceDescriptor>,
}

impl DeviceDescriptor {
    /// Parse a device description document fetched from `location`.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Parse` for malformed XML or URLs and
    /// `DiscoveryError::InvalidDevice` when a device carries no usable UDN.
    pub fn from_xml(xml: &str, location: &str) -> Result<Self> {
        let root: Root = quick_xml::de::from_str(xml)
            .map_err(|e| DiscoveryError::Parse(format!("Failed to parse device XML: {}", e)))?;

        let base = match root.url_base.as_deref().map(str::trim) {
            Some(url_base) if !url_base.is_empty() => Url::parse(url_base),
            _ => Url::parse(location),
        }
        .map_err(|e| DiscoveryError::Parse(format!("Invalid base URL: {}", e)))?;

        Self::from_raw(root.device, location, &base)
    }

    fn from_raw(raw: RawDevice, location: &str, base: &Url) -> Result<Self> {
        let udn = raw.udn.trim().to_string();
        if udn.len() <= 5 || !udn.starts_with("uuid:") {
            return Err(DiscoveryError::InvalidDevice(format!(
                "device {:?} has invalid UDN {:?}",
                raw.friendly_name, raw.udn
            )));
        }

        let services = raw
            .service_list
            .map(|list| list.services)
            .unwrap_or_default()
            .into_iter()
            .map(|service| {
                Ok(ServiceDescriptor {
                    scpd_url: resolve(base, &service.scpd_url)?,
                    control_url: resolve(base, &service.control_url)?,
                    event_sub_url: resolve(base, &service.event_sub_url)?,
                    service_type: service.service_type.trim().to_string(),
                    service_id: service.service_id.trim().to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let embedded = raw
            .device_list
            .map(|list| list.devices)
            .unwrap_or_default()
            .into_iter()
            .map(|device| Self::from_raw(device, location, base))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            udn,
            device_type: raw.device_type.trim().to_string(),
            friendly_name: raw.friendly_name,
            manufacturer: raw.manufacturer,
            model_name: raw.model_name,
            location: location.to_string(),
            services,
            embedded,
        })
    }

    /// UDNs of every embedded device, at any depth.
    pub fn embedded_udns(&self) -> Vec<String> {
        let mut udns = Vec::new();
        for device in &self.embedded {
            udns.push(device.udn.clone());
            udns.extend(device.embedded_udns());
        }
        udns
    }

    /// Services of this device and of all embedded devices, paired with the
    /// UDN of the device that owns them.
    pub fn all_services(&self) -> Vec<(&str, &ServiceDescriptor)> {
        let mut services: Vec<(&str, &ServiceDescriptor)> = self
            .services
            .iter()
            .map(|service| (self.udn.as_str(), service))
            .collect();
        for device in &self.embedded {
            services.extend(device.all_services());
        }
        services
    }
}

fn resolve(base: &Url, reference: &str) -> Result<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Ok(String::new());
    }
    base.join(reference)
        .map(String::from)
        .map_err(|e| DiscoveryError::Parse(format!("Invalid URL {:?}: {}", reference, e)))
}

/// Host portion of a URL, e.g. the device address of an event URL.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|host| {
        host.trim_start_matches('[')
            .trim_end_matches(']')
            .to_string()
    })
}
