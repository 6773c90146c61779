//! Blocking HTTP loader for device descriptions.

use std::time::Duration;

use crate::device::DeviceDescriptor;
use crate::error::{DiscoveryError, Result};

/// Fetches and parses device descriptions over HTTP.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct HttpDescriptionLoader {
    http_client: reqwest::blocking::Client,
}

impl HttpDescriptionLoader {
    /// Create a loader whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    /// Fetch and parse the description served at `location`.
    pub fn load(&self, location: &str) -> Result<DeviceDescriptor> {
        tracing::debug!("Loading device description from {}", location);

        let response = self
            .http_client
            .get(location)
            .send()
            .map_err(|e| DiscoveryError::Network(format!("Failed to fetch device description: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Network(format!(
                "Device description request to {} failed: HTTP {}",
                location, status
            )));
        }

        let xml = response
            .text()
            .map_err(|e| DiscoveryError::Network(format!("Failed to read response body: {}", e)))?;

        DeviceDescriptor::from_xml(&xml, location)
    }
}
