//! Test helpers for fixture-based integration tests

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

/// A device description fixture served from a given address
#[derive(Debug, Clone)]
pub struct DeviceFixture {
    pub name: String,
    pub ip: String,
    pub xml_content: String,
}

impl DeviceFixture {
    /// Load a fixture from the fixtures directory
    pub fn load(filename: &str, ip: &str) -> Self {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("tests/fixtures");
        path.push(filename);

        let xml_content = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("Failed to load fixture {}: {}", filename, e));

        Self {
            name: filename.to_string(),
            ip: ip.to_string(),
            xml_content,
        }
    }

    /// The description URL this device would announce
    pub fn location_url(&self) -> String {
        format!("http://{}:49152/description.xml", self.ip)
    }

    /// An `ssdp:alive` NOTIFY announcing this device
    pub fn alive(&self, uuid: &str, max_age: u64) -> String {
        format!(
            "NOTIFY * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             CACHE-CONTROL: max-age={}\r\n\
             LOCATION: {}\r\n\
             NT: upnp:rootdevice\r\n\
             NTS: ssdp:alive\r\n\
             SERVER: Linux/5.15 UPnP/1.0 Fixture/1.0\r\n\
             USN: uuid:{}::upnp:rootdevice\r\n\r\n",
            max_age,
            self.location_url(),
            uuid
        )
    }

    /// A unicast M-SEARCH response for this device
    pub fn search_response(&self, uuid: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\n\
             CACHE-CONTROL: max-age = 1800\r\n\
             EXT:\r\n\
             LOCATION: {}\r\n\
             SERVER: Linux/5.15 UPnP/1.0 Fixture/1.0\r\n\
             ST: upnp:rootdevice\r\n\
             USN: uuid:{}::upnp:rootdevice\r\n\r\n",
            self.location_url(),
            uuid
        )
    }
}
