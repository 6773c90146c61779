//! SSDP discovery building blocks for a UPnP control point.
//!
//! This crate covers everything between the wire and the device registry:
//!
//! - [`ssdp`]: parses received datagrams into [`DiscoveryMessage`]s and
//!   rejects malformed or spoofed announcements
//! - [`interface`] and [`socket`]: local network interfaces and the
//!   multicast/search sockets bound on them
//! - [`device`] and [`HttpDescriptionLoader`]: fetching and modelling the
//!   device description served at an announcement's location
//!
//! # Ingesting a datagram
//!
//! ```
//! use upnp_discovery::{ingest, MessageKind, NetworkInterface};
//!
//! let raw = "NOTIFY * HTTP/1.1\r\n\
//!            HOST: 239.255.255.250:1900\r\n\
//!            CACHE-CONTROL: max-age=1800\r\n\
//!            LOCATION: http://192.168.1.20:49152/description.xml\r\n\
//!            NT: upnp:rootdevice\r\n\
//!            NTS: ssdp:alive\r\n\
//!            USN: uuid:2fac1234-31f8-11b4-a222-08002b34c003::upnp:rootdevice\r\n\r\n";
//!
//! let iface = NetworkInterface::new("eth0", "192.168.1.2".parse().unwrap(), 24);
//! let msg = ingest(raw.as_bytes(), "192.168.1.20:1900".parse().unwrap(), &iface).unwrap();
//!
//! assert_eq!(msg.kind, MessageKind::Alive);
//! assert_eq!(msg.stable_id, "uuid:2fac1234-31f8-11b4-a222-08002b34c003");
//! ```

mod error;
mod loader;
pub mod device;
pub mod interface;
pub mod socket;
pub mod ssdp;

pub use device::{DeviceDescriptor, ServiceDescriptor};
pub use error::{DiscoveryError, Result};
pub use interface::NetworkInterface;
pub use loader::HttpDescriptionLoader;
pub use ssdp::{ingest, parse_udn, search_request, DiscoveryMessage, MessageKind, Rejection};
