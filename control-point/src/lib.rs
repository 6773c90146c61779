//! # UPnP Control Point
//!
//! Discovers UPnP devices, tracks which of them are alive, and keeps GENA
//! event subscriptions to their services running.
//!
//! ## Overview
//!
//! Multicast announcements arrive unordered and unreliably. The control point
//! reconciles them into a consistent view of which devices exist right now
//! and which subscriptions must be renewed, and delivers every change to the
//! application on a single thread, in order.
//!
//! - [`DeviceRegistry`]: pending and discovered devices, embedded device
//!   deduplication, pinned devices
//! - [`ExpirationScheduler`]: evicts devices whose announcements lapsed
//! - [`SubscriptionRegistry`] and [`RenewalScheduler`]: subscription
//!   lifetimes, renewal and eviction
//! - [`TaskExecutors`]: a parallel pool for blocking work and a sequential
//!   queue for application callbacks
//! - [`ControlPoint`]: composes the above behind a synchronous API
//!
//! Network access goes through the traits in [`transport`], each with a
//! default implementation.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use upnp_control_point::{ControlPoint, ControlPointConfig, ControlPointEvent};
//! use std::time::Duration;
//!
//! let control_point = ControlPoint::builder()
//!     .config(ControlPointConfig::new().with_subscription_timeout(Duration::from_secs(600)))
//!     .build()?;
//!
//! let events = control_point.iter();
//! control_point.start()?;
//! control_point.search(Some("urn:schemas-upnp-org:device:MediaRenderer:1"))?;
//!
//! for event in events {
//!     match event {
//!         ControlPointEvent::Discovered(device) => {
//!             if let Some(service) = device.service_by_type("urn:schemas-upnp-org:service:AVTransport") {
//!                 control_point.subscribe(service, true)?;
//!             }
//!         }
//!         ControlPointEvent::Notify(event) => {
//!             println!("{}: {:?}", event.service, event.property("LastChange"));
//!         }
//!         ControlPointEvent::Lost(device) => println!("{} is gone", device.udn),
//!         ControlPointEvent::SubscriptionExpired { subscription, reason } => {
//!             println!("{} expired: {}", subscription.id, reason);
//!         }
//!     }
//! }
//! # Ok::<(), upnp_control_point::ControlPointError>(())
//! ```

pub mod callback;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod executor;
pub mod expiration;
pub mod registry;
pub mod subscription;
pub mod transport;

mod control_point;
mod schedule;

pub use callback::HttpEventServer;
pub use config::ControlPointConfig;
pub use control_point::{ControlPoint, ControlPointBuilder};
pub use device::{Device, ServiceRef};
pub use error::{ControlPointError, Result};
pub use events::{ControlPointEvent, DiscoveryListener, EventIterator, NotifyEvent, NotifyListener};
pub use executor::{ParallelExecutor, SequentialExecutor, ShutdownMode, TaskExecutors};
pub use expiration::ExpirationScheduler;
pub use registry::{DeviceEvents, DeviceRegistry};
pub use subscription::{ExpiryReason, RenewalScheduler, Subscription, SubscriptionOwner, SubscriptionRegistry};
pub use transport::{DatagramSink, DescriptionLoader, EventClient, EventServer, MulticastTransport, SsdpTransport};

// Re-export commonly used types from the collaborator crates
pub use callback_server::NotificationPayload;
pub use gena_client::{GenaError, SubscriptionResponse};
pub use upnp_discovery::{DeviceDescriptor, DiscoveryError, NetworkInterface, ServiceDescriptor};
