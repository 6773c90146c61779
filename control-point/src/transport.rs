//! Collaborator seams of the control point and the default SSDP transport.
//!
//! The core only talks to the network through these traits, so tests can
//! drive it with in-memory fakes:
//!
//! | Trait | Default implementation |
//! |---|---|
//! | [`DescriptionLoader`] | [`HttpDescriptionLoader`] |
//! | [`EventClient`] | [`GenaClient`] |
//! | [`SsdpTransport`] | [`MulticastTransport`] |
//! | [`EventServer`] | [`HttpEventServer`](crate::callback::HttpEventServer) |

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use callback_server::NotificationSink;
use gena_client::{GenaClient, GenaError, SubscriptionResponse};
use parking_lot::Mutex;
use upnp_discovery::{interface, socket, DeviceDescriptor, DiscoveryError, HttpDescriptionLoader, NetworkInterface};

use crate::device::ServiceRef;
use crate::error::{ControlPointError, Result};

/// Receive callback for raw SSDP datagrams: bytes, sender, receiving interface
pub type DatagramSink = Arc<dyn Fn(&[u8], SocketAddr, &NetworkInterface) + Send + Sync>;

/// Fetches device descriptions; called from the parallel pool and from
/// `add_pinned_device` callers.
pub trait DescriptionLoader: Send + Sync {
    fn load(&self, location: &str) -> std::result::Result<DeviceDescriptor, DiscoveryError>;
}

impl DescriptionLoader for HttpDescriptionLoader {
    fn load(&self, location: &str) -> std::result::Result<DeviceDescriptor, DiscoveryError> {
        HttpDescriptionLoader::load(self, location)
    }
}

/// GENA requests against a service's event subscription URL.
pub trait EventClient: Send + Sync {
    fn subscribe(
        &self,
        service: &ServiceRef,
        callback_url: &str,
        timeout: Duration,
    ) -> std::result::Result<SubscriptionResponse, GenaError>;

    fn renew(
        &self,
        service: &ServiceRef,
        sid: &str,
        timeout: Duration,
    ) -> std::result::Result<Duration, GenaError>;

    fn unsubscribe(&self, service: &ServiceRef, sid: &str) -> std::result::Result<(), GenaError>;
}

impl EventClient for GenaClient {
    fn subscribe(
        &self,
        service: &ServiceRef,
        callback_url: &str,
        timeout: Duration,
    ) -> std::result::Result<SubscriptionResponse, GenaError> {
        GenaClient::subscribe(self, &service.event_sub_url, callback_url, timeout)
    }

    fn renew(
        &self,
        service: &ServiceRef,
        sid: &str,
        timeout: Duration,
    ) -> std::result::Result<Duration, GenaError> {
        GenaClient::renew(self, &service.event_sub_url, sid, timeout)
    }

    fn unsubscribe(&self, service: &ServiceRef, sid: &str) -> std::result::Result<(), GenaError> {
        GenaClient::unsubscribe(self, &service.event_sub_url, sid)
    }
}

/// Multicast send/receive for SSDP.
pub trait SsdpTransport: Send + Sync {
    /// Start listening; every received datagram is handed to `sink`
    fn start(&self, sink: DatagramSink) -> Result<()>;

    /// Send a datagram to the SSDP multicast group on every interface
    fn send_multicast(&self, data: &[u8]) -> Result<()>;

    fn stop(&self);
}

/// Receiver of GENA NOTIFY requests.
pub trait EventServer: Send + Sync {
    /// Start accepting notifications; `sink` answers whether a SID is known
    fn start(&self, sink: NotificationSink) -> Result<()>;

    /// Callback URL a device at `device_host` can reach, once started
    fn callback_url(&self, device_host: &str) -> Option<String>;

    fn stop(&self);
}

struct Listening {
    running: Arc<AtomicBool>,
    search_sockets: Vec<(UdpSocket, NetworkInterface)>,
    threads: Vec<JoinHandle<()>>,
}

/// SSDP over real sockets.
///
/// On start, opens a NOTIFY socket (shared port 1900, group joined) and a
/// search socket (ephemeral port) on every interface, each drained by its
/// own listener thread. Listener threads poll a stop flag between reads.
pub struct MulticastTransport {
    interfaces: Option<Vec<NetworkInterface>>,
    read_timeout: Duration,
    listening: Mutex<Option<Listening>>,
}

impl MulticastTransport {
    /// Transport on every non-loopback IPv4 interface
    pub fn new() -> Self {
        Self {
            interfaces: None,
            read_timeout: Duration::from_millis(250),
            listening: Mutex::new(None),
        }
    }

    /// Transport restricted to the given interfaces
    pub fn with_interfaces(interfaces: Vec<NetworkInterface>) -> Self {
        Self {
            interfaces: Some(interfaces),
            ..Self::new()
        }
    }

    /// Local addresses of the search sockets, while started
    pub fn search_addrs(&self) -> Vec<SocketAddr> {
        self.listening
            .lock()
            .as_ref()
            .map(|listening| {
                listening
                    .search_sockets
                    .iter()
                    .filter_map(|(socket, _)| socket.local_addr().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn spawn_listener(
        socket: &UdpSocket,
        interface: &NetworkInterface,
        kind: &str,
        running: &Arc<AtomicBool>,
        sink: &DatagramSink,
    ) -> std::io::Result<JoinHandle<()>> {
        let socket = socket.try_clone()?;
        let interface = interface.clone();
        let running = Arc::clone(running);
        let sink = Arc::clone(sink);

        thread::Builder::new()
            .name(format!("ssdp-{}-{}", kind, interface.name))
            .spawn(move || {
                let mut buf = [0u8; 8192];
                while running.load(Ordering::SeqCst) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, source)) => sink(&buf[..len], source, &interface),
                        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                        Err(e) => {
                            tracing::debug!("SSDP receive error on {}: {}", interface, e);
                            thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })
    }
}

impl Default for MulticastTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SsdpTransport for MulticastTransport {
    fn start(&self, sink: DatagramSink) -> Result<()> {
        let mut listening = self.listening.lock();
        if listening.is_some() {
            return Ok(());
        }

        let interfaces = match &self.interfaces {
            Some(interfaces) => interfaces.clone(),
            None => interface::list()
                .map_err(|e| ControlPointError::Transport(format!("Failed to list interfaces: {}", e)))?,
        };

        let running = Arc::new(AtomicBool::new(true));
        let mut search_sockets = Vec::new();
        let mut threads = Vec::new();

        for iface in &interfaces {
            let Some(ip) = iface.ipv4() else {
                continue;
            };

            match socket::notify_socket(ip, self.read_timeout) {
                Ok(notify) => match Self::spawn_listener(&notify, iface, "notify", &running, &sink) {
                    Ok(handle) => threads.push(handle),
                    Err(e) => tracing::warn!("Failed to start NOTIFY listener on {}: {}", iface, e),
                },
                Err(e) => tracing::warn!("Failed to open NOTIFY socket on {}: {}", iface, e),
            }

            match socket::search_socket(ip, self.read_timeout) {
                Ok(search) => match Self::spawn_listener(&search, iface, "search", &running, &sink) {
                    Ok(handle) => {
                        threads.push(handle);
                        search_sockets.push((search, iface.clone()));
                    }
                    Err(e) => tracing::warn!("Failed to start search listener on {}: {}", iface, e),
                },
                Err(e) => tracing::warn!("Failed to open search socket on {}: {}", iface, e),
            }
        }

        if threads.is_empty() {
            return Err(ControlPointError::Transport(
                "No SSDP socket could be opened on any interface".to_string(),
            ));
        }

        tracing::info!(
            "SSDP transport listening with {} socket(s) on {} interface(s)",
            threads.len(),
            interfaces.len()
        );

        *listening = Some(Listening {
            running,
            search_sockets,
            threads,
        });
        Ok(())
    }

    fn send_multicast(&self, data: &[u8]) -> Result<()> {
        let listening = self.listening.lock();
        let listening = listening
            .as_ref()
            .ok_or_else(|| ControlPointError::Transport("SSDP transport is not started".to_string()))?;

        let target = socket::multicast_target();
        let mut sent = 0;
        for (socket, iface) in &listening.search_sockets {
            match socket.send_to(data, target) {
                Ok(_) => sent += 1,
                Err(e) => tracing::debug!("M-SEARCH send failed on {}: {}", iface, e),
            }
        }

        if sent == 0 {
            return Err(ControlPointError::Transport(
                "Datagram could not be sent on any interface".to_string(),
            ));
        }
        Ok(())
    }

    fn stop(&self) {
        let Some(listening) = self.listening.lock().take() else {
            return;
        };

        listening.running.store(false, Ordering::SeqCst);
        for handle in listening.threads {
            let _ = handle.join();
        }
        tracing::info!("SSDP transport stopped");
    }
}
