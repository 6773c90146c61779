//! In-memory collaborators for driving a control point without a network

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use upnp_control_point::transport::{
    DatagramSink, DescriptionLoader, EventClient, EventServer, SsdpTransport,
};
use upnp_control_point::{
    ControlPoint, ControlPointConfig, ControlPointEvent, DeviceDescriptor, DiscoveryError,
    EventIterator, GenaError, NetworkInterface, ServiceDescriptor, ServiceRef,
    SubscriptionResponse,
};

pub const DEVICE_IP: &str = "10.0.0.5";
pub const LOCATION: &str = "http://10.0.0.5:80/desc.xml";
pub const CALLBACK_URL: &str = "http://10.0.0.1:49152/";

pub fn interface() -> NetworkInterface {
    NetworkInterface::new("eth0", "10.0.0.1".parse().unwrap(), 24)
}

pub fn source() -> SocketAddr {
    format!("{}:1900", DEVICE_IP).parse().unwrap()
}

pub fn alive(udn: &str, location: &str, max_age: u64) -> Vec<u8> {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         CACHE-CONTROL: max-age={}\r\n\
         LOCATION: {}\r\n\
         NT: upnp:rootdevice\r\n\
         NTS: ssdp:alive\r\n\
         USN: {}::upnp:rootdevice\r\n\r\n",
        max_age, location, udn
    )
    .into_bytes()
}

pub fn byebye(udn: &str) -> Vec<u8> {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         NT: upnp:rootdevice\r\n\
         NTS: ssdp:byebye\r\n\
         USN: {}::upnp:rootdevice\r\n\r\n",
        udn
    )
    .into_bytes()
}

pub fn search_response(udn: &str, location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age=1800\r\n\
         EXT:\r\n\
         LOCATION: {}\r\n\
         ST: upnp:rootdevice\r\n\
         USN: {}::upnp:rootdevice\r\n\r\n",
        location, udn
    )
    .into_bytes()
}

/// Root device with one evented AVTransport-like service
pub fn descriptor(udn: &str, location: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        udn: udn.to_string(),
        device_type: "urn:schemas-upnp-org:device:MediaRenderer:1".to_string(),
        friendly_name: format!("Renderer {}", udn),
        manufacturer: "Acme".to_string(),
        model_name: "Streamer".to_string(),
        location: location.to_string(),
        services: vec![ServiceDescriptor {
            service_type: "urn:schemas-upnp-org:service:AVTransport:1".to_string(),
            service_id: "urn:upnp-org:serviceId:AVTransport".to_string(),
            scpd_url: format!("http://{}:80/avt/scpd.xml", DEVICE_IP),
            control_url: format!("http://{}:80/avt/control", DEVICE_IP),
            event_sub_url: format!("http://{}:80/avt/event", DEVICE_IP),
        }],
        embedded: vec![],
    }
}

pub fn property_set(name: &str, value: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\
         <e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\">\
         <e:property><{name}>{value}</{name}></e:property>\
         </e:propertyset>"
    )
}

/// Loader answering from a fixed map, optionally held until released
#[derive(Default)]
pub struct FakeLoader {
    descriptors: Mutex<HashMap<String, DeviceDescriptor>>,
    gate: Mutex<Option<Receiver<()>>>,
    pub loads: Mutex<Vec<String>>,
}

impl FakeLoader {
    pub fn with(udn: &str, location: &str) -> Arc<Self> {
        let loader = Arc::new(Self::default());
        loader.serve(location, descriptor(udn, location));
        loader
    }

    pub fn serve(&self, location: &str, descriptor: DeviceDescriptor) {
        self.descriptors
            .lock()
            .insert(location.to_string(), descriptor);
    }

    /// Block every load until the returned sender sends or is dropped
    pub fn hold(&self) -> Sender<()> {
        let (tx, rx) = channel::unbounded();
        *self.gate.lock() = Some(rx);
        tx
    }

    pub fn load_count(&self) -> usize {
        self.loads.lock().len()
    }
}

impl DescriptionLoader for FakeLoader {
    fn load(&self, location: &str) -> Result<DeviceDescriptor, DiscoveryError> {
        self.loads.lock().push(location.to_string());
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.descriptors
            .lock()
            .get(location)
            .cloned()
            .ok_or_else(|| DiscoveryError::Network(format!("no route to {}", location)))
    }
}

/// Event client with scripted answers; unscripted calls succeed
#[derive(Default)]
pub struct FakeEventClient {
    pub subscribe_results: Mutex<VecDeque<Result<SubscriptionResponse, GenaError>>>,
    pub renew_results: Mutex<VecDeque<Result<Duration, GenaError>>>,
    pub calls: Mutex<Vec<String>>,
    next_sid: Mutex<u32>,
    gate: Mutex<Option<Receiver<()>>>,
}

impl FakeEventClient {
    pub fn script_subscribe(&self, sid: &str, timeout: Duration) {
        self.subscribe_results.lock().push_back(Ok(SubscriptionResponse {
            sid: sid.to_string(),
            timeout,
        }));
    }

    /// Block every SUBSCRIBE until the returned sender sends or is dropped
    pub fn hold_subscribe(&self) -> Sender<()> {
        let (tx, rx) = channel::unbounded();
        *self.gate.lock() = Some(rx);
        tx
    }

    pub fn script_renew(&self, result: Result<Duration, GenaError>) {
        self.renew_results.lock().push_back(result);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

impl EventClient for FakeEventClient {
    fn subscribe(
        &self,
        service: &ServiceRef,
        callback_url: &str,
        timeout: Duration,
    ) -> Result<SubscriptionResponse, GenaError> {
        self.calls.lock().push(format!(
            "subscribe {} {}",
            service.event_sub_url, callback_url
        ));
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.subscribe_results.lock().pop_front().unwrap_or_else(|| {
            let mut next = self.next_sid.lock();
            *next += 1;
            Ok(SubscriptionResponse {
                sid: format!("uuid:sid-{}", *next),
                timeout,
            })
        })
    }

    fn renew(&self, _service: &ServiceRef, sid: &str, timeout: Duration) -> Result<Duration, GenaError> {
        self.calls.lock().push(format!("renew {}", sid));
        self.renew_results.lock().pop_front().unwrap_or(Ok(timeout))
    }

    fn unsubscribe(&self, _service: &ServiceRef, sid: &str) -> Result<(), GenaError> {
        self.calls.lock().push(format!("unsubscribe {}", sid));
        Ok(())
    }
}

/// SSDP transport that sends nowhere; tests inject datagrams through it
#[derive(Default)]
pub struct NullSsdpTransport {
    sink: Mutex<Option<DatagramSink>>,
    pub sent: Mutex<Vec<String>>,
    fail_start: bool,
}

impl NullSsdpTransport {
    /// Transport whose `start` always fails
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Default::default()
        }
    }

    /// Deliver a datagram as if it arrived on the test interface
    pub fn inject(&self, raw: &[u8]) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink(raw, source(), &interface());
                true
            }
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.sink.lock().is_some()
    }
}

impl SsdpTransport for NullSsdpTransport {
    fn start(&self, sink: DatagramSink) -> upnp_control_point::Result<()> {
        if self.fail_start {
            return Err(upnp_control_point::ControlPointError::Transport(
                "no interfaces".to_string(),
            ));
        }
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn send_multicast(&self, data: &[u8]) -> upnp_control_point::Result<()> {
        self.sent
            .lock()
            .push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    fn stop(&self) {
        self.sink.lock().take();
    }
}

/// Event server that keeps the sink so tests can deliver NOTIFY payloads
#[derive(Default)]
pub struct NullEventServer {
    sink: Mutex<Option<callback_server::NotificationSink>>,
}

impl NullEventServer {
    pub fn notify(&self, sid: &str, seq: Option<u32>, body: &str) -> Option<bool> {
        let sink = self.sink.lock().clone()?;
        Some(sink(callback_server::NotificationPayload {
            subscription_id: sid.to_string(),
            seq,
            event_xml: body.to_string(),
        }))
    }

    pub fn is_started(&self) -> bool {
        self.sink.lock().is_some()
    }
}

impl EventServer for NullEventServer {
    fn start(&self, sink: callback_server::NotificationSink) -> upnp_control_point::Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn callback_url(&self, _device_host: &str) -> Option<String> {
        self.sink.lock().as_ref().map(|_| CALLBACK_URL.to_string())
    }

    fn stop(&self) {
        self.sink.lock().take();
    }
}

/// A control point wired to fakes
pub struct Harness {
    pub control_point: ControlPoint,
    pub loader: Arc<FakeLoader>,
    pub client: Arc<FakeEventClient>,
    pub ssdp: Arc<NullSsdpTransport>,
    pub server: Arc<NullEventServer>,
}

impl Harness {
    pub fn new(loader: Arc<FakeLoader>) -> Self {
        Self::with_config(loader, test_config())
    }

    pub fn with_config(loader: Arc<FakeLoader>, config: ControlPointConfig) -> Self {
        init_tracing();
        let client = Arc::new(FakeEventClient::default());
        let ssdp = Arc::new(NullSsdpTransport::default());
        let server = Arc::new(NullEventServer::default());
        let control_point = ControlPoint::builder()
            .config(config)
            .description_loader(loader.clone())
            .event_client(client.clone())
            .ssdp_transport(ssdp.clone())
            .event_server(server.clone())
            .build()
            .unwrap();

        Self {
            control_point,
            loader,
            client,
            ssdp,
            server,
        }
    }

    pub fn started(loader: Arc<FakeLoader>) -> Self {
        let harness = Self::new(loader);
        harness.control_point.start().unwrap();
        harness
    }

    /// Announce `udn` and wait until the control point reports it
    pub fn discover(&self, udn: &str, events: &EventIterator) {
        assert!(self.ssdp.inject(&alive(udn, LOCATION, 1800)));
        match events.recv_timeout(Duration::from_secs(2)) {
            Some(ControlPointEvent::Discovered(device)) => assert_eq!(device.udn, udn),
            other => panic!("expected discovery of {}, got {:?}", udn, other),
        }
    }
}

/// Log to the test writer when `RUST_LOG` is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> ControlPointConfig {
    ControlPointConfig::new()
        .with_parallel_workers(2)
        .with_shutdown_timeout(Duration::from_secs(1))
        .with_renewal(Duration::from_secs(10), Duration::from_millis(50), 1)
}

/// Poll `condition` until it holds or two seconds pass
pub fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
