//! SSDP message ingestion.
//!
//! Turns a raw datagram received on a multicast or search socket into a
//! [`DiscoveryMessage`], or explains why it was rejected. Parsing is pure:
//! the only side effect is a system resolver lookup when an announcement's
//! location names a host instead of an IP literal.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::interface::NetworkInterface;

/// SSDP multicast group address.
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";
/// SSDP multicast port.
pub const SSDP_PORT: u16 = 1900;
/// Liveness granted to an announcement without a usable `CACHE-CONTROL`.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(1800);
/// Largest liveness period honoured; longer announcements are clamped
pub const MAX_MAX_AGE: Duration = Duration::from_secs(86_400);

/// What kind of SSDP message was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Alive,
    ByeBye,
    Update,
    SearchResponse,
}

impl MessageKind {
    fn from_nts(nts: &str) -> Option<Self> {
        match nts {
            "ssdp:alive" => Some(Self::Alive),
            "ssdp:byebye" => Some(Self::ByeBye),
            "ssdp:update" => Some(Self::Update),
            _ => None,
        }
    }
}

/// One ingested SSDP datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    /// Device identifier of the form `uuid:<id>`, taken from USN
    pub stable_id: String,
    pub kind: MessageKind,
    /// Description URL; absent for byebye
    pub location: Option<String>,
    /// Liveness period; zero for byebye
    pub max_age: Duration,
    pub received_at: Instant,
    pub source: SocketAddr,
    pub interface: NetworkInterface,
    /// NT header of a NOTIFY, ST header of a search response
    pub notification_type: String,
    pub server: Option<String>,
}

impl DiscoveryMessage {
    /// Instant after which the announcing device is considered gone.
    pub fn expires_at(&self) -> Instant {
        self.received_at
            .checked_add(self.max_age)
            .or_else(|| self.received_at.checked_add(MAX_MAX_AGE))
            .unwrap_or(self.received_at)
    }

    pub fn is_byebye(&self) -> bool {
        self.kind == MessageKind::ByeBye
    }
}

/// Reasons a datagram never reaches the device registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,

    #[error("unrecognised start line: {0:?}")]
    UnknownStartLine(String),

    #[error("M-SEARCH requests are not handled by a control point")]
    SearchRequest,

    #[error("NOTIFY with missing or unknown NTS: {0:?}")]
    UnknownNts(Option<String>),

    #[error("missing USN header")]
    MissingUsn,

    #[error("USN does not carry a device uuid: {0}")]
    InvalidUsn(String),

    #[error("missing LOCATION header")]
    MissingLocation,

    #[error("LOCATION is not an absolute http URL: {0}")]
    InvalidLocation(String),

    #[error("LOCATION {location} does not point at sender {sender}")]
    LocationMismatch { location: String, sender: IpAddr },

    #[error("sender {sender} is outside the network of {interface}")]
    OutsideInterface { sender: IpAddr, interface: String },
}

/// Parse and validate a received datagram.
pub fn ingest(
    raw: &[u8],
    source: SocketAddr,
    interface: &NetworkInterface,
) -> Result<DiscoveryMessage, Rejection> {
    let received_at = Instant::now();
    let text = std::str::from_utf8(raw).map_err(|_| Rejection::NotUtf8)?;
    let message = SsdpHeaders::parse(text);

    let kind = classify(&message)?;

    let usn = message.get("USN").ok_or(Rejection::MissingUsn)?;
    let stable_id = parse_udn(usn).ok_or_else(|| Rejection::InvalidUsn(usn.to_string()))?;

    let notification_type = match kind {
        MessageKind::SearchResponse => message.get("ST"),
        _ => message.get("NT"),
    }
    .unwrap_or_default()
    .to_string();

    let (location, max_age) = if kind == MessageKind::ByeBye {
        (None, Duration::ZERO)
    } else {
        let location = message.get("LOCATION").ok_or(Rejection::MissingLocation)?;
        verify_location(location, source.ip())?;
        let max_age = message
            .get("CACHE-CONTROL")
            .and_then(parse_max_age)
            .unwrap_or(DEFAULT_MAX_AGE);
        (Some(location.to_string()), max_age)
    };

    if !interface.contains(source.ip()) {
        return Err(Rejection::OutsideInterface {
            sender: source.ip(),
            interface: interface.name.clone(),
        });
    }

    Ok(DiscoveryMessage {
        stable_id,
        kind,
        location,
        max_age,
        received_at,
        source,
        interface: interface.clone(),
        notification_type,
        server: message.get("SERVER").map(str::to_string),
    })
}

/// Build an M-SEARCH datagram for `search_target`.
pub fn search_request(search_target: &str, mx: u32) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         USER-AGENT: {}\r\n\
         \r\n",
        SSDP_MULTICAST_ADDR,
        SSDP_PORT,
        mx.max(1),
        search_target,
        user_agent(),
    )
}

fn user_agent() -> String {
    format!(
        "{}/0 UPnP/1.1 upnp-control-point/{}",
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    )
}

/// Extract `uuid:<id>` from a USN such as `uuid:<id>::urn:...`.
pub fn parse_udn(usn: &str) -> Option<String> {
    let usn = usn.trim();
    if !usn.get(..5)?.eq_ignore_ascii_case("uuid:") {
        return None;
    }
    let id = usn[5..].split("::").next().unwrap_or_default().trim();
    if id.is_empty() {
        return None;
    }
    Some(format!("uuid:{id}"))
}

/// Parse `max-age=N` out of a CACHE-CONTROL value.
fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        value
            .trim()
            .parse::<u64>()
            .ok()
            .map(|secs| Duration::from_secs(secs).min(MAX_MAX_AGE))
    })
}

fn classify(message: &SsdpHeaders<'_>) -> Result<MessageKind, Rejection> {
    let start = message.start_line;
    let method = start.split_whitespace().next().unwrap_or_default();

    if method.eq_ignore_ascii_case("NOTIFY") {
        let nts = message.get("NTS");
        return nts
            .and_then(MessageKind::from_nts)
            .ok_or_else(|| Rejection::UnknownNts(nts.map(str::to_string)));
    }
    if method.eq_ignore_ascii_case("M-SEARCH") {
        return Err(Rejection::SearchRequest);
    }
    if method.to_ascii_uppercase().starts_with("HTTP/")
        && start.split_whitespace().nth(1) == Some("200")
    {
        return Ok(MessageKind::SearchResponse);
    }
    Err(Rejection::UnknownStartLine(start.to_string()))
}

/// The location must be an absolute http URL whose host resolves to the sender.
fn verify_location(location: &str, source: IpAddr) -> Result<(), Rejection> {
    let invalid = || Rejection::InvalidLocation(location.to_string());
    let url = url::Url::parse(location).map_err(|_| invalid())?;
    if url.scheme() != "http" {
        return Err(invalid());
    }
    let port = url.port_or_known_default().unwrap_or(80);

    let matches = match url.host().ok_or_else(invalid)? {
        url::Host::Ipv4(ip) => same_host(IpAddr::V4(ip), source),
        url::Host::Ipv6(ip) => same_host(IpAddr::V6(ip), source),
        url::Host::Domain(name) => (name, port)
            .to_socket_addrs()
            .map(|mut addrs| addrs.any(|addr| same_host(addr.ip(), source)))
            .unwrap_or(false),
    };

    if matches {
        Ok(())
    } else {
        Err(Rejection::LocationMismatch {
            location: location.to_string(),
            sender: source,
        })
    }
}

fn same_host(a: IpAddr, b: IpAddr) -> bool {
    let canonical = |ip: IpAddr| match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    canonical(a) == canonical(b)
}

/// Start line plus `NAME: value` header lines of an SSDP datagram.
struct SsdpHeaders<'a> {
    start_line: &'a str,
    headers: Vec<(&'a str, &'a str)>,
}

impl<'a> SsdpHeaders<'a> {
    fn parse(text: &'a str) -> Self {
        let mut lines = text.lines().map(str::trim);
        let start_line = lines.next().unwrap_or_default();
        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim(), value.trim()))
            .collect();
        Self { start_line, headers }
    }

    /// Case-insensitive header lookup; the first occurrence wins.
    fn get(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }
}
