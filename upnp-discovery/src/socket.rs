//! SSDP socket construction.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Result;
use crate::ssdp::{SSDP_MULTICAST_ADDR, SSDP_PORT};

/// SSDP multicast group as an address.
pub fn multicast_group() -> Ipv4Addr {
    SSDP_MULTICAST_ADDR
        .parse()
        .unwrap_or(Ipv4Addr::new(239, 255, 255, 250))
}

/// Destination for M-SEARCH requests.
pub fn multicast_target() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(multicast_group(), SSDP_PORT))
}

/// Socket receiving NOTIFY announcements on `interface`.
///
/// Binds the shared SSDP port with address reuse so several listeners can
/// coexist on one host, and joins the multicast group on that interface.
pub fn notify_socket(interface: Ipv4Addr, read_timeout: Duration) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT);
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&multicast_group(), &interface)?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(read_timeout))?;
    tracing::debug!("SSDP: joined {} on {}", SSDP_MULTICAST_ADDR, interface);
    Ok(socket)
}

/// Socket sending M-SEARCH requests from `interface` and receiving the
/// unicast responses.
pub fn search_socket(interface: Ipv4Addr, read_timeout: Duration) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let bind_addr = SocketAddrV4::new(interface, 0);
    socket.bind(&bind_addr.into())?;
    socket.set_multicast_if_v4(&interface)?;
    socket.set_multicast_ttl_v4(2)?;
    socket.set_multicast_loop_v4(true)?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_target() {
        assert_eq!(multicast_target().to_string(), "239.255.255.250:1900");
    }

    #[test]
    fn test_search_socket_binds_ephemeral_port() {
        let socket = search_socket(Ipv4Addr::LOCALHOST, Duration::from_millis(10)).unwrap();
        let local = socket.local_addr().unwrap();
        assert_eq!(local.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
    }
}
