//! Local network interfaces used for SSDP.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::Result;

/// A local network interface address together with its prefix length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkInterface {
    pub name: String,
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, addr: IpAddr, prefix_len: u8) -> Self {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        Self {
            name: name.into(),
            addr,
            prefix_len: prefix_len.min(max),
        }
    }

    /// Build an interface from an address and its netmask.
    pub fn from_netmask(name: impl Into<String>, addr: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let prefix_len = u32::from(netmask).count_ones() as u8;
        Self::new(name, IpAddr::V4(addr), prefix_len)
    }

    /// Whether `ip` lies inside this interface's network prefix.
    ///
    /// Address families never match each other.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(own), IpAddr::V4(other)) => {
                let mask = prefix_mask_v4(self.prefix_len);
                u32::from(own) & mask == u32::from(other) & mask
            }
            (IpAddr::V6(own), IpAddr::V6(other)) => {
                let mask = prefix_mask_v6(self.prefix_len);
                u128::from(own) & mask == u128::from(other) & mask
            }
            _ => false,
        }
    }

    /// The IPv4 address of this interface, if it has one.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.addr {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.addr, self.prefix_len)
    }
}

fn prefix_mask_v4(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - u32::from(n)),
    }
}

fn prefix_mask_v6(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        n if n >= 128 => u128::MAX,
        n => u128::MAX << (128 - u32::from(n)),
    }
}

/// All non-loopback IPv4 interfaces of this host.
pub fn list() -> Result<Vec<NetworkInterface>> {
    let interfaces = get_if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            get_if_addrs::IfAddr::V4(v4) => {
                Some(NetworkInterface::from_netmask(iface.name, v4.ip, v4.netmask))
            }
            get_if_addrs::IfAddr::V6(_) => None,
        })
        .collect::<Vec<_>>();

    tracing::debug!("Found {} usable network interface(s)", interfaces.len());
    Ok(interfaces)
}

/// Loopback interface, handy when nothing else is configured.
pub fn loopback() -> NetworkInterface {
    NetworkInterface::new("lo", IpAddr::V4(Ipv4Addr::LOCALHOST), 8)
}
