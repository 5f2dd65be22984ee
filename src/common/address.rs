//! Address type for transport interfaces

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Address family, used to decide which transport can reach an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    Link,
    Bluetooth,
    FilePath,
}

/// Network address attached to an interface
///
/// A port of 0 in an `Inet` address means "use the transport's default".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    /// IPv4/IPv6 address with transport port
    Inet(SocketAddr),
    /// Link-layer (MAC) address
    Ethernet([u8; 6]),
    /// Bluetooth device address
    Bluetooth([u8; 6]),
    /// Mount point of removable media
    FilePath(PathBuf),
}

impl Address {
    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Inet(SocketAddr::new(ip, port))
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            Address::Inet(addr) if addr.is_ipv4() => AddressFamily::Ipv4,
            Address::Inet(_) => AddressFamily::Ipv6,
            Address::Ethernet(_) => AddressFamily::Link,
            Address::Bluetooth(_) => AddressFamily::Bluetooth,
            Address::FilePath(_) => AddressFamily::FilePath,
        }
    }

    /// Check if this is an IPv4 or IPv6 address
    pub fn is_ip(&self) -> bool {
        matches!(self, Address::Inet(_))
    }

    /// Try to get as socket address
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Inet(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Socket address to connect to, substituting `default_port` for port 0
    pub fn to_socket(&self, default_port: u16) -> Option<SocketAddr> {
        self.as_socket().map(|mut addr| {
            if addr.port() == 0 {
                addr.set_port(default_port);
            }
            addr
        })
    }

    /// Whether two addresses name the same host, ignoring the transport port
    pub fn same_host(&self, other: &Address) -> bool {
        match (self, other) {
            (Address::Inet(a), Address::Inet(b)) => a.ip() == b.ip(),
            _ => self == other,
        }
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(addr) => write!(f, "{}", addr),
            Address::Ethernet(mac) => write!(f, "eth:{}", format_mac(mac)),
            Address::Bluetooth(mac) => write!(f, "bt:{}", format_mac(mac)),
            Address::FilePath(path) => write!(f, "file:{}", path.display()),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Config(format!("Invalid address: {}", s));

        if let Some(mac) = s.strip_prefix("eth:") {
            return parse_mac(mac).map(Address::Ethernet).ok_or_else(invalid);
        }
        if let Some(mac) = s.strip_prefix("bt:") {
            return parse_mac(mac).map(Address::Bluetooth).ok_or_else(invalid);
        }
        if let Some(path) = s.strip_prefix("file:") {
            return Ok(Address::FilePath(PathBuf::from(path)));
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Inet(addr));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Address::ip_port(ip, 0));
        }
        Err(invalid())
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Inet(addr)
    }
}
