//! Socket address model shared by the port table (C1), the options applier
//! (C2), the peer-instance encoder (C3) and the serializer (C7).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use socket2::{Domain, Protocol, Type};

use crate::error::SocketError;

/// The three socket types the spec recognizes (`listen_stream`,
/// `listen_datagram`, `listen_seqpacket`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Datagram,
    SeqPacket,
}

impl SockType {
    pub fn is_connection_oriented(self) -> bool {
        matches!(self, SockType::Stream | SockType::SeqPacket)
    }

    pub fn to_socket2(self) -> Type {
        match self {
            SockType::Stream => Type::STREAM,
            SockType::Datagram => Type::DGRAM,
            SockType::SeqPacket => Type::SEQPACKET,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SockType::Stream => "stream",
            SockType::Datagram => "datagram",
            SockType::SeqPacket => "seqpacket",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "stream" | "SOCK_STREAM" => SockType::Stream,
            "datagram" | "SOCK_DGRAM" => SockType::Datagram,
            "seqpacket" | "SOCK_SEQPACKET" => SockType::SeqPacket,
            _ => return None,
        })
    }
}

/// A UNIX-domain address: either a filesystem path or an abstract-namespace
/// name (conventionally written with a leading `@`, following the same
/// convention used by systemd and by `Osso-sysd`'s socket_ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixAddress {
    Path(PathBuf),
    Abstract(String),
}

impl fmt::Display for UnixAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnixAddress::Path(p) => write!(f, "{}", p.display()),
            UnixAddress::Abstract(name) => write!(f, "@{}", name),
        }
    }
}

/// One configured or accepted endpoint address. Covers every family the
/// socket port kind can bind: `AF_INET`, `AF_INET6`, `AF_UNIX`, `AF_NETLINK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Inet(SocketAddr),
    Unix(UnixAddress),
    Netlink { protocol: i32, groups: u32 },
}

impl Address {
    pub fn domain(&self) -> Domain {
        match self {
            Address::Inet(SocketAddr::V4(_)) => Domain::IPV4,
            Address::Inet(SocketAddr::V6(_)) => Domain::IPV6,
            Address::Unix(_) => Domain::UNIX,
            Address::Netlink { .. } => Domain::from(libc::AF_NETLINK),
        }
    }

    /// True when this address denotes a listenable, connection-oriented
    /// endpoint — required by the `accept` invariant in §3.
    pub fn is_listenable_stream_family(&self) -> bool {
        matches!(self, Address::Inet(_) | Address::Unix(_))
    }

    /// The literal encoding used both by the instance encoder (§4.3, for the
    /// AF_UNIX case indirectly) and by the serializer (§4.7); mirrors
    /// `socket_address_print()` in the original `socket.c`.
    pub fn print(&self) -> String {
        match self {
            Address::Inet(addr) => addr.to_string(),
            Address::Unix(u) => u.to_string(),
            Address::Netlink { protocol, groups } => format!("{} {}", protocol, groups),
        }
    }

    /// Parse a `listen_*` directive value into an address. Accepts
    /// `host:port`, a bare `port` (binds `0.0.0.0`), an absolute path (UNIX
    /// socket), or `@name` (abstract UNIX socket).
    pub fn parse(spec: &str) -> Result<Self, SocketError> {
        if let Some(name) = spec.strip_prefix('@') {
            return Ok(Address::Unix(UnixAddress::Abstract(name.to_string())));
        }
        if spec.starts_with('/') {
            return Ok(Address::Unix(UnixAddress::Path(PathBuf::from(spec))));
        }
        if let Ok(port) = spec.parse::<u16>() {
            return Ok(Address::Inet(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
            )));
        }
        spec.parse::<SocketAddr>()
            .map(Address::Inet)
            .map_err(|_| SocketError::Validation(vec![format!("cannot parse listen address '{spec}'")]))
    }

    pub fn protocol(&self, ty: SockType) -> Option<Protocol> {
        match (self, ty) {
            (Address::Inet(_), SockType::Stream) => Some(Protocol::TCP),
            (Address::Inet(_), SockType::Datagram) => Some(Protocol::UDP),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.print())
    }
}

/// True when `local`/`remote` v6 addresses are IPv4-mapped (`::ffff:a.b.c.d`),
/// per §4.3's AF_INET6 rule.
pub fn is_ipv4_mapped(addr: &Ipv6Addr) -> bool {
    let segments = addr.segments();
    segments[0..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff
}

pub fn ipv4_mapped_octets(addr: &Ipv6Addr) -> [u8; 4] {
    let octets = addr.octets();
    [octets[12], octets[13], octets[14], octets[15]]
}
