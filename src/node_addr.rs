use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// A peer's identity on the network: its socket address plus a `nonce` that disambiguates
///  successive incarnations of a process on the same address.
///
/// The nonce is *not* a security feature - it only lets peers tell a restarted process from
///  the one they were talking to before, so stale sessions are torn down instead of resumed.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct NodeAddr {
    pub socket_addr: SocketAddr,
    pub nonce: u32,
}

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}/{}]", self.socket_addr, self.nonce)
    }
}

impl Hash for NodeAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.socket_addr {
            SocketAddr::V4(s) => s.ip().to_bits().hash(state),
            SocketAddr::V6(s) => s.ip().to_bits().hash(state),
        }
        self.socket_addr.port().hash(state);
        self.nonce.hash(state);
    }
}

/// Total order on (address bytes, port, nonce). This order decides which side of a
///  simultaneous-connect race survives, so it must be identical on all nodes.
impl Ord for NodeAddr {
    fn cmp(&self, other: &NodeAddr) -> Ordering {
        self.addr_bytes()
            .cmp(&other.addr_bytes())
            .then(self.socket_addr.port().cmp(&other.socket_addr.port()))
            .then(self.nonce.cmp(&other.nonce))
    }
}
impl PartialOrd for NodeAddr {
    fn partial_cmp(&self, other: &NodeAddr) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl NodeAddr {
    /// Serialized length of the fixed-size wire record:
    ///  `family (u16) | port (u16) | addr (16 bytes) | nonce (u32)`.
    pub const SERIALIZED_LEN: usize = 2 + 2 + 16 + 4;

    pub fn new(socket_addr: SocketAddr, nonce: u32) -> NodeAddr {
        NodeAddr { socket_addr, nonce }
    }

    #[cfg(test)]
    pub fn localhost(port: u16, nonce: u32) -> NodeAddr {
        NodeAddr {
            socket_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            nonce,
        }
    }

    /// The address in a form that compares the same regardless of family: IPv4 addresses are
    ///  mapped into the IPv6 space.
    fn addr_bytes(&self) -> [u8; 16] {
        match self.socket_addr.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
            IpAddr::V6(ip) => ip.octets(),
        }
    }

    /// A peer that does not know its own externally visible IP sends an unspecified address;
    ///  the accepting side patches in the address it observes on the socket.
    pub fn is_blank_ip(&self) -> bool {
        self.socket_addr.ip().is_unspecified()
    }

    /// Replace the IP with `observed`, keeping port and nonce.
    pub fn with_observed_ip(&self, observed: IpAddr) -> NodeAddr {
        NodeAddr {
            socket_addr: SocketAddr::new(observed, self.socket_addr.port()),
            nonce: self.nonce,
        }
    }

    pub fn port(&self) -> u16 {
        self.socket_addr.port()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self.socket_addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u16_le(4);
                buf.put_u16_le(self.socket_addr.port());
                buf.put_slice(&ip.octets());
                buf.put_slice(&[0u8; 12]);
            }
            IpAddr::V6(ip) => {
                buf.put_u16_le(6);
                buf.put_u16_le(self.socket_addr.port());
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u32_le(self.nonce);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeAddr> {
        let family = buf.try_get_u16_le()?;
        let port = buf.try_get_u16_le()?;
        let mut addr = [0u8; 16];
        if buf.remaining() < addr.len() {
            return Err(anyhow!("address record truncated"));
        }
        buf.copy_to_slice(&mut addr);
        let nonce = buf.try_get_u32_le()?;

        let ip = match family {
            4 => IpAddr::V4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])),
            6 => IpAddr::V6(Ipv6Addr::from(addr)),
            n => {
                return Err(anyhow!("invalid address family: {}", n));
            }
        };
        Ok(NodeAddr {
            socket_addr: SocketAddr::new(ip, port),
            nonce,
        })
    }
}
