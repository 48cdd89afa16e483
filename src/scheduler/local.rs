//! Self-address resolution.
//!
//! The local node must not probe itself. Its address is resolved at the start
//! of every cycle since interfaces can change during a long run.

use crate::probe::Target;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Address used to pick a route when no target is an IP literal.
const FALLBACK_ROUTE_PROBE: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

pub trait SelfAddress: Send + Sync {
    /// The local node's identifying address, if it can be determined.
    fn resolve(&self) -> Option<String>;
}

/// A fixed, operator supplied address.
#[derive(Debug, Clone)]
pub struct StaticAddress(pub String);

impl SelfAddress for StaticAddress {
    fn resolve(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Asks the kernel which source address it would use toward a peer.
///
/// Connecting a UDP socket sends nothing; it only binds a route.
#[derive(Debug, Clone)]
pub struct RouteAddress {
    probe: IpAddr,
}

impl RouteAddress {
    pub fn new(targets: &[Target]) -> Self {
        let probe = targets
            .iter()
            .find_map(|t| t.address.parse::<IpAddr>().ok())
            .unwrap_or(FALLBACK_ROUTE_PROBE);
        Self { probe }
    }

    fn source_for(dest: IpAddr) -> std::io::Result<IpAddr> {
        let domain = match dest {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.connect(&SockAddr::from(SocketAddr::new(dest, 9)))?;
        socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.ip())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "not an inet socket"))
    }
}

impl SelfAddress for RouteAddress {
    fn resolve(&self) -> Option<String> {
        match Self::source_for(self.probe) {
            Ok(ip) if !ip.is_unspecified() => Some(ip.to_string()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Could not determine local address via {}: {}", self.probe, e);
                None
            }
        }
    }
}

/// Whether `target` refers to the local node.
pub fn is_self(target: &Target, local: Option<&str>) -> bool {
    let Some(local) = local else {
        return false;
    };
    if target.address == local {
        return true;
    }
    match (target.address.parse::<IpAddr>(), local.parse::<IpAddr>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
