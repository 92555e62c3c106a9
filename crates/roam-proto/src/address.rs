//! Base and agent addressing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Identity of a base, or of an agent resident on a base.
///
/// An empty `name` addresses the base itself. A base whose network identity
/// is assigned dynamically leaves `host` unset until discovery completes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Host the base lives on, `None` while the address is still unresolved
    pub host: Option<IpAddr>,
    /// Port the base listens on
    pub port: u16,
    /// Agent name, `None` when the base itself is meant
    pub name: Option<String>,
}

impl Address {
    /// Address of a base
    pub fn base(host: IpAddr, port: u16) -> Self {
        Self {
            host: Some(host),
            port,
            name: None,
        }
    }

    /// Address of a named agent on a base
    pub fn agent(host: IpAddr, port: u16, name: impl Into<String>) -> Self {
        Self {
            host: Some(host),
            port,
            name: Some(name.into()),
        }
    }

    /// Address of a base that does not yet know its own host
    pub fn unresolved(port: u16) -> Self {
        Self {
            host: None,
            port,
            name: None,
        }
    }

    /// Address valid only on the local base, without network identity
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            host: None,
            port: 0,
            name: Some(name.into()),
        }
    }

    /// Whether this address refers to a base rather than a specific agent
    pub fn is_base(&self) -> bool {
        self.name.is_none()
    }

    /// Socket address of the base, if the host is known
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host.map(|host| SocketAddr::new(host, self.port))
    }

    /// Whether two addresses refer to the same base (host and port)
    pub fn same_base(&self, other: &Address) -> bool {
        self.host == other.host && self.port == other.port
    }

    /// The same base address, but naming a specific agent
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            host: self.host,
            port: self.port,
            name: Some(name.into()),
        }
    }

    /// The base address underneath this address, with any agent name removed
    pub fn base_only(&self) -> Self {
        Self {
            host: self.host,
            port: self.port,
            name: None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, &self.name) {
            (Some(host), Some(name)) => write!(f, "{}:{}/{}", host, self.port, name),
            (Some(host), None) => write!(f, "{}:{}", host, self.port),
            (None, Some(name)) => write!(f, "local/{}", name),
            (None, None) => write!(f, "unresolved:{}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_base_address() {
        let addr = Address::base(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        assert!(addr.is_base());
        assert_eq!(addr.socket_addr().unwrap().port(), 9000);
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_agent_address() {
        let addr = Address::agent(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000, "scout-1");
        assert!(!addr.is_base());
        assert_eq!(addr.to_string(), "127.0.0.1:9000/scout-1");
        assert!(addr.same_base(&addr.base_only()));
    }

    #[test]
    fn test_unresolved_has_no_socket_addr() {
        let addr = Address::unresolved(9000);
        assert!(addr.socket_addr().is_none());
        assert!(addr.is_base());
    }

    #[test]
    fn test_local_address() {
        let addr = Address::local("scout-1");
        assert!(addr.host.is_none());
        assert_eq!(addr.name.as_deref(), Some("scout-1"));
    }

    #[test]
    fn test_same_base_ignores_name() {
        let a = Address::agent(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000, "a");
        let b = Address::agent(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000, "b");
        let c = Address::agent(IpAddr::V4(Ipv4Addr::LOCALHOST), 9001, "a");
        assert!(a.same_base(&b));
        assert!(!a.same_base(&c));
    }

    #[test]
    fn test_named_replaces_name() {
        let base = Address::base(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let named = base.named("courier-7");
        assert_eq!(named.name.as_deref(), Some("courier-7"));
        assert!(named.same_base(&base));
    }

    #[test]
    fn test_serde_roundtrip() {
        let addr = Address::agent(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 10102, "scout-1");
        let bytes = rmp_serde::to_vec(&addr).unwrap();
        let decoded: Address = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(addr, decoded);
    }
}
