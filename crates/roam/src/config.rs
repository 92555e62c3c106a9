//! Base configuration

use roam_proto::Address;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of a base.
///
/// Defaults follow the platform's conventional values: port 10102, a long
/// class-fetch deadline, and a cache grace delay generous enough for an
/// agent to migrate away and come straight back.
#[derive(Debug, Clone)]
pub struct BaseConfig {
    /// Static host of this base; `None` enables dynamic-address discovery
    /// through `discovery_peer`, falling back to loopback when neither is
    /// given
    pub host: Option<IpAddr>,
    /// Port to listen on; `0` lets the OS pick
    pub port: u16,
    /// Ordered directories searched for `<name>.wasm` behavior modules
    pub code_paths: Vec<PathBuf>,
    /// How long an unused module stays cached after its last reference
    pub cache_grace: Duration,
    /// Deadline for fetching a missing module from a peer
    pub class_timeout: Duration,
    /// Peer asked for this base's own address when `host` is unset
    pub discovery_peer: Option<Address>,
    /// Overall deadline for dynamic-address discovery
    pub discovery_timeout: Duration,
    /// Poll interval while waiting for the discovery reply
    pub discovery_poll: Duration,
    /// Directory server notified on online/offline, if any
    pub directory: Option<Address>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 10102,
            code_paths: Vec::new(),
            cache_grace: Duration::from_secs(100),
            class_timeout: Duration::from_secs(300),
            discovery_peer: None,
            discovery_timeout: Duration::from_secs(20),
            discovery_poll: Duration::from_millis(500),
            directory: None,
        }
    }
}
