//! Daemon settings file.
//!
//! A small JSON file supplies what the core deliberately leaves to the
//! outside: listen port, code search paths, cache and fetch timing,
//! discovery and directory peers, and the sandbox mode.

use anyhow::Context;
use roam::proto::Address;
use roam::wasm::{Sandbox, SandboxMode};
use roam::BaseConfig;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_port() -> u16 {
    10102
}

fn default_cache_grace_ms() -> u64 {
    100_000
}

fn default_class_timeout_ms() -> u64 {
    300_000
}

fn default_directory_poll_ms() -> u64 {
    180_000
}

/// Host and port of a peer base or server
#[derive(Debug, Clone, Deserialize)]
pub struct PeerAddr {
    /// Peer host
    pub host: IpAddr,
    /// Peer port
    pub port: u16,
}

impl From<&PeerAddr> for Address {
    fn from(peer: &PeerAddr) -> Self {
        Address::base(peer.host, peer.port)
    }
}

/// Sandbox mode as written in the settings file
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxSetting {
    /// All operations allowed
    Permissive,
    /// File writes, deletions, and process execution denied
    #[default]
    Restrictive,
}

/// The daemon settings file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Static host of this base; omit to use discovery or loopback
    #[serde(default)]
    pub host: Option<IpAddr>,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directories searched for behavior modules
    #[serde(default)]
    pub code_paths: Vec<PathBuf>,
    /// Cache grace delay in milliseconds
    #[serde(default = "default_cache_grace_ms")]
    pub cache_grace_ms: u64,
    /// Remote class fetch deadline in milliseconds
    #[serde(default = "default_class_timeout_ms")]
    pub class_timeout_ms: u64,
    /// Peer asked for this base's own address when `host` is omitted
    #[serde(default)]
    pub discovery_peer: Option<PeerAddr>,
    /// Directory server to register with
    #[serde(default)]
    pub directory: Option<PeerAddr>,
    /// Directory poll interval in milliseconds
    #[serde(default = "default_directory_poll_ms")]
    pub directory_poll_ms: u64,
    /// Sandbox policy for agent code
    #[serde(default)]
    pub sandbox: SandboxSetting,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            code_paths: Vec::new(),
            cache_grace_ms: default_cache_grace_ms(),
            class_timeout_ms: default_class_timeout_ms(),
            discovery_peer: None,
            directory: None,
            directory_poll_ms: default_directory_poll_ms(),
            sandbox: SandboxSetting::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing settings file {}", path.display()))
    }

    /// The base configuration these settings describe
    pub fn base_config(&self) -> BaseConfig {
        BaseConfig {
            host: self.host,
            port: self.port,
            code_paths: self.code_paths.clone(),
            cache_grace: Duration::from_millis(self.cache_grace_ms),
            class_timeout: Duration::from_millis(self.class_timeout_ms),
            discovery_peer: self.discovery_peer.as_ref().map(Address::from),
            directory: self.directory.as_ref().map(Address::from),
            ..Default::default()
        }
    }

    /// The sandbox policy these settings describe
    pub fn sandbox(&self) -> Sandbox {
        match self.sandbox {
            SandboxSetting::Permissive => Sandbox::new(SandboxMode::Permissive),
            SandboxSetting::Restrictive => Sandbox::new(SandboxMode::Restrictive),
        }
    }

    /// Directory poll interval
    pub fn directory_poll(&self) -> Duration {
        Duration::from_millis(self.directory_poll_ms)
    }
}
