//! Serialized form of a migrating agent

use crate::{Address, ProtocolError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The serialized agent graph carried in an AGENT envelope.
///
/// Only durable state travels: the agent's world-unique name, the name of
/// the behavior module it runs, its pending destination, and its opaque
/// state blob. Transient links to the hosting base are excluded and
/// re-established by the destination after deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentImage {
    /// World-unique agent name, the routing key
    pub name: String,
    /// Name of the behavior module the agent runs
    pub class: String,
    /// Destination set by the agent before it requested migration
    pub destination: Option<Address>,
    /// Opaque serialized agent state
    pub state: Bytes,
}

impl AgentImage {
    /// Create a fresh image with empty state
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            destination: None,
            state: Bytes::new(),
        }
    }

    /// Serialize the image to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize an image from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_image_roundtrip() {
        let mut image = AgentImage::new("scout-1", "demo.counter");
        image.destination = Some(Address::base(IpAddr::V4(Ipv4Addr::LOCALHOST), 9001));
        image.state = Bytes::from_static(b"{\"count\":3}");

        let bytes = image.to_msgpack().unwrap();
        let decoded = AgentImage::from_msgpack(&bytes).unwrap();

        assert_eq!(image, decoded);
        assert_eq!(decoded.name, "scout-1");
        assert_eq!(decoded.class, "demo.counter");
    }

    #[test]
    fn test_fresh_image_has_no_destination() {
        let image = AgentImage::new("scout-1", "demo.counter");
        assert!(image.destination.is_none());
        assert!(image.state.is_empty());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(AgentImage::from_msgpack(&[0xC1, 0x00]).is_err());
    }
}
