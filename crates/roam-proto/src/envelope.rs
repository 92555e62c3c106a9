//! The envelope exchanged between bases

use crate::{Address, ProtocolError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known envelope kinds.
///
/// The kind is an open string tag, not a closed enum: plug-ins introduce new
/// kinds at runtime and register handlers for them on the base. These
/// constants cover the kinds the platform itself speaks.
pub mod kind {
    /// Payload carries a serialized agent; content is its name
    pub const AGENT: &str = "AGENT";
    /// Request a resident agent back from another base; content is its name
    pub const GET: &str = "GET";
    /// Request the code of a behavior module; content is the module name
    pub const GET_CLASS: &str = "GET_CLASS";
    /// Payload carries module code; content is the module name
    pub const CLASS: &str = "CLASS";
    /// A request failed; content describes the reason
    pub const ERROR: &str = "ERROR";
    /// Ask a peer what address this base appears under
    pub const GET_ADDRESS: &str = "GET_ADDRESS";
    /// Reply to [`GET_ADDRESS`]; recipient is the observed address
    pub const YOUR_ADDRESS: &str = "YOUR_ADDRESS";
    /// Announce this base to a directory server
    pub const BASE_ONLINE: &str = "BASE_ONLINE";
    /// Withdraw this base from a directory server
    pub const BASE_OFFLINE: &str = "BASE_OFFLINE";
    /// Request the directory server's table of online bases
    pub const GET_BASES: &str = "GET_BASES";
    /// Reply to [`GET_BASES`]; payload is a serialized address table
    pub const BASES: &str = "BASES";
    /// Free-form agent-to-agent mail
    pub const MESSAGE: &str = "MESSAGE";
}

/// The wire unit exchanged between bases.
///
/// One envelope travels per connection. The `id` correlates a request with
/// its delivery-error callback; `0` means the sender does not care.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id, `0` if unused
    pub id: u64,
    /// Who sent the envelope
    pub sender: Address,
    /// Who should receive it
    pub recipient: Address,
    /// Open string tag selecting the handler on the receiving base
    pub kind: String,
    /// Textual content; meaning depends on `kind`
    pub content: String,
    /// Binary content; meaning depends on `kind`
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope with an unused correlation id
    pub fn new(
        sender: Address,
        recipient: Address,
        kind: impl Into<String>,
        content: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            id: 0,
            sender,
            recipient,
            kind: kind.into(),
            content: content.into(),
            payload,
        }
    }

    /// Attach a correlation id
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Envelope carrying a serialized agent named `name`
    pub fn agent(sender: Address, recipient: Address, name: impl Into<String>, image: Bytes) -> Self {
        Self::new(sender, recipient, kind::AGENT, name, image)
    }

    /// Request for the code of behavior module `class`
    pub fn get_class(sender: Address, recipient: Address, class: impl Into<String>) -> Self {
        Self::new(sender, recipient, kind::GET_CLASS, class, Bytes::new())
    }

    /// Reply carrying the code of behavior module `class`
    pub fn class(sender: Address, recipient: Address, class: impl Into<String>, code: Bytes) -> Self {
        Self::new(sender, recipient, kind::CLASS, class, code)
    }

    /// Error reply with a human-readable reason
    pub fn error(sender: Address, recipient: Address, reason: impl Into<String>) -> Self {
        Self::new(sender, recipient, kind::ERROR, reason, Bytes::new())
    }

    /// Whether this envelope has the given kind
    pub fn is_kind(&self, k: &str) -> bool {
        self.kind == k
    }

    /// Serialize the envelope to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize an envelope from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({} bytes)",
            self.kind,
            self.sender,
            self.recipient,
            self.payload.len()
        )
    }
}
