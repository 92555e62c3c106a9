//! # Roam Protocol
//!
//! Wire-level definitions for the Roam mobile-agent platform: addresses,
//! envelopes, serialized agent images, and the codec used for the
//! one-envelope-per-connection exchange between bases.

#![warn(missing_docs)]

/// Base and agent addressing
pub mod address;

/// The envelope exchanged between bases
pub mod envelope;

/// Serialized form of a migrating agent
pub mod image;

/// Envelope codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use address::Address;
pub use codec::EnvelopeCodec;
pub use envelope::{kind, Envelope};
pub use error::ProtocolError;
pub use image::AgentImage;
