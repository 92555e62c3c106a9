//! Error types for base operations

use std::time::Duration;
use thiserror::Error;

/// Main error type for base operations
#[derive(Debug, Error)]
pub enum BaseError {
    /// Transport-related errors
    #[error("Transport error: {0}")]
    Net(#[from] roam_net::NetError),

    /// Wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] roam_proto::ProtocolError),

    /// Code-layer errors (module loading, resolution, execution)
    #[error("Code error: {0}")]
    Code(#[from] roam_wasm::WasmError),

    /// The base is offline and the operation requires it online
    #[error("Base is offline")]
    Offline,

    /// The base is already online
    #[error("Base is already online")]
    AlreadyOnline,

    /// Dynamic-address discovery did not complete in time
    #[error("Address discovery timed out after {timeout:?}")]
    DiscoveryTimeout {
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// No resident agent has the given name
    #[error("No resident agent named {0}")]
    AgentNotFound(String),

    /// The named agent exists but is already leaving the base
    #[error("Agent {0} is already detaching")]
    AgentDetaching(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
