//! Error types for transport operations

use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum NetError {
    /// Listener could not be started
    #[error("Failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    /// Connection to a peer failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol error while reading or writing an envelope
    #[error("Protocol error: {0}")]
    Protocol(#[from] roam_proto::ProtocolError),

    /// The listener is already running
    #[error("Transport is already online")]
    AlreadyOnline,

    /// The recipient address cannot be resolved to a socket address
    #[error("Recipient has no resolvable address")]
    Unaddressable,
}
