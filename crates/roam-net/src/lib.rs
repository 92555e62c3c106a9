//! # Roam Net
//!
//! Asynchronous envelope transport between bases. One envelope travels per
//! TCP connection; every transfer, inbound or outbound, runs on its own
//! short-lived worker so a stuck peer can never block the listener or the
//! sender's caller.

#![warn(missing_docs)]

/// The delivery service: listener, outbound posting, error reporting
pub mod delivery;

/// Error types for transport operations
pub mod error;

/// Observability tracking of in-flight transfer workers
pub mod tracker;

pub use delivery::{Delivery, DeliveryErrorCode, DeliveryHandler};
pub use error::NetError;
pub use tracker::{WorkerGuard, WorkerTracker};
