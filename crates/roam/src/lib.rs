//! # Roam
//!
//! A mobile-agent execution platform. A base hosts relocatable agents,
//! routes envelopes between peers, serializes agents for migration, and
//! fetches missing behavior code on demand from the base an agent came
//! from.
//!
//! The crate is the agent layer of the platform; the wire format lives in
//! [`roam_proto`], the transport in [`roam_net`], and the code layer
//! (behavior modules, cache, loader, sandbox) in [`roam_wasm`].

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use roam_net as net;
pub use roam_proto as proto;
pub use roam_wasm as wasm;

/// The agent trait, its context capability, and the wasm-backed agent
pub mod agent;

/// The base: registry, router, and lifecycle state machine
pub mod base;

/// Base configuration
pub mod config;

/// Directory-server client extension
pub mod directory;

/// Error types for base operations
pub mod error;

pub use agent::{Agent, AgentContext, AgentState, WasmAgent};
pub use base::{Base, BaseNotice, EnvelopeHandler};
pub use config::BaseConfig;
pub use directory::DirectoryClient;
pub use error::BaseError;

/// Result type alias for base operations
pub type Result<T> = std::result::Result<T, BaseError>;
