//! # Roam Wasm
//!
//! The code layer of the Roam platform: validated WebAssembly behavior
//! modules, the wasmtime execution runtime with its JSON event ABI, the
//! reference-counted code cache, and the remote loader that fetches missing
//! module code from a peer base under a bounded wait.

#![warn(missing_docs)]

/// The JSON event ABI spoken between the runtime and behavior modules
pub mod abi;

/// Reference-counted store of loaded behavior modules
pub mod cache;

/// Error types for the code layer
pub mod error;

/// Module resolution: cache, local directories, remote fetch
pub mod loader;

/// Behavior module loading and validation
pub mod module;

/// Behavior module execution
pub mod runtime;

/// Process-wide security policy for agent code
pub mod sandbox;

/// Test utilities for behavior modules
pub mod test_utils;

pub use abi::{AgentEvent, AgentReply, Directive, EventKind, Mail};
pub use cache::CodeCache;
pub use error::WasmError;
pub use loader::{RemoteLoader, ReplyRegistry};
pub use module::{BehaviorModule, ModuleCapability, ModuleImport, ModuleMetadata};
pub use runtime::{AgentRuntime, RuntimeConfig};
pub use sandbox::{Sandbox, SandboxMode};
