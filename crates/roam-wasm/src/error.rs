//! Error types for the code layer

use std::time::Duration;
use thiserror::Error;

/// Errors raised by module loading, resolution, and execution
#[derive(Debug, Error)]
pub enum WasmError {
    /// Module loading error
    #[error("Module loading error: {0}")]
    ModuleLoad(String),

    /// Module validation error
    #[error("Module validation error: {0}")]
    ModuleValidation(String),

    /// Invalid module format
    #[error("Invalid module format: {0}")]
    InvalidFormat(String),

    /// The named module could not be resolved anywhere
    #[error("Behavior module not found: {0}")]
    ClassNotFound(String),

    /// A remote fetch did not complete within its deadline
    #[error("Fetch of module {class} timed out after {timeout:?}")]
    FetchTimeout {
        /// Name of the module being fetched
        class: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// A remote fetch failed before the deadline
    #[error("Fetch of module {class} failed: {reason}")]
    FetchFailed {
        /// Name of the module being fetched
        class: String,
        /// What went wrong
        reason: String,
    },

    /// The sandbox policy refused the module a capability it requires
    #[error("Sandbox violation: {0}")]
    Sandbox(String),

    /// Execution error
    #[error("Execution error: {0}")]
    Execution(String),

    /// ABI (de)serialization error
    #[error("ABI error: {0}")]
    Abi(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wasmtime error
    #[error("Wasmtime error: {0}")]
    Wasmtime(#[from] wasmtime::Error),
}
