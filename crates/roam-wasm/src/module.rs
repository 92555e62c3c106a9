//! Behavior module loading and validation

use crate::error::WasmError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use wasmtime::{Engine, Module};

/// Maximum behavior module size (16MB)
pub const MAX_MODULE_SIZE: usize = 16 * 1024 * 1024;

/// Capabilities a behavior module may require from its host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleCapability {
    /// WASI filesystem access
    WasiFs,
    /// WASI environment variables
    WasiEnv,
    /// WASI command line arguments
    WasiArgs,
    /// WASI standard I/O
    WasiStdio,
    /// WASI networking (if supported)
    WasiNet,
    /// Custom host functions
    HostFunctions,
}

/// Metadata extracted from a behavior module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// SHA256 hash of the module bytes
    pub hash: String,
    /// Size of the module in bytes
    pub size: usize,
    /// Detected capabilities required by the module
    pub capabilities: HashSet<ModuleCapability>,
    /// Exported functions
    pub exports: Vec<String>,
    /// Imported functions required by the module
    pub imports: Vec<ModuleImport>,
    /// Whether the module is a WASI command
    pub is_wasi: bool,
}

/// Information about a module import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleImport {
    /// Module name (e.g., "wasi_snapshot_preview1")
    pub module: String,
    /// Function name
    pub name: String,
}

/// A validated behavior module: the mobile unit of code.
///
/// Keeps the raw bytes (the form that travels in CLASS envelopes) next to
/// the lazily compiled wasmtime module.
#[derive(Debug, Clone)]
pub struct BehaviorModule {
    /// Module bytecode
    pub bytes: Vec<u8>,
    /// Module metadata
    pub metadata: ModuleMetadata,
    /// Compiled wasmtime module (cached)
    compiled: Option<Module>,
}

impl BehaviorModule {
    /// Load a behavior module from bytes with validation
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, WasmError> {
        Self::validate_basic_format(&bytes)?;

        let metadata = Self::extract_metadata(&bytes)?;
        Self::validate_module(&metadata)?;

        Ok(BehaviorModule {
            bytes,
            metadata,
            compiled: None,
        })
    }

    /// Load a behavior module from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, WasmError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(bytes)
    }

    /// Get the compiled wasmtime module, compiling if necessary
    pub fn get_compiled(&mut self, engine: &Engine) -> Result<&Module, WasmError> {
        if self.compiled.is_none() {
            let module = Module::from_binary(engine, &self.bytes)?;
            self.compiled = Some(module);
        }
        Ok(self.compiled.as_ref().expect("just compiled"))
    }

    /// The module hash
    pub fn hash(&self) -> &str {
        &self.metadata.hash
    }

    /// Whether the module requires a specific capability
    pub fn requires_capability(&self, capability: &ModuleCapability) -> bool {
        self.metadata.capabilities.contains(capability)
    }

    /// Whether the module is a WASI command
    pub fn is_wasi(&self) -> bool {
        self.metadata.is_wasi
    }

    /// Extract metadata from module bytes
    fn extract_metadata(bytes: &[u8]) -> Result<ModuleMetadata, WasmError> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = format!("{:x}", hasher.finalize());

        // a throwaway engine is enough for parsing
        let engine = Engine::default();
        let module =
            Module::from_binary(&engine, bytes).map_err(|e| WasmError::ModuleLoad(e.to_string()))?;

        let mut capabilities = HashSet::new();
        let mut exports = Vec::new();
        let mut imports = Vec::new();
        let mut is_wasi = false;

        for export in module.exports() {
            exports.push(export.name().to_string());
        }

        for import in module.imports() {
            let import_info = ModuleImport {
                module: import.module().to_string(),
                name: import.name().to_string(),
            };

            if import.module().starts_with("wasi_") {
                is_wasi = true;

                match import.name() {
                    name if name.starts_with("path_") => {
                        capabilities.insert(ModuleCapability::WasiFs);
                    }
                    name if name.starts_with("fd_") => {
                        capabilities.insert(ModuleCapability::WasiStdio);
                    }
                    name if name.starts_with("environ_") => {
                        capabilities.insert(ModuleCapability::WasiEnv);
                    }
                    name if name.starts_with("args_") => {
                        capabilities.insert(ModuleCapability::WasiArgs);
                    }
                    name if name.starts_with("sock_") => {
                        capabilities.insert(ModuleCapability::WasiNet);
                    }
                    _ => {}
                }
            } else if import.module() != "env" {
                capabilities.insert(ModuleCapability::HostFunctions);
            }

            imports.push(import_info);
        }

        if is_wasi {
            capabilities.insert(ModuleCapability::WasiStdio);
        }

        Ok(ModuleMetadata {
            hash,
            size: bytes.len(),
            capabilities,
            exports,
            imports,
            is_wasi,
        })
    }

    /// Validate the basic binary format before parsing
    fn validate_basic_format(bytes: &[u8]) -> Result<(), WasmError> {
        if bytes.len() < 8 {
            return Err(WasmError::InvalidFormat(
                "module too small (minimum 8 bytes)".to_string(),
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(WasmError::InvalidFormat(
                "invalid wasm magic number".to_string(),
            ));
        }

        if bytes.len() > MAX_MODULE_SIZE {
            return Err(WasmError::ModuleValidation(format!(
                "module too large: {} bytes (max: {} bytes)",
                bytes.len(),
                MAX_MODULE_SIZE
            )));
        }

        Ok(())
    }

    /// Validate the parsed module
    fn validate_module(metadata: &ModuleMetadata) -> Result<(), WasmError> {
        if metadata.capabilities.contains(&ModuleCapability::WasiNet) {
            return Err(WasmError::ModuleValidation(
                "WASI networking is not supported".to_string(),
            ));
        }

        if !metadata.exports.contains(&"_start".to_string()) {
            return Err(WasmError::ModuleValidation(
                "behavior module must export a '_start' entry point".to_string(),
            ));
        }

        Ok(())
    }
}
