//! Process-wide security policy for agent code.
//!
//! A single policy is installed once at startup and consulted whenever
//! agent code would touch a security-sensitive capability. The policy is
//! coarse and static for the process lifetime; it is not an ACL system.

use crate::error::WasmError;
use crate::module::{ModuleCapability, ModuleMetadata};
use std::sync::OnceLock;

static INSTALLED: OnceLock<Sandbox> = OnceLock::new();

/// How much agent code is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxMode {
    /// Everything is allowed
    Permissive,
    /// File deletion, file writing, and process execution are denied;
    /// everything else is allowed
    #[default]
    Restrictive,
}

/// The process-wide policy object
#[derive(Debug, Clone, Copy, Default)]
pub struct Sandbox {
    mode: SandboxMode,
}

impl Sandbox {
    /// Create a policy with the given mode
    pub fn new(mode: SandboxMode) -> Self {
        Self { mode }
    }

    /// Install `self` as the process-wide policy.
    ///
    /// The first installation wins; later calls return the already
    /// installed policy. Call once at startup, before any base goes online.
    pub fn install(self) -> Sandbox {
        *INSTALLED.get_or_init(|| self)
    }

    /// The installed process-wide policy, restrictive if none was installed
    pub fn current() -> Sandbox {
        INSTALLED.get().copied().unwrap_or_default()
    }

    /// The policy mode
    pub fn mode(&self) -> SandboxMode {
        self.mode
    }

    /// May agent code write files?
    pub fn allows_file_write(&self) -> bool {
        self.mode == SandboxMode::Permissive
    }

    /// May agent code delete files?
    pub fn allows_file_delete(&self) -> bool {
        self.mode == SandboxMode::Permissive
    }

    /// May agent code execute processes or call custom host functions?
    pub fn allows_exec(&self) -> bool {
        self.mode == SandboxMode::Permissive
    }

    /// Check a behavior module's required capabilities against the policy.
    ///
    /// The violation propagates only to the task running the offending
    /// agent, never to the host process.
    pub fn check_module(&self, metadata: &ModuleMetadata) -> Result<(), WasmError> {
        if self.mode == SandboxMode::Permissive {
            return Ok(());
        }

        if metadata.capabilities.contains(&ModuleCapability::WasiFs) {
            return Err(WasmError::Sandbox(
                "module requires filesystem access".to_string(),
            ));
        }
        if metadata.capabilities.contains(&ModuleCapability::HostFunctions) {
            return Err(WasmError::Sandbox(
                "module requires custom host functions".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::BehaviorModule;
    use crate::test_utils::test_modules::{destroy_directive_wasm, fs_agent_wasm};

    #[test]
    fn test_permissive_allows_everything() {
        let sandbox = Sandbox::new(SandboxMode::Permissive);
        assert!(sandbox.allows_file_write());
        assert!(sandbox.allows_file_delete());
        assert!(sandbox.allows_exec());
    }

    #[test]
    fn test_restrictive_denies_mutating_operations() {
        let sandbox = Sandbox::new(SandboxMode::Restrictive);
        assert!(!sandbox.allows_file_write());
        assert!(!sandbox.allows_file_delete());
        assert!(!sandbox.allows_exec());
    }

    #[test]
    fn test_restrictive_allows_stdio_module() {
        let sandbox = Sandbox::new(SandboxMode::Restrictive);
        let module = BehaviorModule::from_bytes(destroy_directive_wasm().to_vec()).unwrap();
        assert!(sandbox.check_module(&module.metadata).is_ok());
    }

    #[test]
    fn test_restrictive_denies_filesystem_module() {
        let sandbox = Sandbox::new(SandboxMode::Restrictive);
        let module = BehaviorModule::from_bytes(fs_agent_wasm().to_vec()).unwrap();
        let result = sandbox.check_module(&module.metadata);
        assert!(matches!(result, Err(WasmError::Sandbox(_))));
    }

    #[test]
    fn test_permissive_allows_filesystem_module() {
        let sandbox = Sandbox::new(SandboxMode::Permissive);
        let module = BehaviorModule::from_bytes(fs_agent_wasm().to_vec()).unwrap();
        assert!(sandbox.check_module(&module.metadata).is_ok());
    }
}
