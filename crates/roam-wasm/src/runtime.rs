//! Behavior module execution

use crate::abi::{AgentEvent, AgentReply};
use crate::error::WasmError;
use crate::module::BehaviorModule;
use crate::sandbox::Sandbox;
use std::time::Duration;
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasi_common::I32Exit;
use wasmtime::{Engine, Linker, Store};
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder};

/// Store data for one module invocation
struct HostState {
    wasi: Option<WasiCtx>,
}

/// Configuration for behavior module execution
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Instruction budget per invocation; `None` disables fuel metering
    pub max_fuel: Option<u64>,
    /// Wall-clock deadline per invocation
    pub max_execution_time: Duration,
    /// Maximum wasm stack size in bytes
    pub max_wasm_stack: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_fuel: Some(5_000_000),
            max_execution_time: Duration::from_secs(30),
            max_wasm_stack: 1024 * 1024,
        }
    }
}

/// Executes behavior modules under the installed sandbox policy.
///
/// One runtime (and one wasmtime engine) is shared by all agents on a base;
/// each invocation gets a fresh store, so no state leaks between agents
/// through the runtime.
pub struct AgentRuntime {
    engine: Engine,
    config: RuntimeConfig,
    sandbox: Sandbox,
}

impl AgentRuntime {
    /// Create a runtime with default configuration
    pub fn new(sandbox: Sandbox) -> Result<Self, WasmError> {
        Self::with_config(RuntimeConfig::default(), sandbox)
    }

    /// Create a runtime with custom configuration
    pub fn with_config(config: RuntimeConfig, sandbox: Sandbox) -> Result<Self, WasmError> {
        let mut wasmtime_config = wasmtime::Config::new();
        wasmtime_config.max_wasm_stack(config.max_wasm_stack);
        if config.max_fuel.is_some() {
            wasmtime_config.consume_fuel(true);
        }
        wasmtime_config.async_support(true);

        let engine = Engine::new(&wasmtime_config)?;

        Ok(Self {
            engine,
            config,
            sandbox,
        })
    }

    /// The engine behavior modules must be compiled against
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The sandbox policy this runtime enforces
    pub fn sandbox(&self) -> Sandbox {
        self.sandbox
    }

    /// Deliver one event to a behavior module and collect its reply.
    ///
    /// The event is written to the module's stdin as JSON; the reply is
    /// read back from its stdout. An empty stdout is a valid reply that
    /// changes nothing.
    pub async fn deliver(
        &self,
        module: &mut BehaviorModule,
        event: &AgentEvent,
    ) -> Result<AgentReply, WasmError> {
        self.sandbox.check_module(&module.metadata)?;

        let input = serde_json::to_vec(event)?;
        let compiled = module.get_compiled(&self.engine)?.clone();

        let stdout_pipe = WritePipe::new_in_memory();

        let mut wasi_builder = WasiCtxBuilder::new();
        let _ = wasi_builder.env("ROAM_AGENT", &event.name);
        wasi_builder.stdin(Box::new(ReadPipe::from(input)));
        wasi_builder.stdout(Box::new(stdout_pipe.clone()));
        let wasi_ctx = wasi_builder.build();

        let mut store = Store::new(&self.engine, HostState { wasi: Some(wasi_ctx) });

        if let Some(fuel) = self.config.max_fuel {
            store.set_fuel(fuel)?;
            // yield periodically so the deadline below can fire even
            // against a busy loop
            store.fuel_async_yield_interval(Some(10_000))?;
        }

        let mut linker = Linker::new(&self.engine);
        wasmtime_wasi::add_to_linker(&mut linker, |state: &mut HostState| {
            state.wasi.as_mut().expect("wasi context set for invocation")
        })?;

        let instance = linker.instantiate_async(&mut store, &compiled).await?;
        let start = instance.get_typed_func::<(), ()>(&mut store, "_start")?;

        let outcome = tokio::time::timeout(
            self.config.max_execution_time,
            start.call_async(&mut store, ()),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(trap)) => {
                // a WASI exit(0) surfaces as a trap but is a clean return
                match trap.downcast_ref::<I32Exit>() {
                    Some(exit) if exit.0 == 0 => {}
                    Some(exit) => {
                        return Err(WasmError::Execution(format!(
                            "module exited with status {}",
                            exit.0
                        )))
                    }
                    None => {
                        return Err(WasmError::Execution(format!(
                            "module trapped: {}",
                            trap
                        )))
                    }
                }
            }
            Err(_) => {
                return Err(WasmError::Execution(format!(
                    "module exceeded its deadline of {:?}",
                    self.config.max_execution_time
                )))
            }
        }

        // release the store's handle on the pipe before draining it
        drop(store);

        let written = stdout_pipe
            .try_into_inner()
            .map_err(|_| WasmError::Execution("module stdout still shared".to_string()))?
            .into_inner();

        if written.is_empty() {
            return Ok(AgentReply::default());
        }
        Ok(serde_json::from_slice(&written)?)
    }
}
