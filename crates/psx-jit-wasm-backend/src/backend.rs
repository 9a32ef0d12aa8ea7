//! [`Backend`] and [`CompiledBlock`] implementations tying [`codegen`] and
//! [`host`] together (§5 "Compile pipeline", §3 "Backend").

use std::sync::Arc;

use psx_recompiler_core::backend::{Backend, CompileInput, CompiledBlock, RunContext};
use psx_recompiler_core::cycles::base_cost;
use psx_recompiler_core::exit_flags::ExitFlags;
use psx_recompiler_core::regs::GuestRegisters;
use wasmtime::{Engine, Linker, Module, Store};

use crate::error::WasmBackendError;
use crate::host::{self, HostCtx};
use crate::codegen;

/// One compiled block: the emitted [`Module`] plus everything [`WasmBlock::run`]
/// needs to instantiate and invoke it. A fresh [`Store`]/`Instance` pair is
/// created per call rather than kept around between runs, since a `Store`
/// is cheap to build and this avoids having to reset any WASM-side state
/// between invocations (there is none beyond the function locals, which
/// are always zero-initialized on entry).
pub struct WasmBlock {
    engine: Engine,
    linker: Arc<Linker<HostCtx>>,
    module: Module,
    /// The block's own entry PC, returned on the rare path where `wasmtime`
    /// itself fails to instantiate or run the module (never a property of
    /// guest code; see `Backend::compile`'s doc comment on `Self::Error`).
    pc: u32,
    /// Sum of [`base_cost`] over the block's opcodes, computed once at
    /// compile time rather than re-derived on every run.
    cycle_count: u32,
}

impl CompiledBlock for WasmBlock {
    fn run(&self, regs: &mut GuestRegisters, ctx: &mut RunContext<'_>, current_cycle: &mut u32, _target_cycle: u32) -> (u32, ExitFlags) {
        // SAFETY: `regs`, `ctx.map`, and `ctx.cop_ops` are exclusive borrows
        // held by the caller for the duration of this call, which is also
        // the entire lifetime of the `HostCtx` constructed from them; none
        // of the three pointers are used after this function returns.
        #[allow(unsafe_code)]
        let host_ctx = unsafe { HostCtx::new(regs as *mut GuestRegisters, ctx.map as *mut _, ctx.cop_ops as *mut _, *current_cycle) };

        let mut store = Store::new(&self.engine, host_ctx);
        let instance = match self.linker.instantiate(&mut store, &self.module) {
            Ok(instance) => instance,
            Err(err) => {
                tracing::error!(pc = %format_args!("{:#010x}", self.pc), error = %err, "failed to instantiate compiled block module");
                *current_cycle += self.cycle_count;
                return (self.pc, ExitFlags::SEGFAULT);
            }
        };
        let run = match instance.get_typed_func::<(), i32>(&mut store, "run") {
            Ok(run) => run,
            Err(err) => {
                tracing::error!(pc = %format_args!("{:#010x}", self.pc), error = %err, "compiled block module has no callable `run` export");
                *current_cycle += self.cycle_count;
                return (self.pc, ExitFlags::SEGFAULT);
            }
        };

        let next_pc = match run.call(&mut store, ()) {
            Ok(value) => value as u32,
            Err(err) => {
                tracing::error!(pc = %format_args!("{:#010x}", self.pc), error = %err, "trap while executing compiled block");
                *current_cycle += self.cycle_count;
                return (self.pc, ExitFlags::SEGFAULT);
            }
        };

        *current_cycle += self.cycle_count;
        let exit_flags = if store.data().fault { ExitFlags::SEGFAULT } else { ExitFlags::NORMAL };
        (next_pc, exit_flags)
    }
}

/// Emits and validates a WASM module per guest block, sharing one
/// [`Engine`]/[`Linker`] pair across every block it compiles (§5 "Compile
/// pipeline: one `Backend` per `RecompilerState`").
pub struct WasmBackend {
    engine: Engine,
    linker: Arc<Linker<HostCtx>>,
}

impl WasmBackend {
    /// # Errors
    /// Returns [`WasmBackendError::LinkerSetup`] if wiring up the shared
    /// host-function imports fails, which can only happen if `wasmtime`
    /// itself rejects one of the fixed signatures in [`host::build_linker`].
    pub fn new() -> Result<Self, WasmBackendError> {
        let engine = Engine::default();
        let linker = host::build_linker(&engine).map_err(WasmBackendError::LinkerSetup)?;
        Ok(Self { engine, linker: Arc::new(linker) })
    }
}

impl Default for WasmBackend {
    /// Builds a backend with the default [`Engine`] configuration. Panics
    /// only if `wasmtime` itself is broken in a way [`Self::new`] would
    /// already have hit on any prior call; prefer `new` where a `Result` is
    /// wanted instead.
    fn default() -> Self {
        Self::new().expect("default wasmtime engine configuration always links")
    }
}

impl Backend for WasmBackend {
    type Block = WasmBlock;
    type Error = WasmBackendError;

    fn compile(&mut self, input: CompileInput<'_>) -> Result<Self::Block, Self::Error> {
        let bytes = codegen::emit_module(input.pc, input.opcodes);
        let module = Module::new(&self.engine, &bytes).map_err(|source| WasmBackendError::Compile { pc: input.pc, source })?;
        let cycle_count = input.opcodes.iter().map(|op| base_cost(op.kind)).sum();
        tracing::debug!(pc = %format_args!("{:#010x}", input.pc), opcodes = input.opcodes.len(), cycle_count, "compiled block to wasm");
        Ok(WasmBlock { engine: self.engine.clone(), linker: Arc::clone(&self.linker), module, pc: input.pc, cycle_count })
    }
}
