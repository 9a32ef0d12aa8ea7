//! Errors this backend's [`crate::WasmBackend::compile`] can surface.
//!
//! Runtime failures (instantiation, missing entry point, traps) are not
//! represented here: [`crate::WasmBlock::run`] cannot return a `Result` at
//! all (`CompiledBlock::run`'s signature is infallible), so those are
//! folded into `ExitFlags::SEGFAULT` and logged instead, the same way the
//! core crate's own RW engine turns an unmapped access into a flag rather
//! than a panic.

use thiserror::Error;

/// Failures raised while turning one block's opcodes into a runnable
/// [`crate::WasmBlock`].
#[derive(Error, Debug)]
pub enum WasmBackendError {
    /// Wiring up the shared host-function [`wasmtime::Linker`] failed. This
    /// can only happen once, at [`crate::WasmBackend::new`], since every
    /// import signature is fixed at compile time.
    #[error("failed to wire up the host function linker: {0}")]
    LinkerSetup(#[source] wasmtime::Error),

    /// `wasmtime` rejected the module this backend emitted for the block at
    /// `pc`. Since the module is generated here rather than supplied by a
    /// guest, this indicates a bug in [`crate::codegen`], not bad guest
    /// code.
    #[error("wasmtime rejected the emitted module for block at {pc:#010x}: {source}")]
    Compile {
        pc: u32,
        #[source]
        source: wasmtime::Error,
    },
}
