//! Reference host codegen backend (§5, §9): turns one guest block's decoded
//! opcode stream into a WASM module with a single exported `run` function
//! and executes it under an embedded `wasmtime` runtime.
//!
//! Every guest-visible effect — GPR/HI/LO reads and writes, memory
//! loads/stores, coprocessor transfers — crosses the host boundary through
//! the imported functions in [`host`]; the emitted module itself declares
//! no linear memory. This keeps the codegen surface small (no register
//! allocator, no memory layout decisions) at the cost of one host call per
//! guest instruction, which is the right tradeoff for a backend whose job
//! is to be an obviously-correct reference rather than the fastest one.

mod backend;
mod codegen;
mod error;
mod host;

pub use backend::{WasmBackend, WasmBlock};
pub use error::WasmBackendError;
pub use host::HostCtx;
