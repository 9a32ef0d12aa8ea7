//! Core of a dynamic binary translator for a PlayStation-like MIPS-I guest.
//!
//! This crate owns the block dispatcher, the guest memory map, the load/store
//! ("RW") engine, the block cache and compile pipeline, and the dispatcher
//! trampoline loop. The instruction-set disassembler, the per-opcode
//! optimizer, the host code emitter and the guest-to-host register allocator
//! are external collaborators, consumed here only through the traits in
//! [`backend`] and [`opcode`].

pub mod backend;
pub mod block;
pub mod cache;
pub mod config;
pub mod cop;
pub mod cycles;
pub mod disasm;
pub mod dispatch;
pub mod error;
pub mod exit_flags;
pub mod invalidate;
pub mod mem;
pub mod opcode;
pub mod optimize;
pub mod regs;
pub mod rw;
pub mod state;

pub use backend::{Backend, CompileInput, CompiledBlock};
pub use block::Block;
pub use cache::BlockCache;
pub use config::RecompilerConfig;
pub use cop::CopOps;
pub use disasm::Disassembler;
pub use dispatch::{execute, execute_at, execute_one, execute_one_at, get_next_block};
pub use error::RecompilerError;
pub use exit_flags::ExitFlags;
pub use invalidate::InvalidationTable;
pub use mem::{HostRegion, IoOps, MapFlags, MapTable, MemMap};
pub use opcode::{EmitOutcome, Opcode, OpcodeFlags, OpcodeKind};
pub use optimize::Optimizer;
pub use regs::GuestRegisters;
pub use state::RecompilerState;
