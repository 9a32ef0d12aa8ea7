//! A MIPS-I disassembler for the subset a PlayStation-like guest CPU
//! actually executes, plus a small reference peephole optimizer.
//!
//! This crate is a consumer of `psx-recompiler-core`'s [`Disassembler`]
//! seam, not a dependency of it: the core crate never decodes a raw guest
//! word itself.

mod decode;
mod optimize;

pub use decode::MipsDisassembler;
pub use optimize::{optimize_block, NopEliminationOptimizer};
