//! Reference peephole optimizer for a decoded block (§5 "Compile pipeline:
//! optimize").
//!
//! A real codegen backend likely wants its own, target-aware optimizer;
//! this one only does optimizations that are valid independent of the
//! target, and is meant to be a usable default a backend can opt out of.

use psx_recompiler_core::{Opcode, OpcodeKind, Optimizer};

/// Drops `Nop`s that carry no guest-visible effect. A `Nop`'s own delay-slot
/// status doesn't change this: a no-effect instruction executing
/// unconditionally after a branch is still a no-effect instruction, so it
/// is just as safe to drop there as anywhere else in the block.
pub fn optimize_block(opcodes: &[Opcode]) -> Vec<Opcode> {
    opcodes.iter().filter(|op| op.kind != OpcodeKind::Nop).copied().collect()
}

/// [`Optimizer`] wrapper around [`optimize_block`], the counterpart to
/// [`crate::MipsDisassembler`] on the [`psx_recompiler_core::Disassembler`]
/// seam: stateless, so the dispatcher can hold one instance for the whole
/// run.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopEliminationOptimizer;

impl Optimizer for NopEliminationOptimizer {
    fn optimize_block(&mut self, opcodes: Vec<Opcode>) -> Vec<Opcode> {
        optimize_block(&opcodes)
    }
}
