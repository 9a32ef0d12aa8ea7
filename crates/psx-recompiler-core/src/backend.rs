//! The host codegen seam (§5 "Compile pipeline", §9 Open Question: wrapper
//! design).
//!
//! This crate never emits host machine code itself. A [`Backend`] turns a
//! decoded, optimized opcode stream into a [`CompiledBlock`] the dispatcher
//! can invoke; `psx-jit-wasm-backend` is this workspace's reference
//! implementation, built on `wasm-encoder` and `wasmtime`.

use crate::cop::CopOps;
use crate::exit_flags::ExitFlags;
use crate::mem::MapTable;
use crate::opcode::Opcode;
use crate::regs::GuestRegisters;

/// What the compile pipeline hands a [`Backend`] for one block (§5).
pub struct CompileInput<'a> {
    pub pc: u32,
    /// Fully decoded and (optionally) optimized opcode stream, in guest
    /// execution order, delay slots already inlined after their branch
    /// (§9: delay slots are always inlined, never left as a separate
    /// block).
    pub opcodes: &'a [Opcode],
}

/// Everything a running block needs besides the register file: the memory
/// map (for load/store and `LWC2`/`SWC2`) and the coprocessor callback (for
/// `MFC2`/`MTC2`). Bundled so [`CompiledBlock::run`]'s signature doesn't
/// grow every time a new host collaborator is added.
pub struct RunContext<'a> {
    pub map: &'a mut MapTable,
    pub cop_ops: &'a mut dyn CopOps,
}

/// A single compiled, directly callable unit of guest code.
///
/// Chaining (§9 Open Question, resolved in favor of the chaining wrapper
/// design): a backend is free to embed a direct call/jump to an
/// already-compiled successor block's `run` inside its own emitted code,
/// rather than always returning to the dispatcher between blocks. This
/// crate's dispatcher loop works correctly either way — it only requires
/// that `run` eventually returns when the cycle budget is exhausted or a
/// fault occurs.
pub trait CompiledBlock: Send {
    /// Runs this block (and possibly a chain of successors, see above)
    /// against `regs`, stopping no later than when `current_cycle` would
    /// reach `target_cycle`. Returns the guest PC execution stopped at and
    /// the exit flags describing why.
    fn run(
        &self,
        regs: &mut GuestRegisters,
        ctx: &mut RunContext<'_>,
        current_cycle: &mut u32,
        target_cycle: u32,
    ) -> (u32, ExitFlags);
}

/// Host code generator: compiles decoded opcode streams into runnable
/// blocks (§5).
pub trait Backend {
    type Block: CompiledBlock;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Compiles one block's worth of opcodes. Called once per distinct PC
    /// the block cache doesn't already hold a live entry for.
    fn compile(&mut self, input: CompileInput<'_>) -> Result<Self::Block, Self::Error>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{Backend, CompileInput, CompiledBlock, RunContext};
    use crate::exit_flags::ExitFlags;
    use crate::regs::GuestRegisters;
    use std::convert::Infallible;

    /// A compiled block that always exits immediately at a fixed PC with
    /// fixed flags, consuming one cycle. Mirrors the teacher corpus's
    /// pattern of exercising the dispatcher/cache without a real codegen
    /// backend in the loop.
    pub struct FixedExitBlock {
        pub next_pc: u32,
        pub flags: ExitFlags,
    }

    impl CompiledBlock for FixedExitBlock {
        fn run(
            &self,
            _regs: &mut GuestRegisters,
            _ctx: &mut RunContext<'_>,
            current_cycle: &mut u32,
            _target_cycle: u32,
        ) -> (u32, ExitFlags) {
            *current_cycle += 1;
            (self.next_pc, self.flags)
        }
    }

    /// A backend that compiles every block to a [`FixedExitBlock`] jumping
    /// to `pc + 4 * opcodes.len()` (i.e. "fall through to the next word"),
    /// never failing.
    #[derive(Default)]
    pub struct FallThroughBackend;

    impl Backend for FallThroughBackend {
        type Block = FixedExitBlock;
        type Error = Infallible;

        fn compile(&mut self, input: CompileInput<'_>) -> Result<Self::Block, Self::Error> {
            let next_pc = input.pc.wrapping_add(4 * input.opcodes.len() as u32);
            Ok(FixedExitBlock {
                next_pc,
                flags: ExitFlags::NORMAL,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FallThroughBackend;
    use super::{Backend, CompileInput, RunContext};
    use crate::cop::test_support::FlatCopOps;
    use crate::mem::{HostRegion, MapFlags, MapTable, MemMap};
    use crate::opcode::{Opcode, OpcodeFlags, OpcodeKind};
    use crate::regs::GuestRegisters;

    fn nop(pc: u32) -> Opcode {
        Opcode {
            kind: OpcodeKind::Nop,
            pc,
            raw: 0,
            rs: 0,
            rt: 0,
            rd: 0,
            shamt: 0,
            imm: 0,
            jump_target: 0,
            flags: OpcodeFlags::empty(),
        }
    }

    #[test]
    fn fall_through_backend_advances_by_opcode_count() {
        let mut backend = FallThroughBackend;
        let opcodes = [nop(0x1000), nop(0x1004)];
        let block = backend
            .compile(CompileInput {
                pc: 0x1000,
                opcodes: &opcodes,
            })
            .unwrap();
        let mut regs = GuestRegisters::default();
        let mut cycle = 0;

        let region = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x10].into_boxed_slice()).as_mut_ptr(), 0x10) };
        let mut map = MapTable::new(vec![MemMap::host_backed(0, 0x10, region, MapFlags::RWX)]).unwrap();
        let mut cop_ops = FlatCopOps::default();
        let mut ctx = RunContext {
            map: &mut map,
            cop_ops: &mut cop_ops,
        };

        let (next_pc, flags) = block.run(&mut regs, &mut ctx, &mut cycle, 100);
        assert_eq!(next_pc, 0x1008);
        assert!(flags.is_normal());
        assert_eq!(cycle, 1);
    }
}
