//! The dispatcher trampoline loop: fetch-or-compile, run, chain until the
//! cycle budget is exhausted or a fault exits (§5, §9 "Open Question:
//! wrapper design").
//!
//! Chaining itself is realized by individual [`crate::backend::CompiledBlock`]
//! implementations embedding calls to their own successors; this loop only
//! needs to resume at whatever PC a `run` call returns, exactly as if every
//! block always returned to the dispatcher. That keeps the trampoline
//! itself plain, panic-free Rust instead of hand-written machine code.

use std::sync::Arc;

use crate::backend::{Backend, CompileInput, RunContext};
use crate::block::{hash_bytes, Block};
use crate::disasm::Disassembler;
use crate::error::RecompilerError;
use crate::exit_flags::ExitFlags;
use crate::mem::kunseg;
use crate::optimize::Optimizer;
use crate::state::RecompilerState;

fn is_fresh<B: Backend>(state: &RecompilerState<B>, block: &Block<B>) -> bool {
    let page_timestamp = state.map.page_timestamp(block.map_entry, block.kunseg_pc);
    if block.is_timestamp_fresh(page_timestamp) {
        return true;
    }
    match state.map.host_bytes(block.map_entry, block.kunseg_pc, block.source_byte_len()) {
        Some(bytes) => block.is_hash_fresh(hash_bytes(bytes)),
        // A block compiled from a range that can no longer be read back
        // (e.g. the map entry was removed) is unconditionally stale.
        None => false,
    }
}

fn compile_block<B: Backend, D: Disassembler, O: Optimizer>(
    state: &mut RecompilerState<B>,
    disassembler: &mut D,
    optimizer: &mut O,
    backend: &mut B,
    pc: u32,
) -> Result<Arc<Block<B>>, RecompilerError> {
    let kaddr = kunseg(pc);
    let index = state.map.find(kaddr).ok_or(RecompilerError::UnmappedAddress { addr: pc })?;

    let source_opcodes = disassembler
        .disassemble_block(&state.map, pc)
        .map_err(|err| RecompilerError::Disassembly {
            pc,
            reason: err.to_string(),
        })?;

    // The staleness hash and timestamp cover the full disassembled span,
    // computed before the optimizer gets a chance to shrink the opcode
    // list (§4.4 steps 5-6: populate metadata, then optimize).
    let source_words = source_opcodes.len() as u32;
    let byte_len = source_opcodes.len() * 4;
    let content_hash = state.map.host_bytes(index, kaddr, byte_len).map(hash_bytes).unwrap_or(0);
    let compiled_at_timestamp = state.map.page_timestamp(index, kaddr);

    let opcodes = optimizer.optimize_block(source_opcodes);
    let cycle_count = opcodes.iter().map(|op| state.config.cost_of(op.kind)).sum();

    let compiled = backend
        .compile(CompileInput { pc, opcodes: &opcodes })
        .map_err(|err| RecompilerError::Backend {
            pc,
            source: Box::new(err),
        })?;

    let opcode_count = opcodes.len();
    let block = Arc::new(Block::new(
        pc,
        kaddr,
        index,
        opcodes,
        source_words,
        compiled,
        content_hash,
        compiled_at_timestamp,
        cycle_count,
    ));
    state.cache.register(pc, Arc::clone(&block));
    tracing::debug!(pc = %format_args!("{pc:#010x}"), opcode_count, cycle_count, "compiled block");
    Ok(block)
}

/// Returns the block that should run at `state.pc()`: a live cache hit,
/// or a freshly (re)compiled one after evicting a stale entry (§4.3).
pub fn get_next_block<B: Backend, D: Disassembler, O: Optimizer>(
    state: &mut RecompilerState<B>,
    disassembler: &mut D,
    optimizer: &mut O,
    backend: &mut B,
) -> Result<Arc<Block<B>>, RecompilerError> {
    let pc = state.pc();
    if let Some(block) = state.cache.find(pc) {
        if is_fresh(state, &block) {
            return Ok(block);
        }
        state.cache.unregister(pc);
    }
    compile_block(state, disassembler, optimizer, backend, pc)
}

/// Runs exactly one compiled block (plus however much of a chain its
/// backend embedded), updating `state`'s PC, cycle counter, and current
/// block handle, and returning the flags that block exited with.
///
/// A compile failure (unmapped `pc`, a disassembly fault, or the backend's
/// own emission failing) is never propagated as a Rust error here: §4.4
/// and §4.6 step 3 both describe it collapsing into the dispatcher setting
/// `SEGFAULT` and leaving `pc` exactly where it was, the same as any other
/// unmapped access. The core "never panics; every failure ... is reflected
/// in exit_flags by the time the dispatcher returns" (§7) — this is the one
/// place that rule gets enforced for the whole compile pipeline at once.
pub fn execute_one<B: Backend, D: Disassembler, O: Optimizer>(
    state: &mut RecompilerState<B>,
    disassembler: &mut D,
    optimizer: &mut O,
    backend: &mut B,
) -> ExitFlags {
    let pc = state.pc();
    let block = match get_next_block(state, disassembler, optimizer, backend) {
        Ok(block) => block,
        Err(err) => {
            tracing::error!(pc = %format_args!("{pc:#010x}"), error = %err, "block compile failed, faulting");
            return ExitFlags::SEGFAULT;
        }
    };
    state.set_current_block(Some(Arc::clone(&block)));

    let mut cycle = state.current_cycle();
    let target = state.target_cycle();
    let mut ctx = RunContext {
        map: &mut state.map,
        cop_ops: state.cop_ops.as_mut(),
    };
    let (next_pc, flags) = block.compiled.run(&mut state.regs, &mut ctx, &mut cycle, target);

    state.set_current_cycle(cycle);
    state.set_pc(next_pc);
    flags
}

/// Runs blocks until `state.current_cycle()` reaches `state.target_cycle()`
/// or a non-[`crate::exit_flags::ExitFlags::NORMAL`] exit occurs (§5).
///
/// Mirrors the wrapper trampoline's landing check (§4.5) exactly: a block
/// always runs to completion first, and the budget/exit-flag check happens
/// *after*, never before. A block never gets preempted mid-flight, and — as
/// S6 requires — a call whose `target_cycle` the very first block already
/// overshoots still runs that whole block rather than exiting having run
/// nothing.
pub fn execute<B: Backend, D: Disassembler, O: Optimizer>(
    state: &mut RecompilerState<B>,
    disassembler: &mut D,
    optimizer: &mut O,
    backend: &mut B,
) -> ExitFlags {
    state.clear_exit_flags();
    loop {
        let flags = execute_one(state, disassembler, optimizer, backend);
        if !flags.is_normal() {
            state.set_exit_flags(state.exit_flags() | flags);
            break;
        }
        if state.current_cycle() >= state.target_cycle() {
            break;
        }
    }
    state.exit_flags()
}

/// Host-facing entry point matching §6's `execute(state, pc, target_cycle)
/// -> next_pc` exactly, including the overflow clamp from testable property
/// 7: if `target_cycle` has already passed (wrapped relative to the
/// counter), the deadline is clamped to `u32::MAX` rather than exiting
/// immediately having "already expired". [`execute`] and [`execute_one`]
/// above are the lower-level loop/single-step primitives this builds on;
/// most callers want this one.
pub fn execute_at<B: Backend, D: Disassembler, O: Optimizer>(
    state: &mut RecompilerState<B>,
    disassembler: &mut D,
    optimizer: &mut O,
    backend: &mut B,
    pc: u32,
    target_cycle: u32,
) -> u32 {
    state.set_pc(pc);
    let target_cycle = if target_cycle < state.current_cycle() { u32::MAX } else { target_cycle };
    state.set_target_cycle(target_cycle);
    execute(state, disassembler, optimizer, backend);
    state.pc()
}

/// `execute_one(state, pc) = execute(state, pc, state.current_cycle())`
/// (§4.6): compiles-on-miss and runs exactly one block's worth, then
/// returns without chaining further, regardless of the remaining cycle
/// budget.
pub fn execute_one_at<B: Backend, D: Disassembler, O: Optimizer>(
    state: &mut RecompilerState<B>,
    disassembler: &mut D,
    optimizer: &mut O,
    backend: &mut B,
    pc: u32,
) -> u32 {
    let target_cycle = state.current_cycle();
    execute_at(state, disassembler, optimizer, backend, pc, target_cycle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::FallThroughBackend;
    use crate::config::RecompilerConfig;
    use crate::cop::test_support::FlatCopOps;
    use crate::disasm::test_support::SingleNopDisassembler;
    use crate::exit_flags::ExitFlags;
    use crate::mem::{HostRegion, MapFlags, MapTable, MemMap};
    use crate::optimize::test_support::NoopOptimizer;

    fn fresh_state() -> RecompilerState<FallThroughBackend> {
        let region = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x1000].into_boxed_slice()).as_mut_ptr(), 0x1000) };
        let map = MapTable::new(vec![MemMap::host_backed(0, 0x1000, region, MapFlags::RWX)]).unwrap();
        RecompilerState::new(0, map, Box::new(FlatCopOps::default()), RecompilerConfig::default())
    }

    #[test]
    fn execute_one_advances_pc_and_compiles_on_first_visit() {
        let mut state = fresh_state();
        let mut disassembler = SingleNopDisassembler;
        let mut optimizer = NoopOptimizer;
        let mut backend = FallThroughBackend;
        assert_eq!(state.cache.len(), 0);

        let flags = execute_one(&mut state, &mut disassembler, &mut optimizer, &mut backend);
        assert!(flags.is_normal());
        assert_eq!(state.pc(), 4);
        assert_eq!(state.cache.len(), 1);
    }

    #[test]
    fn execute_one_hits_cache_on_second_visit_to_the_same_pc() {
        let mut state = fresh_state();
        let mut disassembler = SingleNopDisassembler;
        let mut optimizer = NoopOptimizer;
        let mut backend = FallThroughBackend;

        execute_one(&mut state, &mut disassembler, &mut optimizer, &mut backend);
        state.set_pc(0);
        execute_one(&mut state, &mut disassembler, &mut optimizer, &mut backend);
        assert_eq!(state.cache.len(), 1);
    }

    #[test]
    fn execute_runs_until_cycle_budget_exhausted() {
        let mut state = fresh_state();
        state.set_target_cycle(3);
        let mut disassembler = SingleNopDisassembler;
        let mut optimizer = NoopOptimizer;
        let mut backend = FallThroughBackend;

        let flags = execute(&mut state, &mut disassembler, &mut optimizer, &mut backend);
        assert!(flags.is_normal());
        assert!(state.current_cycle() >= 3);
    }

    #[test]
    fn execute_one_always_runs_a_full_block_even_when_already_at_budget() {
        // S6/testable-property 1: `execute_one(pc) == execute(pc, current_cycle)`
        // must still run exactly one block to completion, not exit having
        // run nothing because the deadline was already "met".
        let mut state = fresh_state();
        let mut disassembler = SingleNopDisassembler;
        let mut optimizer = NoopOptimizer;
        let mut backend = FallThroughBackend;

        let next_pc = execute_one_at(&mut state, &mut disassembler, &mut optimizer, &mut backend, 0);
        assert_eq!(next_pc, 4);
        assert_eq!(state.current_cycle(), 1);
        assert_eq!(state.cache.len(), 1);
    }

    #[test]
    fn execute_at_clamps_an_already_passed_target_cycle_to_u32_max() {
        let mut state = fresh_state();
        state.set_current_cycle(1000);
        let mut disassembler = SingleNopDisassembler;
        let mut optimizer = NoopOptimizer;
        let mut backend = FallThroughBackend;

        execute_at(&mut state, &mut disassembler, &mut optimizer, &mut backend, 0, 10);
        assert_eq!(state.target_cycle(), u32::MAX);
    }

    #[test]
    fn self_modifying_write_forces_recompile() {
        let mut state = fresh_state();
        let mut disassembler = SingleNopDisassembler;
        let mut optimizer = NoopOptimizer;
        let mut backend = FallThroughBackend;

        execute_one(&mut state, &mut disassembler, &mut optimizer, &mut backend);
        assert_eq!(state.cache.len(), 1);

        state.set_pc(0);
        crate::rw::sw(&mut state.map, 0, 0xffff_ffff).unwrap();
        crate::rw::mark_written(&mut state.map, 0, 0, 4, state.current_cycle() + 1);

        execute_one(&mut state, &mut disassembler, &mut optimizer, &mut backend);
        // The cache entry is still exactly one (the stale one was evicted
        // and replaced, not left stacked alongside a new one).
        assert_eq!(state.cache.len(), 1);
    }

    #[test]
    fn jumping_to_an_unmapped_pc_faults_instead_of_erroring() {
        // S5: no Rust `Err` ever reaches the caller for an unmapped `pc` —
        // it folds into `SEGFAULT`, and the PC the caller asked for is left
        // untouched (§4.6 step 3).
        let mut state = fresh_state();
        let mut disassembler = SingleNopDisassembler;
        let mut optimizer = NoopOptimizer;
        let mut backend = FallThroughBackend;

        let next_pc = execute_at(&mut state, &mut disassembler, &mut optimizer, &mut backend, 0x1000_0000, 1000);
        assert_eq!(next_pc, 0x1000_0000);
        assert!(state.exit_flags().contains(ExitFlags::SEGFAULT));
    }

    #[test]
    fn fault_exit_flags_propagate_and_stop_the_loop() {
        struct FaultingBlock;
        impl crate::backend::CompiledBlock for FaultingBlock {
            fn run(
                &self,
                _regs: &mut crate::regs::GuestRegisters,
                _ctx: &mut RunContext<'_>,
                current_cycle: &mut u32,
                _target_cycle: u32,
            ) -> (u32, ExitFlags) {
                *current_cycle += 1;
                (0, ExitFlags::SEGFAULT)
            }
        }
        struct FaultingBackend;
        impl Backend for FaultingBackend {
            type Block = FaultingBlock;
            type Error = std::convert::Infallible;
            fn compile(&mut self, _input: CompileInput<'_>) -> Result<Self::Block, Self::Error> {
                Ok(FaultingBlock)
            }
        }

        let region = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x1000].into_boxed_slice()).as_mut_ptr(), 0x1000) };
        let map = MapTable::new(vec![MemMap::host_backed(0, 0x1000, region, MapFlags::RWX)]).unwrap();
        let mut state: RecompilerState<FaultingBackend> =
            RecompilerState::new(0, map, Box::new(FlatCopOps::default()), RecompilerConfig::default());
        state.set_target_cycle(1000);
        let mut disassembler = SingleNopDisassembler;
        let mut optimizer = NoopOptimizer;
        let mut backend = FaultingBackend;

        let flags = execute(&mut state, &mut disassembler, &mut optimizer, &mut backend);
        assert!(flags.contains(ExitFlags::SEGFAULT));
        assert!(state.current_cycle() < 1000);
    }
}
