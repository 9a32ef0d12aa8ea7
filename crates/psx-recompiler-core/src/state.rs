//! Top-level recompiler state: everything the dispatcher needs to run guest
//! code (§3 "State").

use std::sync::Arc;

use crate::backend::Backend;
use crate::block::Block;
use crate::cache::BlockCache;
use crate::config::RecompilerConfig;
use crate::cop::CopOps;
use crate::exit_flags::ExitFlags;
use crate::mem::{kunseg, MapTable};
use crate::regs::GuestRegisters;

/// Owns the guest register file, the block cache, the memory map, the
/// coprocessor callback, and the dispatcher's bookkeeping (current PC,
/// cycle counters, exit flags, and the block presently executing).
///
/// `current` is an `Arc<Block<B>>`, not a bare reference, so the block
/// cache can be mutated (e.g. an SMC invalidation evicting a different
/// entry) while a block is mid-execution without invalidating the
/// dispatcher's own handle to it (§3 "never free the currently-executing
/// block").
pub struct RecompilerState<B: Backend> {
    pub regs: GuestRegisters,
    pc: u32,
    current_cycle: u32,
    target_cycle: u32,
    exit_flags: ExitFlags,
    current: Option<Arc<Block<B>>>,
    pub cache: BlockCache<B>,
    pub map: MapTable,
    pub cop_ops: Box<dyn CopOps>,
    pub config: RecompilerConfig,
}

impl<B: Backend> RecompilerState<B> {
    #[must_use]
    pub fn new(entry_pc: u32, map: MapTable, cop_ops: Box<dyn CopOps>, config: RecompilerConfig) -> Self {
        let cache = BlockCache::with_capacity(config.initial_block_cache_capacity);
        Self {
            regs: GuestRegisters::default(),
            pc: entry_pc,
            current_cycle: 0,
            target_cycle: 0,
            exit_flags: ExitFlags::NORMAL,
            current: None,
            cache,
            map,
            cop_ops,
            config,
        }
    }

    #[must_use]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    #[must_use]
    pub fn current_cycle(&self) -> u32 {
        self.current_cycle
    }

    pub fn set_current_cycle(&mut self, cycle: u32) {
        self.current_cycle = cycle;
    }

    #[must_use]
    pub fn target_cycle(&self) -> u32 {
        self.target_cycle
    }

    pub fn set_target_cycle(&mut self, cycle: u32) {
        self.target_cycle = cycle;
    }

    #[must_use]
    pub fn exit_flags(&self) -> ExitFlags {
        self.exit_flags
    }

    pub fn set_exit_flags(&mut self, flags: ExitFlags) {
        self.exit_flags = flags;
    }

    pub fn clear_exit_flags(&mut self) {
        self.exit_flags.clear();
    }

    #[must_use]
    pub fn current_block(&self) -> Option<&Arc<Block<B>>> {
        self.current.as_ref()
    }

    pub fn set_current_block(&mut self, block: Option<Arc<Block<B>>>) {
        self.current = block;
    }

    pub fn dump_registers(&self) -> [u32; 34] {
        self.regs.dump()
    }

    pub fn restore_registers(&mut self, values: &[u32; 34]) {
        self.regs.restore(values);
    }

    /// Mid-block cycle query (§11 "supplemented feature"): `current_cycle`
    /// plus the cost of every opcode of the currently executing block up to
    /// (but excluding) `upto`, or the whole block's cost if `upto` is
    /// `None`. Lets a host observer ask "how many cycles has the guest
    /// burned so far" without waiting for the block to exit, e.g. from a
    /// debugger or a mid-block interrupt check.
    #[must_use]
    pub fn current_cycle_count(&self, upto: Option<usize>) -> u32 {
        let Some(block) = &self.current else {
            return self.current_cycle;
        };
        let limit = upto.unwrap_or(block.opcodes.len()).min(block.opcodes.len());
        let consumed: u32 = block.opcodes[..limit]
            .iter()
            .map(|op| self.config.cost_of(op.kind))
            .sum();
        self.current_cycle + consumed
    }

    /// Overwrites the cycle counter (§6 `reset_cycle_count`), e.g. a host
    /// resetting its own timing epoch after a snapshot restore.
    pub fn reset_cycle_count(&mut self, value: u32) {
        self.current_cycle = value;
    }

    /// Marks `[addr, addr + len)` as written at `current_cycle` (§4.3, §6
    /// `invalidate`). Unsegments `addr` itself, so hosts may pass any
    /// kseg0/kseg1/kuseg-mapped address observed outside the JIT (e.g. a
    /// DMA transfer writing into guest RAM). A no-op if the range falls
    /// outside any map entry, or outside an `RWX` one (§4.3: "ROM regions
    /// cannot self-modify").
    pub fn invalidate(&mut self, addr: u32, len: usize) {
        let kaddr = kunseg(addr);
        if let Some(index) = self.map.find(kaddr) {
            self.map.mark_written(index, kaddr, len, self.current_cycle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::FallThroughBackend;
    use crate::cop::test_support::FlatCopOps;
    use crate::mem::{HostRegion, MapFlags, MemMap};

    fn fresh_state() -> RecompilerState<FallThroughBackend> {
        let region = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x1000].into_boxed_slice()).as_mut_ptr(), 0x1000) };
        let map = MapTable::new(vec![MemMap::host_backed(0, 0x1000, region, MapFlags::RWX)]).unwrap();
        RecompilerState::new(0, map, Box::new(FlatCopOps::default()), RecompilerConfig::default())
    }

    #[test]
    fn fresh_state_has_no_current_block() {
        let state = fresh_state();
        assert!(state.current_block().is_none());
        assert_eq!(state.current_cycle_count(None), 0);
    }

    #[test]
    fn exit_flags_are_settable_and_clearable() {
        let mut state = fresh_state();
        state.set_exit_flags(ExitFlags::SEGFAULT);
        assert!(state.exit_flags().contains(ExitFlags::SEGFAULT));
        state.clear_exit_flags();
        assert!(state.exit_flags().is_normal());
    }

    #[test]
    fn reset_cycle_count_overwrites_the_counter() {
        let mut state = fresh_state();
        state.set_current_cycle(100);
        state.reset_cycle_count(7);
        assert_eq!(state.current_cycle(), 7);
    }

    #[test]
    fn invalidate_marks_the_page_written_at_the_current_cycle() {
        let mut state = fresh_state();
        state.set_current_cycle(42);
        assert_eq!(state.map.page_timestamp(0, 0), 0);

        state.invalidate(0, 4);
        assert_eq!(state.map.page_timestamp(0, 0), 42);
    }

    #[test]
    fn invalidate_unsegments_the_address_before_looking_it_up() {
        let mut state = fresh_state();
        state.set_current_cycle(9);
        // kseg0's alias of address 0 (0x8000_0000) must hit the same
        // underlying page as the kuseg address itself.
        state.invalidate(0x8000_0000, 4);
        assert_eq!(state.map.page_timestamp(0, 0), 9);
    }

    #[test]
    fn invalidate_outside_any_map_entry_is_a_no_op() {
        let mut state = fresh_state();
        state.set_current_cycle(1);
        // Should not panic even though nothing is mapped there.
        state.invalidate(0x1000_0000, 4);
    }
}
