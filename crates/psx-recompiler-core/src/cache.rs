//! PC-keyed block cache (§3 "Block cache", §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::block::Block;

/// Maps guest PC to its compiled [`Block`], if one is currently live.
///
/// Entries are `Arc<Block<B>>` so a block can be removed from the cache
/// (e.g. by an SMC invalidation) while the dispatcher still holds a
/// reference to it as the block currently executing; the underlying
/// `Block` is only actually freed once both the cache's entry and the
/// dispatcher's `current` pointer have let go of it.
pub struct BlockCache<B: Backend> {
    entries: HashMap<u32, Arc<Block<B>>>,
}

impl<B: Backend> BlockCache<B> {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn find(&self, pc: u32) -> Option<Arc<Block<B>>> {
        self.entries.get(&pc).cloned()
    }

    /// Registers a newly compiled block under `pc`.
    ///
    /// # Panics
    /// Panics if an entry already exists for `pc`: the compile pipeline
    /// must check [`Self::find`] before compiling, so a pre-existing entry
    /// here means the dispatcher raced itself or skipped that check, both
    /// bugs in the caller rather than recoverable conditions.
    pub fn register(&mut self, pc: u32, block: Arc<Block<B>>) {
        let previous = self.entries.insert(pc, block);
        assert!(previous.is_none(), "block cache already had an entry for pc {pc:#010x}");
    }

    /// Removes the entry for `pc`, if any, returning it. Used by the
    /// self-modifying-code path: the removed `Arc` may still be held alive
    /// elsewhere (the dispatcher's `current` block) even after this call.
    pub fn unregister(&mut self, pc: u32) -> Option<Arc<Block<B>>> {
        let removed = self.entries.remove(&pc);
        if removed.is_some() {
            tracing::trace!(pc = %format_args!("{pc:#010x}"), "evicted stale block");
        }
        removed
    }

    /// Drops every cached block, e.g. after a bulk host-initiated memory
    /// write the invalidation table's page granularity can't usefully
    /// narrow down.
    pub fn drop_all(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::FallThroughBackend;
    use crate::backend::{Backend, CompileInput};
    use crate::block::hash_bytes;
    use crate::opcode::{Opcode, OpcodeFlags, OpcodeKind};

    fn nop_block(pc: u32) -> Block<FallThroughBackend> {
        let mut backend = FallThroughBackend;
        let opcodes = vec![Opcode {
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
        }];
        let compiled = backend.compile(CompileInput { pc, opcodes: &opcodes }).unwrap();
        Block::new(pc, pc, 0, opcodes, 1, compiled, hash_bytes(&[0u8; 4]), 0, 1)
    }

    #[test]
    fn register_then_find_round_trips() {
        let mut cache: BlockCache<FallThroughBackend> = BlockCache::with_capacity(4);
        let block = Arc::new(nop_block(0x1000));
        cache.register(0x1000, block.clone());
        assert!(Arc::ptr_eq(&cache.find(0x1000).unwrap(), &block));
        assert!(cache.find(0x2000).is_none());
    }

    #[test]
    #[should_panic(expected = "already had an entry")]
    fn double_register_panics() {
        let mut cache: BlockCache<FallThroughBackend> = BlockCache::with_capacity(4);
        cache.register(0x1000, Arc::new(nop_block(0x1000)));
        cache.register(0x1000, Arc::new(nop_block(0x1000)));
    }

    #[test]
    fn unregister_does_not_kill_a_held_reference() {
        let mut cache: BlockCache<FallThroughBackend> = BlockCache::with_capacity(4);
        let block = Arc::new(nop_block(0x1000));
        cache.register(0x1000, block.clone());

        let removed = cache.unregister(0x1000).unwrap();
        assert!(cache.find(0x1000).is_none());
        // `block` (simulating the dispatcher's "currently executing" handle)
        // and `removed` both still keep the block alive.
        assert_eq!(Arc::strong_count(&block), 2);
        drop(removed);
        assert_eq!(Arc::strong_count(&block), 1);
    }

    #[test]
    fn drop_all_empties_cache() {
        let mut cache: BlockCache<FallThroughBackend> = BlockCache::with_capacity(4);
        cache.register(0x1000, Arc::new(nop_block(0x1000)));
        cache.register(0x2000, Arc::new(nop_block(0x2000)));
        cache.drop_all();
        assert!(cache.is_empty());
    }
}
