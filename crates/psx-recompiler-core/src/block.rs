//! Compiled block descriptor and staleness detection (§3 "Block", §4.3
//! "Outdated detection").

use crate::backend::{Backend, CompiledBlock};
use crate::opcode::Opcode;

/// One compiled block: its guest address, the opcodes it was built from,
/// the host-compiled code, and everything needed to decide later whether
/// it is still valid to run (§4.3).
///
/// Blocks are reference-counted ([`std::sync::Arc`]) rather than owned
/// outright by the cache: the dispatcher holds its own `Arc` to the block
/// currently executing, so a concurrent self-modifying-code invalidation
/// that drops the cache's entry can never free memory the dispatcher is
/// still reading (§3 "never free the currently-executing block").
pub struct Block<B: Backend> {
    /// Guest virtual address (kseg-mapped) this block starts at; the key
    /// used to look it up in the block cache.
    pub pc: u32,
    /// `kunseg(pc)`, the address used for map lookup and hashing.
    pub kunseg_pc: u32,
    /// Index of the memory map entry this block was compiled from.
    pub map_entry: usize,
    /// Decoded opcode stream after the optimizer pass, delay slots already
    /// inlined. May be shorter than the block's source span if the
    /// optimizer dropped entries (e.g. dead `nop`s).
    pub opcodes: Vec<Opcode>,
    /// Length, in 32-bit words, of the guest byte range this block was
    /// disassembled from, *before* the optimizer ran. Staleness re-hashing
    /// (§4.3) must cover this full span rather than `opcodes.len()`, since
    /// the optimizer can shrink the opcode list without shrinking the
    /// range of guest memory the block is sensitive to being overwritten.
    source_words: u32,
    pub compiled: B::Block,
    /// `xxh3` content hash of the raw guest bytes the block was compiled
    /// from, the authoritative (but comparatively expensive) staleness
    /// check (§4.3).
    content_hash: u64,
    /// `current_cycle` timestamp of the invalidation table page(s) this
    /// block's source range covered, as observed at compile time; a cheap
    /// first filter before falling back to re-hashing (§4.3).
    compiled_at_timestamp: u32,
    pub cycle_count: u32,
}

impl<B: Backend> Block<B> {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pc: u32,
        kunseg_pc: u32,
        map_entry: usize,
        opcodes: Vec<Opcode>,
        source_words: u32,
        compiled: B::Block,
        content_hash: u64,
        compiled_at_timestamp: u32,
        cycle_count: u32,
    ) -> Self {
        Self {
            pc,
            kunseg_pc,
            map_entry,
            opcodes,
            source_words,
            compiled,
            content_hash,
            compiled_at_timestamp,
            cycle_count,
        }
    }

    /// Byte length of the guest range this block was disassembled from,
    /// prior to optimization; the span to re-hash when checking staleness.
    #[must_use]
    pub fn source_byte_len(&self) -> usize {
        self.source_words as usize * 4
    }

    /// Fast-path staleness check: if the covering page's invalidation
    /// timestamp hasn't moved since this block was compiled, it cannot have
    /// been overwritten and the (expensive) hash re-check can be skipped.
    #[must_use]
    pub fn is_timestamp_fresh(&self, current_page_timestamp: u32) -> bool {
        current_page_timestamp == self.compiled_at_timestamp
    }

    #[must_use]
    pub fn content_hash(&self) -> u64 {
        self.content_hash
    }

    /// Authoritative staleness check: recompute the hash of the same byte
    /// range and compare. Called only when [`Self::is_timestamp_fresh`]
    /// returns `false`, since it requires re-reading guest memory (§4.3).
    #[must_use]
    pub fn is_hash_fresh(&self, recomputed_hash: u64) -> bool {
        recomputed_hash == self.content_hash
    }
}

/// Hashes `bytes` with the same algorithm used for block content hashes, so
/// callers computing a hash to pass to [`Block::is_hash_fresh`] stay in
/// sync with whatever hashed the block in the first place.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}
