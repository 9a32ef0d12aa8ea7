//! Guest address resolution: `kunseg`, the memory map table, and mirrors
//! (§3 "Memory map entry", §4.1).

use bitflags::bitflags;

use crate::error::MapValidationError;
use crate::invalidate::InvalidationTable;

/// Strips the MIPS kseg mapping, yielding the "physical" guest address used
/// for map lookup, invalidation, and hashing (§4.1).
#[must_use]
pub fn kunseg(addr: u32) -> u32 {
    const KSEG0_BASE: u32 = 0x8000_0000;
    const KSEG1_BASE: u32 = 0xa000_0000;

    if addr >= KSEG1_BASE {
        addr - KSEG1_BASE
    } else if addr >= KSEG0_BASE {
        addr - KSEG0_BASE
    } else {
        addr
    }
}

bitflags! {
    /// Per-map-entry flags (§3, §6: "The RWX flag bit enables SMC tracking").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u8 {
        const RWX = 1 << 0;
    }
}

/// A raw, host-owned backing region for a memory map entry. The host retains
/// ownership of the bytes for the recompiler state's lifetime (§3
/// "Ownership"); the recompiler only ever borrows them through
/// [`HostRegion::as_slice`] / [`HostRegion::as_mut_slice`], scoped to a
/// single access.
pub struct HostRegion {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
}

// SAFETY: `HostRegion` is a thin, non-owning view the host promises not to
// free or alias-mutate for the recompiler's lifetime; see `RecompilerState`
// ownership notes (§3).
unsafe impl Send for HostRegion {}

impl HostRegion {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as the returned `HostRegion` (and anything it is copied into) is
    /// alive, and the host must not hand out another mutable view of the
    /// same bytes while the recompiler holds this one.
    #[must_use]
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: std::ptr::NonNull::new(ptr).expect("host region pointer must not be null"),
            len,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The caller must not hold this slice across a call that could mutate
    /// the same bytes through another `HostRegion` view (e.g. a mirror of
    /// this entry).
    #[must_use]
    #[allow(unsafe_code)]
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    /// Same requirements as [`Self::as_slice`], but exclusive.
    #[must_use]
    #[allow(unsafe_code)]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl std::fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Hardware/IO callback vtable for a map entry with no direct host backing
/// (§6 "Hardware / IO callbacks"). Widths are exact; sign extension is the
/// RW engine's responsibility, never the callback's.
pub trait IoOps: Send {
    fn lb(&mut self, addr: u32) -> u8;
    fn lh(&mut self, addr: u32) -> u16;
    fn lw(&mut self, addr: u32) -> u32;
    fn sb(&mut self, addr: u32, value: u8);
    fn sh(&mut self, addr: u32, value: u16);
    fn sw(&mut self, addr: u32, value: u32);
}

/// One entry of the host-supplied memory map (§3).
pub struct MemMap {
    pub pc: u32,
    pub length: u32,
    backing: Backing,
    pub flags: MapFlags,
    /// Present only for `RWX` entries: the per-page write-timestamp table
    /// backing self-modifying-code detection (§4.3). Non-`RWX` entries
    /// (plain data, I/O, mirrors) never need one since blocks are never
    /// compiled from them.
    invalidation: Option<InvalidationTable>,
}

enum Backing {
    Host(HostRegion),
    Io(Box<dyn IoOps>),
    /// Index into the owning `Vec<MemMap>` of the entry this one mirrors.
    Mirror(usize),
}

impl MemMap {
    #[must_use]
    pub fn host_backed(pc: u32, length: u32, region: HostRegion, flags: MapFlags) -> Self {
        Self {
            pc,
            length,
            backing: Backing::Host(region),
            invalidation: flags.contains(MapFlags::RWX).then(|| InvalidationTable::new(length)),
            flags,
        }
    }

    #[must_use]
    pub fn io_backed(pc: u32, length: u32, ops: Box<dyn IoOps>, flags: MapFlags) -> Self {
        Self {
            pc,
            length,
            backing: Backing::Io(ops),
            invalidation: flags.contains(MapFlags::RWX).then(|| InvalidationTable::new(length)),
            flags,
        }
    }

    #[must_use]
    pub fn mirror_of(pc: u32, length: u32, target: usize, flags: MapFlags) -> Self {
        Self {
            pc,
            length,
            backing: Backing::Mirror(target),
            // A mirror has no backing of its own to invalidate; SMC
            // tracking for mirrored RWX ranges lives on the concrete entry
            // `target` ultimately resolves to.
            invalidation: None,
            flags,
        }
    }

    #[must_use]
    pub fn contains(&self, kaddr: u32) -> bool {
        kaddr >= self.pc && kaddr < self.pc.wrapping_add(self.length)
    }

    #[must_use]
    pub fn is_rwx(&self) -> bool {
        self.flags.contains(MapFlags::RWX)
    }

    fn mirror_target(&self) -> Option<usize> {
        match &self.backing {
            Backing::Mirror(target) => Some(*target),
            _ => None,
        }
    }

    pub fn io_ops_mut(&mut self) -> Option<&mut dyn IoOps> {
        match &mut self.backing {
            Backing::Io(ops) => Some(ops.as_mut()),
            _ => None,
        }
    }

    fn host_region(&self) -> Option<&HostRegion> {
        match &self.backing {
            Backing::Host(region) => Some(region),
            _ => None,
        }
    }

    fn host_region_mut(&mut self) -> Option<&mut HostRegion> {
        match &mut self.backing {
            Backing::Host(region) => Some(region),
            _ => None,
        }
    }

    #[must_use]
    pub fn invalidation(&self) -> Option<&InvalidationTable> {
        self.invalidation.as_ref()
    }

    pub fn invalidation_mut(&mut self) -> Option<&mut InvalidationTable> {
        self.invalidation.as_mut()
    }
}

/// The host-supplied map table plus mirror resolution (§4.1).
pub struct MapTable {
    entries: Vec<MemMap>,
}

impl MapTable {
    /// Validates the invariants from §3 ("map entries never overlap",
    /// "mirror chains are acyclic and terminate at a concrete backing") up
    /// front, at construction time, rather than treating a cycle as "a
    /// precondition violation, not a runtime error" the way the original
    /// C API does — the idiomatic Rust rendition of an unchecked
    /// precondition is a `Result` returned from the one place that can
    /// still check it cheaply.
    pub fn new(entries: Vec<MemMap>) -> Result<Self, MapValidationError> {
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let (a, b) = (&entries[i], &entries[j]);
                let a_end = a.pc.wrapping_add(a.length);
                let b_end = b.pc.wrapping_add(b.length);
                if a.pc < b_end && b.pc < a_end {
                    return Err(MapValidationError::Overlap {
                        first: i,
                        second: j,
                    });
                }
            }
        }

        for (i, entry) in entries.iter().enumerate() {
            let mut seen = vec![i];
            let mut cursor = entry.mirror_target();
            while let Some(next) = cursor {
                if next >= entries.len() {
                    return Err(MapValidationError::DanglingMirror {
                        entry: i,
                        target: next,
                    });
                }
                if seen.contains(&next) {
                    return Err(MapValidationError::CyclicMirror { entry: i });
                }
                seen.push(next);
                cursor = entries[next].mirror_target();
            }
        }

        Ok(Self { entries })
    }

    #[must_use]
    pub fn entries(&self) -> &[MemMap] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [MemMap] {
        &mut self.entries
    }

    /// Linear scan for the first entry whose range contains `kaddr`
    /// (§4.1: "Maps are few ... so linear scan is preferred").
    #[must_use]
    pub fn find(&self, kaddr: u32) -> Option<usize> {
        self.entries.iter().position(|e| e.contains(kaddr))
    }

    /// Walks `mirror_of` until it terminates at a concrete (host- or
    /// I/O-backed) entry, returning that entry's index.
    #[must_use]
    pub fn resolve_backing(&self, mut index: usize) -> usize {
        while let Some(target) = self.entries[index].mirror_target() {
            index = target;
        }
        index
    }

    /// Computes the host pointer offset for `kaddr` within the concrete
    /// backing entry reached by walking mirrors from `index`
    /// (`host_base + (kaddr - pc)`, §4.2).
    #[must_use]
    pub fn host_offset(&self, index: usize, kaddr: u32) -> Option<(usize, usize)> {
        let backing_index = self.resolve_backing(index);
        let backing = &self.entries[backing_index];
        backing
            .host_region()
            .map(|_| (backing_index, (kaddr - backing.pc) as usize))
    }

    /// Borrows `len` host bytes starting at `kaddr`, resolving `index`
    /// through any mirror first. Used by the compile pipeline to hash a
    /// block's source bytes for staleness checks (§4.3); returns `None` for
    /// I/O-backed or out-of-range entries, since neither can back a
    /// compiled block.
    #[must_use]
    pub fn host_bytes(&self, index: usize, kaddr: u32, len: usize) -> Option<&[u8]> {
        let (backing_index, offset) = self.host_offset(index, kaddr)?;
        let region = self.entries[backing_index].host_region()?;
        if offset + len > region.len() {
            return None;
        }
        // SAFETY: bounds-checked against `region.len()` above.
        #[allow(unsafe_code)]
        let bytes = unsafe { region.as_slice() };
        Some(&bytes[offset..offset + len])
    }

    pub fn host_region_at(&self, backing_index: usize) -> Option<&HostRegion> {
        self.entries[backing_index].host_region()
    }

    pub fn host_region_at_mut(&mut self, backing_index: usize) -> Option<&mut HostRegion> {
        self.entries[backing_index].host_region_mut()
    }

    pub fn io_ops_at_mut(&mut self, index: usize) -> Option<&mut dyn IoOps> {
        let backing_index = self.resolve_backing(index);
        self.entries[backing_index].io_ops_mut()
    }

    /// Marks the guest range `[kaddr, kaddr + len)` as written at
    /// `current_cycle`, resolving `index` through any mirror to the
    /// concrete backing entry that owns the invalidation table (§4.3). A
    /// no-op for entries with no `RWX` flag (nothing can be compiled from
    /// them in the first place).
    pub fn mark_written(&mut self, index: usize, kaddr: u32, len: usize, current_cycle: u32) {
        let backing_index = self.resolve_backing(index);
        let backing = &mut self.entries[backing_index];
        let offset = kaddr.wrapping_sub(backing.pc);
        if let Some(table) = backing.invalidation_mut() {
            table.mark_written(offset, len, current_cycle);
        }
    }

    /// Reads the write-timestamp of the page covering `kaddr` in the entry
    /// `index` resolves to, or `0` if that entry has no invalidation table
    /// (non-`RWX`, nothing could have gone stale).
    #[must_use]
    pub fn page_timestamp(&self, index: usize, kaddr: u32) -> u32 {
        let backing_index = self.resolve_backing(index);
        let backing = &self.entries[backing_index];
        let offset = kaddr.wrapping_sub(backing.pc);
        backing
            .invalidation()
            .map_or(0, |table| table.timestamp(table.page_of(offset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kunseg_strips_kseg_and_is_idempotent() {
        assert_eq!(kunseg(0x0000_1234), 0x0000_1234);
        assert_eq!(kunseg(0x7fff_ffff), 0x7fff_ffff);
        assert_eq!(kunseg(0x8010_0000), 0x0010_0000);
        assert_eq!(kunseg(0xa010_0000), 0x0010_0000);
        for addr in [0u32, 0x1234_5678, 0x8000_0000, 0xa000_0000, 0xbfff_ffff] {
            assert_eq!(kunseg(kunseg(addr)), kunseg(addr));
        }
    }

    #[test]
    fn find_map_linear_scan() {
        let region = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x1000].into_boxed_slice()).as_mut_ptr(), 0x1000) };
        let entries = vec![MemMap::host_backed(0x0000_0000, 0x1000, region, MapFlags::RWX)];
        let table = MapTable::new(entries).unwrap();
        assert_eq!(table.find(0x500), Some(0));
        assert_eq!(table.find(0x2000), None);
    }

    #[test]
    fn overlapping_entries_rejected() {
        let a = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x1000].into_boxed_slice()).as_mut_ptr(), 0x1000) };
        let b = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x1000].into_boxed_slice()).as_mut_ptr(), 0x1000) };
        let entries = vec![
            MemMap::host_backed(0x0000_0000, 0x1000, a, MapFlags::empty()),
            MemMap::host_backed(0x0000_0800, 0x1000, b, MapFlags::empty()),
        ];
        assert!(matches!(
            MapTable::new(entries),
            Err(MapValidationError::Overlap { .. })
        ));
    }

    #[test]
    fn cyclic_mirror_rejected() {
        let entries = vec![
            MemMap::mirror_of(0x0000_0000, 0x1000, 1, MapFlags::empty()),
            MemMap::mirror_of(0x1000_0000, 0x1000, 0, MapFlags::empty()),
        ];
        assert!(matches!(
            MapTable::new(entries),
            Err(MapValidationError::CyclicMirror { .. })
        ));
    }

    #[test]
    fn mirror_resolves_to_concrete_backing() {
        let region = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x1000].into_boxed_slice()).as_mut_ptr(), 0x1000) };
        let entries = vec![
            MemMap::host_backed(0x0000_0000, 0x1000, region, MapFlags::RWX),
            MemMap::mirror_of(0x0020_0000, 0x1000, 0, MapFlags::RWX),
        ];
        let table = MapTable::new(entries).unwrap();
        assert_eq!(table.resolve_backing(1), 0);
        assert_eq!(table.host_offset(1, 0x0020_0010), Some((0, 0x10)));
    }

    #[test]
    fn mark_written_through_a_mirror_lands_on_the_concrete_entry() {
        let region = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x2000].into_boxed_slice()).as_mut_ptr(), 0x2000) };
        let entries = vec![
            MemMap::host_backed(0x0000_0000, 0x2000, region, MapFlags::RWX),
            MemMap::mirror_of(0x0020_0000, 0x2000, 0, MapFlags::RWX),
        ];
        let mut table = MapTable::new(entries).unwrap();
        assert_eq!(table.page_timestamp(0, 0x0000_0010), 0);
        table.mark_written(1, 0x0020_0010, 4, 7);
        assert_eq!(table.page_timestamp(0, 0x0000_0010), 7);
        assert_eq!(table.page_timestamp(1, 0x0020_0010), 7);
    }

    #[test]
    fn host_bytes_reads_back_what_was_written() {
        let mut bytes = [0u8; 8];
        bytes[2] = 0xab;
        let region = unsafe {
            let boxed = Box::leak(Box::new(bytes));
            HostRegion::new(boxed.as_mut_ptr(), 8)
        };
        let entries = vec![MemMap::host_backed(0x0000_0000, 8, region, MapFlags::RWX)];
        let table = MapTable::new(entries).unwrap();
        assert_eq!(table.host_bytes(0, 0, 4), Some([0u8, 0, 0xab, 0].as_slice()));
        assert_eq!(table.host_bytes(0, 0, 100), None);
    }

    #[test]
    fn non_rwx_entry_has_no_invalidation_table() {
        let region = unsafe { HostRegion::new(Box::leak(vec![0u8; 0x1000].into_boxed_slice()).as_mut_ptr(), 0x1000) };
        let entries = vec![MemMap::host_backed(0x0000_0000, 0x1000, region, MapFlags::empty())];
        let mut table = MapTable::new(entries).unwrap();
        table.mark_written(0, 0x10, 4, 99);
        assert_eq!(table.page_timestamp(0, 0x10), 0);
    }
}
