//! The `"env"` import set every emitted module expects, and the host-side
//! context ([`HostCtx`]) those imports operate on (§4.2 "RW engine", §6
//! "Coprocessor callbacks").
//!
//! None of these functions implement MIPS semantics themselves — they are
//! thin adapters onto `psx_recompiler_core::rw` and `CopOps`, the same
//! engine an interpreter-style backend would call directly. Keeping the
//! arithmetic in one place (the core crate, already tested against the
//! unaligned-load/store laws) means this backend only has to get the WASM
//! plumbing right.

use std::ptr::NonNull;

use psx_recompiler_core::cop::CopOps;
use psx_recompiler_core::mem::MapTable;
use psx_recompiler_core::regs::GuestRegisters;
use psx_recompiler_core::rw;
use wasmtime::{Caller, Engine, Linker};

/// Per-`run()`-call execution context threaded through the `wasmtime::Store`
/// a [`crate::WasmBlock`] instantiates its module into.
///
/// Holds raw pointers rather than borrows because `wasmtime::Store<T>`
/// requires `T: 'static`, and `&mut GuestRegisters`/`&mut MapTable` borrowed
/// from [`CompiledBlock::run`](psx_recompiler_core::backend::CompiledBlock::run)'s
/// arguments are not. This mirrors `psx_recompiler_core::mem::HostRegion`'s
/// raw-pointer discipline: a thin, non-owning view valid only for the
/// duration of the single call that constructs it.
pub struct HostCtx {
    regs: NonNull<GuestRegisters>,
    map: NonNull<MapTable>,
    cop_ops: NonNull<dyn CopOps>,
    /// Cycle value in effect when this block started running, used to
    /// timestamp every store's invalidation-table entry (§4.3). A block
    /// runs to completion without stopping to observe `current_cycle`
    /// mid-way, so every store within it shares one timestamp.
    current_cycle: u32,
    /// Set by an import on an unmapped access (§7 "Unmapped access"); read
    /// back by `WasmBlock::run` once the module's `run` export returns.
    pub fault: bool,
}

impl HostCtx {
    /// # Safety
    /// `regs`, `map`, and `cop_ops` must be valid for exclusive access for
    /// the entire lifetime of the returned `HostCtx`, which must not outlive
    /// the single `CompiledBlock::run` call that constructs it.
    #[must_use]
    pub unsafe fn new(regs: *mut GuestRegisters, map: *mut MapTable, cop_ops: *mut dyn CopOps, current_cycle: u32) -> Self {
        Self {
            regs: NonNull::new(regs).expect("regs pointer must not be null"),
            map: NonNull::new(map).expect("map pointer must not be null"),
            cop_ops: NonNull::new(cop_ops).expect("cop_ops pointer must not be null"),
            current_cycle,
            fault: false,
        }
    }

    fn regs_mut(&mut self) -> &mut GuestRegisters {
        // SAFETY: see `Self::new`.
        #[allow(unsafe_code)]
        unsafe {
            self.regs.as_mut()
        }
    }

    fn map_mut(&mut self) -> &mut MapTable {
        // SAFETY: see `Self::new`.
        #[allow(unsafe_code)]
        unsafe {
            self.map.as_mut()
        }
    }

    fn cop_ops_mut(&mut self) -> &mut dyn CopOps {
        // SAFETY: see `Self::new`.
        #[allow(unsafe_code)]
        unsafe {
            self.cop_ops.as_mut()
        }
    }
}

// SAFETY: a `HostCtx` is only ever touched from the single thread driving
// `WasmBlock::run`, which is the only place one is ever constructed or
// dropped; `Send` is required because `wasmtime::Store` is generic over
// `T: 'static` with no thread-affinity bound of its own.
#[allow(unsafe_code)]
unsafe impl Send for HostCtx {}

/// One `"env"` import every block module may call. The discriminant order
/// here is purely documentary (imports are matched by name, not index, when
/// `wasmtime` resolves them against a [`Linker`]) but [`crate::codegen`]
/// uses these names verbatim when emitting `call` instructions, so the two
/// must be kept in sync by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFn {
    GetGpr,
    SetGpr,
    GetHi,
    SetHi,
    GetLo,
    SetLo,
    Lb,
    Lbu,
    Lh,
    Lhu,
    Lw,
    Sb,
    Sh,
    Sw,
    Lwl,
    Lwr,
    Swl,
    Swr,
    Lwc2,
    Swc2,
    Mfc2,
    Mtc2,
}

impl HostFn {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetGpr => "get_gpr",
            Self::SetGpr => "set_gpr",
            Self::GetHi => "get_hi",
            Self::SetHi => "set_hi",
            Self::GetLo => "get_lo",
            Self::SetLo => "set_lo",
            Self::Lb => "lb",
            Self::Lbu => "lbu",
            Self::Lh => "lh",
            Self::Lhu => "lhu",
            Self::Lw => "lw",
            Self::Sb => "sb",
            Self::Sh => "sh",
            Self::Sw => "sw",
            Self::Lwl => "lwl",
            Self::Lwr => "lwr",
            Self::Swl => "swl",
            Self::Swr => "swr",
            Self::Lwc2 => "lwc2",
            Self::Swc2 => "swc2",
            Self::Mfc2 => "mfc2",
            Self::Mtc2 => "mtc2",
        }
    }
}

/// Every import in the fixed order [`crate::codegen`] relies on (not
/// load-bearing for correctness, since imports resolve by name, but useful
/// for iterating the whole set once when building the type/import sections
/// and the linker).
pub const ALL: [HostFn; 22] = [
    HostFn::GetGpr,
    HostFn::SetGpr,
    HostFn::GetHi,
    HostFn::SetHi,
    HostFn::GetLo,
    HostFn::SetLo,
    HostFn::Lb,
    HostFn::Lbu,
    HostFn::Lh,
    HostFn::Lhu,
    HostFn::Lw,
    HostFn::Sb,
    HostFn::Sh,
    HostFn::Sw,
    HostFn::Lwl,
    HostFn::Lwr,
    HostFn::Swl,
    HostFn::Swr,
    HostFn::Lwc2,
    HostFn::Swc2,
    HostFn::Mfc2,
    HostFn::Mtc2,
];

/// Wires every [`HostFn`] onto a fresh [`Linker`], ready to instantiate any
/// module [`crate::codegen::emit_module`] produces. Built once per
/// [`crate::WasmBackend`] and shared (via `Arc`) across every block it
/// compiles, since the import set never varies block to block.
pub fn build_linker(engine: &Engine) -> wasmtime::Result<Linker<HostCtx>> {
    let mut linker = Linker::new(engine);

    linker.func_wrap("env", HostFn::GetGpr.name(), |mut caller: Caller<'_, HostCtx>, idx: i32| -> i32 {
        caller.data_mut().regs_mut().gpr(idx as u8) as i32
    })?;
    linker.func_wrap("env", HostFn::SetGpr.name(), |mut caller: Caller<'_, HostCtx>, idx: i32, value: i32| {
        caller.data_mut().regs_mut().set_gpr(idx as u8, value as u32);
    })?;
    linker.func_wrap("env", HostFn::GetHi.name(), |mut caller: Caller<'_, HostCtx>| -> i32 {
        caller.data_mut().regs_mut().hi() as i32
    })?;
    linker.func_wrap("env", HostFn::SetHi.name(), |mut caller: Caller<'_, HostCtx>, value: i32| {
        caller.data_mut().regs_mut().set_hi(value as u32);
    })?;
    linker.func_wrap("env", HostFn::GetLo.name(), |mut caller: Caller<'_, HostCtx>| -> i32 {
        caller.data_mut().regs_mut().lo() as i32
    })?;
    linker.func_wrap("env", HostFn::SetLo.name(), |mut caller: Caller<'_, HostCtx>, value: i32| {
        caller.data_mut().regs_mut().set_lo(value as u32);
    })?;

    linker.func_wrap("env", HostFn::Lb.name(), |mut caller: Caller<'_, HostCtx>, addr: i32| -> i32 {
        let ctx = caller.data_mut();
        match rw::lb(ctx.map_mut(), addr as u32) {
            Ok(v) => i32::from(v),
            Err(_) => {
                ctx.fault = true;
                0
            }
        }
    })?;
    linker.func_wrap("env", HostFn::Lbu.name(), |mut caller: Caller<'_, HostCtx>, addr: i32| -> i32 {
        let ctx = caller.data_mut();
        match rw::lbu(ctx.map_mut(), addr as u32) {
            Ok(v) => i32::from(v),
            Err(_) => {
                ctx.fault = true;
                0
            }
        }
    })?;
    linker.func_wrap("env", HostFn::Lh.name(), |mut caller: Caller<'_, HostCtx>, addr: i32| -> i32 {
        let ctx = caller.data_mut();
        match rw::lh(ctx.map_mut(), addr as u32) {
            Ok(v) => i32::from(v),
            Err(_) => {
                ctx.fault = true;
                0
            }
        }
    })?;
    linker.func_wrap("env", HostFn::Lhu.name(), |mut caller: Caller<'_, HostCtx>, addr: i32| -> i32 {
        let ctx = caller.data_mut();
        match rw::lhu(ctx.map_mut(), addr as u32) {
            Ok(v) => i32::from(v),
            Err(_) => {
                ctx.fault = true;
                0
            }
        }
    })?;
    linker.func_wrap("env", HostFn::Lw.name(), |mut caller: Caller<'_, HostCtx>, addr: i32| -> i32 {
        let ctx = caller.data_mut();
        match rw::lw(ctx.map_mut(), addr as u32) {
            Ok(v) => v as i32,
            Err(_) => {
                ctx.fault = true;
                0
            }
        }
    })?;

    linker.func_wrap("env", HostFn::Sb.name(), |mut caller: Caller<'_, HostCtx>, addr: i32, value: i32| {
        let cycle = caller.data().current_cycle;
        let ctx = caller.data_mut();
        match rw::sb(ctx.map_mut(), addr as u32, value as u8) {
            Ok((index, kaddr)) => rw::mark_written(ctx.map_mut(), index, kaddr, 1, cycle),
            Err(_) => ctx.fault = true,
        }
    })?;
    linker.func_wrap("env", HostFn::Sh.name(), |mut caller: Caller<'_, HostCtx>, addr: i32, value: i32| {
        let cycle = caller.data().current_cycle;
        let ctx = caller.data_mut();
        match rw::sh(ctx.map_mut(), addr as u32, value as u16) {
            Ok((index, kaddr)) => rw::mark_written(ctx.map_mut(), index, kaddr, 2, cycle),
            Err(_) => ctx.fault = true,
        }
    })?;
    linker.func_wrap("env", HostFn::Sw.name(), |mut caller: Caller<'_, HostCtx>, addr: i32, value: i32| {
        let cycle = caller.data().current_cycle;
        let ctx = caller.data_mut();
        match rw::sw(ctx.map_mut(), addr as u32, value as u32) {
            Ok((index, kaddr)) => rw::mark_written(ctx.map_mut(), index, kaddr, 4, cycle),
            Err(_) => ctx.fault = true,
        }
    })?;

    linker.func_wrap("env", HostFn::Lwl.name(), |mut caller: Caller<'_, HostCtx>, addr: i32, rt_prior: i32| -> i32 {
        let ctx = caller.data_mut();
        match rw::lwl(ctx.map_mut(), addr as u32, rt_prior as u32) {
            Ok(v) => v as i32,
            Err(_) => {
                ctx.fault = true;
                0
            }
        }
    })?;
    linker.func_wrap("env", HostFn::Lwr.name(), |mut caller: Caller<'_, HostCtx>, addr: i32, rt_prior: i32| -> i32 {
        let ctx = caller.data_mut();
        match rw::lwr(ctx.map_mut(), addr as u32, rt_prior as u32) {
            Ok(v) => v as i32,
            Err(_) => {
                ctx.fault = true;
                0
            }
        }
    })?;
    linker.func_wrap("env", HostFn::Swl.name(), |mut caller: Caller<'_, HostCtx>, addr: i32, rt: i32| {
        let cycle = caller.data().current_cycle;
        let ctx = caller.data_mut();
        match rw::swl(ctx.map_mut(), addr as u32, rt as u32) {
            Ok((index, kaddr)) => rw::mark_written(ctx.map_mut(), index, kaddr, 4, cycle),
            Err(_) => ctx.fault = true,
        }
    })?;
    linker.func_wrap("env", HostFn::Swr.name(), |mut caller: Caller<'_, HostCtx>, addr: i32, rt: i32| {
        let cycle = caller.data().current_cycle;
        let ctx = caller.data_mut();
        match rw::swr(ctx.map_mut(), addr as u32, rt as u32) {
            Ok((index, kaddr)) => rw::mark_written(ctx.map_mut(), index, kaddr, 4, cycle),
            Err(_) => ctx.fault = true,
        }
    })?;

    // LWC2/SWC2 compose a memory access with a COP2 transfer atomically,
    // host-side, rather than round-tripping the word through the WASM
    // module (§4.2 "Coprocessor word transfers").
    linker.func_wrap("env", HostFn::Lwc2.name(), |mut caller: Caller<'_, HostCtx>, addr: i32, reg: i32| {
        let ctx = caller.data_mut();
        match rw::lw(ctx.map_mut(), addr as u32) {
            Ok(word) => ctx.cop_ops_mut().mtc(2, reg as u8, word),
            Err(_) => ctx.fault = true,
        }
    })?;
    linker.func_wrap("env", HostFn::Swc2.name(), |mut caller: Caller<'_, HostCtx>, addr: i32, reg: i32| {
        let word = caller.data_mut().cop_ops_mut().mfc(2, reg as u8);
        let cycle = caller.data().current_cycle;
        let ctx = caller.data_mut();
        match rw::sw(ctx.map_mut(), addr as u32, word) {
            Ok((index, kaddr)) => rw::mark_written(ctx.map_mut(), index, kaddr, 4, cycle),
            Err(_) => ctx.fault = true,
        }
    })?;

    linker.func_wrap("env", HostFn::Mfc2.name(), |mut caller: Caller<'_, HostCtx>, reg: i32| -> i32 {
        caller.data_mut().cop_ops_mut().mfc(2, reg as u8) as i32
    })?;
    linker.func_wrap("env", HostFn::Mtc2.name(), |mut caller: Caller<'_, HostCtx>, reg: i32, value: i32| {
        caller.data_mut().cop_ops_mut().mtc(2, reg as u8, value as u32);
    })?;

    Ok(linker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_host_fn_name_is_unique() {
        let mut names: Vec<&str> = ALL.iter().map(|f| f.name()).collect();
        names.sort_unstable();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
    }

    #[test]
    fn linker_builds_against_a_default_engine() {
        let engine = Engine::default();
        build_linker(&engine).unwrap();
    }
}
