//! Per-opcode WASM emission (§5 "Compile pipeline: emit").
//!
//! Every instruction operates purely through the `"env"` imports in
//! [`crate::host`] — no WASM linear memory is ever declared. Guest GPRs,
//! HI/LO, and memory all live host-side, reached with one `call` per access.
//! This is the "no register allocation in the target" end of the space: it
//! trades the throughput a real register-caching backend would have for a
//! much smaller, more obviously correct emitter, which is what a reference
//! implementation should optimize for.
//!
//! A block's only runtime-computed control transfer is its GPR-indirect
//! target (`Jr`/`Jalr`); every other branch/jump target is a compile-time
//! constant, since the guest PC of every opcode is already known when this
//! runs.

use psx_recompiler_core::opcode::{Opcode, OpcodeKind};
use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection, ImportSection, Instruction, Module,
    TypeSection, ValType,
};

use crate::host::{HostFn, ALL};

/// Local slot holding the block's computed successor PC, returned at the
/// function's end.
const LOCAL_NEXT_PC: u32 = 0;
/// Scratch i32 locals, reused across opcodes (e.g. `Div`'s dividend and
/// divisor) since this emitter never needs two live at once across opcode
/// boundaries.
const LOCAL_TMP_A: u32 = 1;
const LOCAL_TMP_B: u32 = 2;
/// Widened 64-bit scratch for `Mult`/`Multu`'s double-word product.
const LOCAL_WIDE: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq)]
enum HostSig {
    NullaryI32,
    UnaryI32ToI32,
    UnaryI32ToVoid,
    BinaryI32ToI32,
    BinaryI32ToVoid,
}

fn sig_of(f: HostFn) -> HostSig {
    match f {
        HostFn::GetHi | HostFn::GetLo => HostSig::NullaryI32,
        HostFn::GetGpr | HostFn::Lb | HostFn::Lbu | HostFn::Lh | HostFn::Lhu | HostFn::Lw | HostFn::Mfc2 => HostSig::UnaryI32ToI32,
        HostFn::SetHi | HostFn::SetLo => HostSig::UnaryI32ToVoid,
        HostFn::Lwl | HostFn::Lwr => HostSig::BinaryI32ToI32,
        HostFn::SetGpr | HostFn::Sb | HostFn::Sh | HostFn::Sw | HostFn::Swl | HostFn::Swr | HostFn::Lwc2 | HostFn::Swc2 | HostFn::Mtc2 => {
            HostSig::BinaryI32ToVoid
        }
    }
}

/// Builds the type section's five distinct function signatures and returns
/// their indices, alongside the per-`HostFn` type index used for imports.
fn build_types() -> (TypeSection, [u32; 5], [u32; 22]) {
    let mut types = TypeSection::new();
    types.function([], [ValType::I32]); // 0: NullaryI32, also the block entry's own type
    types.function([ValType::I32], [ValType::I32]); // 1: UnaryI32ToI32
    types.function([ValType::I32], []); // 2: UnaryI32ToVoid
    types.function([ValType::I32, ValType::I32], [ValType::I32]); // 3: BinaryI32ToI32
    types.function([ValType::I32, ValType::I32], []); // 4: BinaryI32ToVoid

    let type_indices = [0, 1, 2, 3, 4];
    let mut import_types = [0u32; 22];
    for (i, f) in ALL.iter().enumerate() {
        import_types[i] = match sig_of(*f) {
            HostSig::NullaryI32 => 0,
            HostSig::UnaryI32ToI32 => 1,
            HostSig::UnaryI32ToVoid => 2,
            HostSig::BinaryI32ToI32 => 3,
            HostSig::BinaryI32ToVoid => 4,
        };
    }
    (types, type_indices, import_types)
}

fn host_fn_index(f: HostFn) -> u32 {
    ALL.iter().position(|candidate| *candidate == f).expect("every HostFn is listed in ALL") as u32
}

fn call(f: HostFn) -> Instruction<'static> {
    Instruction::Call(host_fn_index(f))
}

/// Sign-extends MIPS `andi`/`ori`/`xori`'s immediate field back to its raw
/// zero-extended 16 bits: [`Opcode::imm`] stores it sign-extended for the
/// arithmetic/load/store encodings that need that, but these three logical
/// ops treat the same field as unsigned (§3 "Opcode").
fn zero_extended_imm(op: &Opcode) -> i32 {
    i32::from(op.imm as u16)
}

/// Address computation shared by every load/store: `rs + sign_extend(imm)`.
/// Leaves the computed address on the stack.
fn push_effective_address(f: &mut Function, op: &Opcode) {
    f.instructions().instruction(&Instruction::I32Const(i32::from(op.rs)));
    f.instructions().instruction(&call(HostFn::GetGpr));
    f.instructions().instruction(&Instruction::I32Const(op.imm));
    f.instructions().instruction(&Instruction::I32Add);
}

fn push_gpr(f: &mut Function, index: u8) {
    f.instructions().instruction(&Instruction::I32Const(i32::from(index)));
    f.instructions().instruction(&call(HostFn::GetGpr));
}

fn set_gpr_from_stack_top(f: &mut Function, index: u8) {
    // `set_gpr(idx, value)` expects `idx` pushed before `value`; callers of
    // this helper have already left `value` on top of the stack, so swap by
    // stashing it in a scratch local while `idx` is pushed underneath it.
    f.instructions().instruction(&Instruction::LocalSet(LOCAL_TMP_A));
    f.instructions().instruction(&Instruction::I32Const(i32::from(index)));
    f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_A));
    f.instructions().instruction(&call(HostFn::SetGpr));
}

fn emit_branch_family(f: &mut Function, op: &Opcode, condition: impl FnOnce(&mut Function)) {
    let branch_target = op.pc.wrapping_add(4).wrapping_add((op.imm as u32) << 2) as i32;
    let fallthrough_target = op.pc.wrapping_add(8) as i32;
    f.instructions().instruction(&Instruction::I32Const(branch_target));
    f.instructions().instruction(&Instruction::I32Const(fallthrough_target));
    condition(f);
    f.instructions().instruction(&Instruction::Select);
    f.instructions().instruction(&Instruction::LocalSet(LOCAL_NEXT_PC));
}

fn emit_opcode(f: &mut Function, op: &Opcode) {
    match op.kind {
        OpcodeKind::Nop | OpcodeKind::Unhandled => {}

        // Register-register ALU.
        OpcodeKind::Addu | OpcodeKind::Subu | OpcodeKind::And | OpcodeKind::Or | OpcodeKind::Xor | OpcodeKind::Nor => {
            push_gpr(f, op.rs);
            push_gpr(f, op.rt);
            f.instructions().instruction(&match op.kind {
                OpcodeKind::Addu => Instruction::I32Add,
                OpcodeKind::Subu => Instruction::I32Sub,
                OpcodeKind::And => Instruction::I32And,
                OpcodeKind::Or => Instruction::I32Or,
                OpcodeKind::Xor => Instruction::I32Xor,
                OpcodeKind::Nor => Instruction::I32Or,
                _ => unreachable!(),
            });
            if op.kind == OpcodeKind::Nor {
                f.instructions().instruction(&Instruction::I32Const(-1));
                f.instructions().instruction(&Instruction::I32Xor);
            }
            set_gpr_from_stack_top(f, op.rd);
        }
        OpcodeKind::Slt | OpcodeKind::Sltu => {
            push_gpr(f, op.rs);
            push_gpr(f, op.rt);
            f.instructions().instruction(&if op.kind == OpcodeKind::Slt {
                Instruction::I32LtS
            } else {
                Instruction::I32LtU
            });
            set_gpr_from_stack_top(f, op.rd);
        }
        OpcodeKind::Sllv | OpcodeKind::Srlv | OpcodeKind::Srav => {
            push_gpr(f, op.rt);
            push_gpr(f, op.rs);
            f.instructions().instruction(&match op.kind {
                OpcodeKind::Sllv => Instruction::I32Shl,
                OpcodeKind::Srlv => Instruction::I32ShrU,
                OpcodeKind::Srav => Instruction::I32ShrS,
                _ => unreachable!(),
            });
            set_gpr_from_stack_top(f, op.rd);
        }

        // Register-immediate ALU.
        OpcodeKind::Addiu => {
            push_gpr(f, op.rs);
            f.instructions().instruction(&Instruction::I32Const(op.imm));
            f.instructions().instruction(&Instruction::I32Add);
            set_gpr_from_stack_top(f, op.rt);
        }
        OpcodeKind::Andi | OpcodeKind::Ori | OpcodeKind::Xori => {
            push_gpr(f, op.rs);
            f.instructions().instruction(&Instruction::I32Const(zero_extended_imm(op)));
            f.instructions().instruction(&match op.kind {
                OpcodeKind::Andi => Instruction::I32And,
                OpcodeKind::Ori => Instruction::I32Or,
                OpcodeKind::Xori => Instruction::I32Xor,
                _ => unreachable!(),
            });
            set_gpr_from_stack_top(f, op.rt);
        }
        OpcodeKind::Slti | OpcodeKind::Sltiu => {
            push_gpr(f, op.rs);
            f.instructions().instruction(&Instruction::I32Const(op.imm));
            f.instructions().instruction(&if op.kind == OpcodeKind::Slti {
                Instruction::I32LtS
            } else {
                Instruction::I32LtU
            });
            set_gpr_from_stack_top(f, op.rt);
        }
        OpcodeKind::Lui => {
            let value = (op.imm as u32) << 16;
            f.instructions().instruction(&Instruction::I32Const(value as i32));
            set_gpr_from_stack_top(f, op.rt);
        }
        OpcodeKind::Sll | OpcodeKind::Srl | OpcodeKind::Sra => {
            push_gpr(f, op.rt);
            f.instructions().instruction(&Instruction::I32Const(i32::from(op.shamt)));
            f.instructions().instruction(&match op.kind {
                OpcodeKind::Sll => Instruction::I32Shl,
                OpcodeKind::Srl => Instruction::I32ShrU,
                OpcodeKind::Sra => Instruction::I32ShrS,
                _ => unreachable!(),
            });
            set_gpr_from_stack_top(f, op.rd);
        }

        // Multiply/divide and HI/LO.
        OpcodeKind::Mult | OpcodeKind::Multu => {
            push_gpr(f, op.rs);
            f.instructions().instruction(&if op.kind == OpcodeKind::Mult {
                Instruction::I64ExtendI32S
            } else {
                Instruction::I64ExtendI32U
            });
            push_gpr(f, op.rt);
            f.instructions().instruction(&if op.kind == OpcodeKind::Mult {
                Instruction::I64ExtendI32S
            } else {
                Instruction::I64ExtendI32U
            });
            f.instructions().instruction(&Instruction::I64Mul);
            f.instructions().instruction(&Instruction::LocalSet(LOCAL_WIDE));

            f.instructions().instruction(&Instruction::LocalGet(LOCAL_WIDE));
            f.instructions().instruction(&Instruction::I32WrapI64);
            f.instructions().instruction(&call(HostFn::SetLo));

            f.instructions().instruction(&Instruction::LocalGet(LOCAL_WIDE));
            f.instructions().instruction(&Instruction::I64Const(32));
            f.instructions().instruction(&Instruction::I64ShrU);
            f.instructions().instruction(&Instruction::I32WrapI64);
            f.instructions().instruction(&call(HostFn::SetHi));
        }
        OpcodeKind::Div => emit_div(f, op, true),
        OpcodeKind::Divu => emit_div(f, op, false),
        OpcodeKind::Mfhi => {
            f.instructions().instruction(&call(HostFn::GetHi));
            set_gpr_from_stack_top(f, op.rd);
        }
        OpcodeKind::Mflo => {
            f.instructions().instruction(&call(HostFn::GetLo));
            set_gpr_from_stack_top(f, op.rd);
        }
        OpcodeKind::Mthi => {
            push_gpr(f, op.rs);
            f.instructions().instruction(&call(HostFn::SetHi));
        }
        OpcodeKind::Mtlo => {
            push_gpr(f, op.rs);
            f.instructions().instruction(&call(HostFn::SetLo));
        }

        // Control flow. Target computation always happens on the
        // terminator itself, before its (already inlined) delay slot.
        OpcodeKind::J => {
            let target = (op.pc.wrapping_add(4) & 0xf000_0000) | (op.jump_target << 2);
            f.instructions().instruction(&Instruction::I32Const(target as i32));
            f.instructions().instruction(&Instruction::LocalSet(LOCAL_NEXT_PC));
        }
        OpcodeKind::Jal => {
            let target = (op.pc.wrapping_add(4) & 0xf000_0000) | (op.jump_target << 2);
            f.instructions().instruction(&Instruction::I32Const(target as i32));
            f.instructions().instruction(&Instruction::LocalSet(LOCAL_NEXT_PC));
            f.instructions().instruction(&Instruction::I32Const(op.pc.wrapping_add(8) as i32));
            set_gpr_from_stack_top(f, 31);
        }
        OpcodeKind::Jr => {
            push_gpr(f, op.rs);
            f.instructions().instruction(&Instruction::LocalSet(LOCAL_NEXT_PC));
        }
        OpcodeKind::Jalr => {
            push_gpr(f, op.rs);
            f.instructions().instruction(&Instruction::LocalSet(LOCAL_NEXT_PC));
            f.instructions().instruction(&Instruction::I32Const(op.pc.wrapping_add(8) as i32));
            set_gpr_from_stack_top(f, op.rd);
        }
        OpcodeKind::Beq => emit_branch_family(f, op, |f| {
            push_gpr(f, op.rs);
            push_gpr(f, op.rt);
            f.instructions().instruction(&Instruction::I32Eq);
        }),
        OpcodeKind::Bne => emit_branch_family(f, op, |f| {
            push_gpr(f, op.rs);
            push_gpr(f, op.rt);
            f.instructions().instruction(&Instruction::I32Ne);
        }),
        OpcodeKind::Blez => emit_branch_family(f, op, |f| {
            push_gpr(f, op.rs);
            f.instructions().instruction(&Instruction::I32Const(0));
            f.instructions().instruction(&Instruction::I32LeS);
        }),
        OpcodeKind::Bgtz => emit_branch_family(f, op, |f| {
            push_gpr(f, op.rs);
            f.instructions().instruction(&Instruction::I32Const(0));
            f.instructions().instruction(&Instruction::I32GtS);
        }),
        OpcodeKind::Bltz => emit_branch_family(f, op, |f| {
            push_gpr(f, op.rs);
            f.instructions().instruction(&Instruction::I32Const(0));
            f.instructions().instruction(&Instruction::I32LtS);
        }),
        OpcodeKind::Bgez => emit_branch_family(f, op, |f| {
            push_gpr(f, op.rs);
            f.instructions().instruction(&Instruction::I32Const(0));
            f.instructions().instruction(&Instruction::I32GeS);
        }),

        // Loads.
        OpcodeKind::Lb | OpcodeKind::Lbu | OpcodeKind::Lh | OpcodeKind::Lhu | OpcodeKind::Lw => {
            f.instructions().instruction(&Instruction::I32Const(i32::from(op.rt)));
            push_effective_address(f, op);
            f.instructions().instruction(&call(match op.kind {
                OpcodeKind::Lb => HostFn::Lb,
                OpcodeKind::Lbu => HostFn::Lbu,
                OpcodeKind::Lh => HostFn::Lh,
                OpcodeKind::Lhu => HostFn::Lhu,
                OpcodeKind::Lw => HostFn::Lw,
                _ => unreachable!(),
            }));
            f.instructions().instruction(&call(HostFn::SetGpr));
        }
        OpcodeKind::Lwl | OpcodeKind::Lwr => {
            f.instructions().instruction(&Instruction::I32Const(i32::from(op.rt)));
            push_effective_address(f, op);
            push_gpr(f, op.rt);
            f.instructions().instruction(&call(if op.kind == OpcodeKind::Lwl { HostFn::Lwl } else { HostFn::Lwr }));
            f.instructions().instruction(&call(HostFn::SetGpr));
        }

        // Stores.
        OpcodeKind::Sb | OpcodeKind::Sh | OpcodeKind::Sw => {
            push_effective_address(f, op);
            push_gpr(f, op.rt);
            f.instructions().instruction(&call(match op.kind {
                OpcodeKind::Sb => HostFn::Sb,
                OpcodeKind::Sh => HostFn::Sh,
                OpcodeKind::Sw => HostFn::Sw,
                _ => unreachable!(),
            }));
        }
        OpcodeKind::Swl | OpcodeKind::Swr => {
            push_effective_address(f, op);
            push_gpr(f, op.rt);
            f.instructions().instruction(&call(if op.kind == OpcodeKind::Swl { HostFn::Swl } else { HostFn::Swr }));
        }

        // Coprocessor 2.
        OpcodeKind::Lwc2 => {
            push_effective_address(f, op);
            f.instructions().instruction(&Instruction::I32Const(i32::from(op.rt)));
            f.instructions().instruction(&call(HostFn::Lwc2));
        }
        OpcodeKind::Swc2 => {
            push_effective_address(f, op);
            f.instructions().instruction(&Instruction::I32Const(i32::from(op.rt)));
            f.instructions().instruction(&call(HostFn::Swc2));
        }
        OpcodeKind::Mfc2 => {
            f.instructions().instruction(&Instruction::I32Const(i32::from(op.rt)));
            f.instructions().instruction(&Instruction::I32Const(i32::from(op.rd)));
            f.instructions().instruction(&call(HostFn::Mfc2));
            f.instructions().instruction(&call(HostFn::SetGpr));
        }
        OpcodeKind::Mtc2 => {
            f.instructions().instruction(&Instruction::I32Const(i32::from(op.rd)));
            push_gpr(f, op.rt);
            f.instructions().instruction(&call(HostFn::Mtc2));
        }
    }
}

/// `Div`/`Divu`: the MIPS-I R3000 defines both the zero-divisor case and
/// (for `Div`) the `i32::MIN / -1` overflow case, neither of which WASM's
/// `div_s`/`div_u` tolerate (the former traps, the latter is UB at the ISA
/// level WASM has no obligation to match). Both are guarded explicitly so
/// the emitted code never traps for a condition the guest ISA defines.
fn emit_div(f: &mut Function, op: &Opcode, signed: bool) {
    push_gpr(f, op.rs);
    f.instructions().instruction(&Instruction::LocalSet(LOCAL_TMP_A));
    push_gpr(f, op.rt);
    f.instructions().instruction(&Instruction::LocalSet(LOCAL_TMP_B));

    f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_B));
    f.instructions().instruction(&Instruction::I32Eqz);
    f.instructions().instruction(&Instruction::If(BlockType::Empty));
    {
        if signed {
            f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_A));
            f.instructions().instruction(&Instruction::I32Const(0));
            f.instructions().instruction(&Instruction::I32LtS);
            f.instructions().instruction(&Instruction::If(BlockType::Result(ValType::I32)));
            f.instructions().instruction(&Instruction::I32Const(1));
            f.instructions().instruction(&Instruction::Else);
            f.instructions().instruction(&Instruction::I32Const(-1));
            f.instructions().instruction(&Instruction::End);
            f.instructions().instruction(&call(HostFn::SetLo));
        } else {
            f.instructions().instruction(&Instruction::I32Const(-1)); // 0xffff_ffff
            f.instructions().instruction(&call(HostFn::SetLo));
        }
        f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_A));
        f.instructions().instruction(&call(HostFn::SetHi));
    }
    f.instructions().instruction(&Instruction::Else);
    {
        if signed {
            f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_A));
            f.instructions().instruction(&Instruction::I32Const(i32::MIN));
            f.instructions().instruction(&Instruction::I32Eq);
            f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_B));
            f.instructions().instruction(&Instruction::I32Const(-1));
            f.instructions().instruction(&Instruction::I32Eq);
            f.instructions().instruction(&Instruction::I32And);
            f.instructions().instruction(&Instruction::If(BlockType::Empty));
            {
                f.instructions().instruction(&Instruction::I32Const(i32::MIN));
                f.instructions().instruction(&call(HostFn::SetLo));
                f.instructions().instruction(&Instruction::I32Const(0));
                f.instructions().instruction(&call(HostFn::SetHi));
            }
            f.instructions().instruction(&Instruction::Else);
            {
                f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_A));
                f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_B));
                f.instructions().instruction(&Instruction::I32DivS);
                f.instructions().instruction(&call(HostFn::SetLo));
                f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_A));
                f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_B));
                f.instructions().instruction(&Instruction::I32RemS);
                f.instructions().instruction(&call(HostFn::SetHi));
            }
            f.instructions().instruction(&Instruction::End);
        } else {
            f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_A));
            f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_B));
            f.instructions().instruction(&Instruction::I32DivU);
            f.instructions().instruction(&call(HostFn::SetLo));
            f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_A));
            f.instructions().instruction(&Instruction::LocalGet(LOCAL_TMP_B));
            f.instructions().instruction(&Instruction::I32RemU);
            f.instructions().instruction(&call(HostFn::SetHi));
        }
    }
    f.instructions().instruction(&Instruction::End);
}

/// Assembles one block's worth of opcodes into a complete WASM module with
/// a single exported `run() -> i32` function returning the guest PC
/// execution should resume at.
#[must_use]
pub fn emit_module(pc: u32, opcodes: &[Opcode]) -> Vec<u8> {
    let (types, _type_indices, import_types) = build_types();

    let mut imports = ImportSection::new();
    for (i, host_fn) in ALL.iter().enumerate() {
        imports.import("env", host_fn.name(), EntityType::Function(import_types[i]));
    }

    let mut functions = FunctionSection::new();
    functions.function(0); // run: () -> i32, same signature as NullaryI32 imports

    let mut exports = ExportSection::new();
    let run_func_index = ALL.len() as u32;
    exports.export("run", ExportKind::Func, run_func_index);

    let locals = vec![(1, ValType::I32), (1, ValType::I32), (1, ValType::I32), (1, ValType::I64)];
    let mut f = Function::new(locals);

    let default_next_pc = opcodes.last().map_or(pc, |op| op.pc.wrapping_add(4));
    f.instructions().instruction(&Instruction::I32Const(default_next_pc as i32));
    f.instructions().instruction(&Instruction::LocalSet(LOCAL_NEXT_PC));

    for op in opcodes {
        emit_opcode(&mut f, op);
    }

    f.instructions().instruction(&Instruction::LocalGet(LOCAL_NEXT_PC));
    f.instructions().instruction(&Instruction::End);

    let mut codes = CodeSection::new();
    codes.function(&f);

    let mut module = Module::new();
    module.section(&types);
    module.section(&imports);
    module.section(&functions);
    module.section(&exports);
    module.section(&codes);
    module.finish()
}
