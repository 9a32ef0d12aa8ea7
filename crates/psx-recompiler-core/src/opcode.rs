//! Decoded-instruction representation shared between the compile pipeline,
//! the disassembler (`psx-mips-decode`), and any host codegen backend (§3
//! "Opcode", §5 "Compile pipeline").
//!
//! This crate owns the *shape* of a decoded instruction; it does not decode
//! raw 32-bit words itself (that is the disassembler's job).

bitflags::bitflags! {
    /// Per-opcode metadata the compile pipeline needs that isn't part of the
    /// instruction's own fields (§5 "Emit").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpcodeFlags: u8 {
        /// This opcode is a branch/jump's delay slot and must not receive
        /// its own PC update when inlined into the branch's emit (§5
        /// "Delay slots are always inlined with their branch").
        const SKIP_PC_UPDATE = 1 << 0;
        /// This opcode terminates the block (branch, jump, syscall/break).
        const BLOCK_TERMINATOR = 1 << 1;
        /// This opcode has an associated delay slot that must be fetched
        /// and inlined before the block may terminate on it.
        const HAS_DELAY_SLOT = 1 << 2;
    }
}

/// The operation a decoded [`Opcode`] performs. Deliberately flat rather
/// than grouped by MIPS instruction format: the compile pipeline dispatches
/// on this directly and a flat enum keeps that `match` a single level deep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OpcodeKind {
    Nop,

    // Arithmetic / logic, register-register.
    Addu,
    Subu,
    And,
    Or,
    Xor,
    Nor,
    Slt,
    Sltu,
    Sllv,
    Srlv,
    Srav,

    // Arithmetic / logic, register-immediate.
    Addiu,
    Andi,
    Ori,
    Xori,
    Slti,
    Sltiu,
    Lui,
    Sll,
    Srl,
    Sra,

    // Multiply/divide and the HI/LO shadow registers.
    Mult,
    Multu,
    Div,
    Divu,
    Mfhi,
    Mflo,
    Mthi,
    Mtlo,

    // Control flow.
    J,
    Jal,
    Jr,
    Jalr,
    Beq,
    Bne,
    Blez,
    Bgtz,
    Bltz,
    Bgez,

    // Loads.
    Lb,
    Lbu,
    Lh,
    Lhu,
    Lw,
    Lwl,
    Lwr,

    // Stores.
    Sb,
    Sh,
    Sw,
    Swl,
    Swr,

    // Coprocessor 2 (GTE) data transfers; semantics are delegated to
    // `CopOps` (§6 "Hardware / IO callbacks").
    Lwc2,
    Swc2,
    Mfc2,
    Mtc2,

    /// An encoding the disassembler recognized but declined to model in
    /// detail (privileged/syscall-class instructions); the RW engine and
    /// dispatcher treat it as a block terminator with no further effect.
    Unhandled,
}

/// A single decoded MIPS-I instruction (§3 "Opcode").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub kind: OpcodeKind,
    /// Guest virtual address this instruction was fetched from.
    pub pc: u32,
    pub raw: u32,
    pub rs: u8,
    pub rt: u8,
    pub rd: u8,
    pub shamt: u8,
    /// Sign-extended 16-bit immediate (branch/arithmetic/load/store
    /// encodings all store it pre-extended; callers needing the raw
    /// unsigned 16 bits can re-derive it via `imm as u16`).
    pub imm: i32,
    /// 26-bit jump target field, valid only for `J`/`Jal`.
    pub jump_target: u32,
    pub flags: OpcodeFlags,
}

impl Opcode {
    #[must_use]
    pub fn is_block_terminator(&self) -> bool {
        self.flags.contains(OpcodeFlags::BLOCK_TERMINATOR)
    }

    #[must_use]
    pub fn has_delay_slot(&self) -> bool {
        self.flags.contains(OpcodeFlags::HAS_DELAY_SLOT)
    }
}

/// What the compile pipeline should do after emitting one opcode (§5
/// "Emit"). Most opcodes fall through to the next; branches and jumps
/// request a different continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Continue emitting the next sequential opcode.
    Continue,
    /// This opcode's delay slot was just emitted inline; the block ends
    /// here and execution resumes at `next_pc` (already resolved to its
    /// branch-taken or branch-not-taken target).
    EndBlock { next_pc: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_flag_round_trips() {
        let mut op = Opcode {
            kind: OpcodeKind::Beq,
            pc: 0x1000,
            raw: 0,
            rs: 1,
            rt: 2,
            rd: 0,
            shamt: 0,
            imm: 4,
            jump_target: 0,
            flags: OpcodeFlags::empty(),
        };
        assert!(!op.is_block_terminator());
        op.flags.insert(OpcodeFlags::BLOCK_TERMINATOR | OpcodeFlags::HAS_DELAY_SLOT);
        assert!(op.is_block_terminator());
        assert!(op.has_delay_slot());
    }
}
