use std::fmt;

use psx_recompiler_core::mem::{kunseg, MapTable};
use psx_recompiler_core::{Disassembler, Opcode, OpcodeFlags, OpcodeKind};

/// Raised when the fetch address isn't backed by readable guest memory, or
/// when a 32-bit word doesn't decode to any instruction this disassembler
/// models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Unfetchable { pc: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unfetchable { pc } => write!(f, "cannot fetch instruction word at {pc:#010x}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Caps how many instructions a single block may hold before the
/// disassembler forces a split, so a decode bug (e.g. a terminator that is
/// never recognized) cannot grow a block without bound.
const MAX_BLOCK_INSTRUCTIONS: usize = 4096;

fn fetch_word(map: &MapTable, pc: u32) -> Option<u32> {
    let kaddr = kunseg(pc);
    let index = map.find(kaddr)?;
    let bytes = map.host_bytes(index, kaddr, 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn sign_extend_16(value: u32) -> i32 {
    (value as i16) as i32
}

fn decode_one(pc: u32, raw: u32) -> Opcode {
    let op = (raw >> 26) & 0x3f;
    let rs = ((raw >> 21) & 0x1f) as u8;
    let rt = ((raw >> 16) & 0x1f) as u8;
    let rd = ((raw >> 11) & 0x1f) as u8;
    let shamt = ((raw >> 6) & 0x1f) as u8;
    let funct = raw & 0x3f;
    let imm = sign_extend_16(raw & 0xffff);
    let jump_target = raw & 0x03ff_ffff;

    let mut opcode = Opcode {
        kind: OpcodeKind::Unhandled,
        pc,
        raw,
        rs,
        rt,
        rd,
        shamt,
        imm,
        jump_target,
        flags: OpcodeFlags::empty(),
    };

    opcode.kind = match op {
        0x00 if raw == 0 => OpcodeKind::Nop,
        0x00 => match funct {
            0x00 => OpcodeKind::Sll,
            0x02 => OpcodeKind::Srl,
            0x03 => OpcodeKind::Sra,
            0x04 => OpcodeKind::Sllv,
            0x06 => OpcodeKind::Srlv,
            0x07 => OpcodeKind::Srav,
            0x08 => OpcodeKind::Jr,
            0x09 => OpcodeKind::Jalr,
            0x10 => OpcodeKind::Mfhi,
            0x11 => OpcodeKind::Mthi,
            0x12 => OpcodeKind::Mflo,
            0x13 => OpcodeKind::Mtlo,
            0x18 => OpcodeKind::Mult,
            0x19 => OpcodeKind::Multu,
            0x1a => OpcodeKind::Div,
            0x1b => OpcodeKind::Divu,
            0x21 => OpcodeKind::Addu,
            0x23 => OpcodeKind::Subu,
            0x24 => OpcodeKind::And,
            0x25 => OpcodeKind::Or,
            0x26 => OpcodeKind::Xor,
            0x27 => OpcodeKind::Nor,
            0x2a => OpcodeKind::Slt,
            0x2b => OpcodeKind::Sltu,
            _ => OpcodeKind::Unhandled,
        },
        0x01 => match rt {
            0x00 => OpcodeKind::Bltz,
            0x01 => OpcodeKind::Bgez,
            _ => OpcodeKind::Unhandled,
        },
        0x02 => OpcodeKind::J,
        0x03 => OpcodeKind::Jal,
        0x04 => OpcodeKind::Beq,
        0x05 => OpcodeKind::Bne,
        0x06 => OpcodeKind::Blez,
        0x07 => OpcodeKind::Bgtz,
        0x09 => OpcodeKind::Addiu,
        0x0a => OpcodeKind::Slti,
        0x0b => OpcodeKind::Sltiu,
        0x0c => OpcodeKind::Andi,
        0x0d => OpcodeKind::Ori,
        0x0e => OpcodeKind::Xori,
        0x0f => OpcodeKind::Lui,
        0x12 => match rs {
            0x00 => OpcodeKind::Mfc2,
            0x04 => OpcodeKind::Mtc2,
            _ => OpcodeKind::Unhandled,
        },
        0x20 => OpcodeKind::Lb,
        0x21 => OpcodeKind::Lh,
        0x22 => OpcodeKind::Lwl,
        0x23 => OpcodeKind::Lw,
        0x24 => OpcodeKind::Lbu,
        0x25 => OpcodeKind::Lhu,
        0x26 => OpcodeKind::Lwr,
        0x28 => OpcodeKind::Sb,
        0x29 => OpcodeKind::Sh,
        0x2a => OpcodeKind::Swl,
        0x2b => OpcodeKind::Sw,
        0x2e => OpcodeKind::Swr,
        0x32 => OpcodeKind::Lwc2,
        0x3a => OpcodeKind::Swc2,
        _ => OpcodeKind::Unhandled,
    };

    if is_branch_or_jump(opcode.kind) {
        opcode.flags.insert(OpcodeFlags::BLOCK_TERMINATOR | OpcodeFlags::HAS_DELAY_SLOT);
    }

    opcode
}

fn is_branch_or_jump(kind: OpcodeKind) -> bool {
    matches!(
        kind,
        OpcodeKind::J
            | OpcodeKind::Jal
            | OpcodeKind::Jr
            | OpcodeKind::Jalr
            | OpcodeKind::Beq
            | OpcodeKind::Bne
            | OpcodeKind::Blez
            | OpcodeKind::Bgtz
            | OpcodeKind::Bltz
            | OpcodeKind::Bgez
    )
}

/// Reference [`Disassembler`] for the MIPS-I subset this guest CPU
/// executes. Stateless: every call re-fetches and re-decodes from `map`,
/// which keeps it trivially safe to share across compiles of different
/// blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct MipsDisassembler;

impl Disassembler for MipsDisassembler {
    type Error = DecodeError;

    fn disassemble_block(&mut self, map: &MapTable, pc: u32) -> Result<Vec<Opcode>, Self::Error> {
        let mut opcodes = Vec::new();
        let mut cursor = pc;

        loop {
            let raw = fetch_word(map, cursor).ok_or_else(|| {
                tracing::trace!(pc = %format_args!("{cursor:#010x}"), "cannot fetch instruction word");
                DecodeError::Unfetchable { pc: cursor }
            })?;
            let opcode = decode_one(cursor, raw);
            let terminates = opcode.is_block_terminator();
            let has_delay_slot = opcode.has_delay_slot();
            opcodes.push(opcode);

            if terminates {
                if has_delay_slot {
                    // Delay slots are always inlined with their branch
                    // (§9), never left to start a new block: the slot
                    // executes unconditionally regardless of whether the
                    // branch is taken.
                    let slot_pc = cursor.wrapping_add(4);
                    let slot_raw = fetch_word(map, slot_pc).ok_or_else(|| {
                        tracing::trace!(pc = %format_args!("{slot_pc:#010x}"), "cannot fetch delay slot instruction word");
                        DecodeError::Unfetchable { pc: slot_pc }
                    })?;
                    let mut slot = decode_one(slot_pc, slot_raw);
                    slot.flags.insert(OpcodeFlags::SKIP_PC_UPDATE);
                    opcodes.push(slot);
                }
                break;
            }

            if opcodes.len() >= MAX_BLOCK_INSTRUCTIONS {
                break;
            }

            cursor = cursor.wrapping_add(4);
        }

        Ok(opcodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use psx_recompiler_core::mem::{HostRegion, MapFlags, MemMap};

    fn map_with_words(words: &[u32]) -> MapTable {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let len = bytes.len().max(4);
        bytes.resize(len, 0);
        let region = unsafe { HostRegion::new(Box::leak(bytes.into_boxed_slice()).as_mut_ptr(), len) };
        MapTable::new(vec![MemMap::host_backed(0, len as u32, region, MapFlags::RWX)]).unwrap()
    }

    #[test]
    fn decodes_a_straight_line_block_ending_in_a_branch_with_its_delay_slot() {
        // addiu $t0, $zero, 1 ; beq $t0, $zero, 0 ; addu $t1, $t0, $t0 (delay slot)
        let addiu = (0x09 << 26) | (0 << 21) | (8 << 16) | 1u32;
        let beq = (0x04 << 26) | (8 << 21) | (0 << 16) | 0u32;
        let addu = (0x00 << 26) | (8 << 21) | (8 << 16) | (9 << 11) | 0x21;
        let map = map_with_words(&[addiu, beq, addu]);

        let mut disasm = MipsDisassembler;
        let opcodes = disasm.disassemble_block(&map, 0).unwrap();

        assert_eq!(opcodes.len(), 3);
        assert_eq!(opcodes[0].kind, OpcodeKind::Addiu);
        assert_eq!(opcodes[1].kind, OpcodeKind::Beq);
        assert!(opcodes[1].is_block_terminator());
        assert_eq!(opcodes[2].kind, OpcodeKind::Addu);
        assert!(opcodes[2].flags.contains(OpcodeFlags::SKIP_PC_UPDATE));
    }

    #[test]
    fn raw_zero_word_decodes_as_nop() {
        let map = map_with_words(&[0]);
        let mut disasm = MipsDisassembler;
        let opcodes = disasm.disassemble_block(&map, 0).unwrap();
        assert_eq!(opcodes[0].kind, OpcodeKind::Nop);
    }

    #[test]
    fn terminator_with_unmapped_delay_slot_errors() {
        // A single-word map holding only `jr $ra`, with no delay slot word
        // mapped right after it.
        let jr_ra = (0x00 << 26) | (31 << 21) | 0x08u32;
        let map = map_with_words(&[jr_ra]);
        let mut disasm = MipsDisassembler;
        let result = disasm.disassemble_block(&map, 0);
        assert!(matches!(result, Err(DecodeError::Unfetchable { .. })));
    }

    proptest! {
        #[test]
        fn decode_one_never_panics_on_any_word(raw in any::<u32>()) {
            let _ = decode_one(0, raw);
        }
    }
}
