//! The disassembler seam (§5 "Compile pipeline").
//!
//! This crate never decodes raw guest words itself; `psx-mips-decode` is
//! this workspace's reference [`Disassembler`], covering the MIPS-I subset
//! this guest CPU executes and resolving delay slots by always inlining
//! them into the branch that owns them (§9).

use crate::mem::MapTable;
use crate::opcode::Opcode;

/// Decodes one compiled block's worth of guest instructions starting at
/// `pc`, stopping after (and including) the first block terminator's delay
/// slot.
pub trait Disassembler {
    type Error: std::error::Error + Send + Sync + 'static;

    fn disassemble_block(&mut self, map: &MapTable, pc: u32) -> Result<Vec<Opcode>, Self::Error>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Disassembler;
    use crate::mem::MapTable;
    use crate::opcode::{Opcode, OpcodeFlags, OpcodeKind};
    use std::convert::Infallible;

    /// Always decodes exactly one `Nop` at `pc`, ignoring actual memory
    /// contents. Enough to exercise the dispatcher/cache/compile pipeline
    /// without a real instruction decoder in the loop.
    #[derive(Default)]
    pub struct SingleNopDisassembler;

    impl Disassembler for SingleNopDisassembler {
        type Error = Infallible;

        fn disassemble_block(&mut self, _map: &MapTable, pc: u32) -> Result<Vec<Opcode>, Self::Error> {
            Ok(vec![Opcode {
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
            }])
        }
    }
}
