//! Fallible-construction error type.
//!
//! The original C recompiler surfaces allocation failure as a null return
//! from whichever constructor failed. Idiomatic Rust prefers `Result`, so
//! every constructor here returns `Result<_, RecompilerError>` instead; the
//! "cascades unwind cleanly" requirement from the spec is exactly what `?`
//! and `Drop` give us for free.

use std::fmt;

/// Errors that can occur while constructing recompiler state, compiling a
/// block, or assembling a block's host code.
#[derive(thiserror::Error, Debug)]
pub enum RecompilerError {
    /// The host-supplied memory map violates an invariant from §3: entries
    /// overlap, or a mirror chain is cyclic / does not terminate at a
    /// concrete backing.
    #[error("invalid memory map: {0}")]
    InvalidMemoryMap(#[from] MapValidationError),

    /// `pc` does not resolve to any memory map entry.
    #[error("no memory map entry covers guest address {addr:#010x}")]
    UnmappedAddress { addr: u32 },

    /// The backend's code generator failed to assemble a block (its
    /// equivalent of the original's allocation-failure-during-emission
    /// path).
    #[error("backend failed to assemble block at {pc:#010x}: {source}")]
    Backend {
        pc: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The disassembler could not produce any instructions starting at
    /// `pc` (e.g. zero-length map, or a decode fault on the first word).
    #[error("disassembly failed at {pc:#010x}: {reason}")]
    Disassembly { pc: u32, reason: String },
}

/// Why a supplied memory map was rejected by [`MapTable::new`](crate::mem::MapTable::new).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapValidationError {
    Overlap { first: usize, second: usize },
    CyclicMirror { entry: usize },
    DanglingMirror { entry: usize, target: usize },
}

impl fmt::Display for MapValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlap { first, second } => {
                write!(f, "map entries {first} and {second} overlap")
            }
            Self::CyclicMirror { entry } => {
                write!(f, "map entry {entry} has a cyclic mirror chain")
            }
            Self::DanglingMirror { entry, target } => {
                write!(f, "map entry {entry} mirrors nonexistent entry {target}")
            }
        }
    }
}

impl std::error::Error for MapValidationError {}
