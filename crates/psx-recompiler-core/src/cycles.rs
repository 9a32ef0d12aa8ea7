//! Per-opcode cycle cost table (§4.3 "Cycle accounting").
//!
//! The dispatcher advances `current_cycle` by each executed opcode's cost as
//! it walks a block, so invalidation timestamps and the cycle budget are
//! expressed in the same unit. Costs are a flat per-`OpcodeKind` table rather
//! than e.g. a pipeline model: the spec only requires monotonic, comparable
//! accounting, not cycle-exact timing.

use crate::opcode::OpcodeKind;

/// Default cost, in cycles, of executing one instance of `kind`. Multiply
/// and divide are the only opcodes costed above the common case; everything
/// else (including loads/stores, whose stall behavior this crate does not
/// model) is a flat single cycle.
#[must_use]
pub fn base_cost(kind: OpcodeKind) -> u32 {
    match kind {
        OpcodeKind::Mult | OpcodeKind::Multu => 7,
        OpcodeKind::Div | OpcodeKind::Divu => 36,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn division_costs_more_than_a_nop() {
        assert!(base_cost(OpcodeKind::Div) > base_cost(OpcodeKind::Nop));
    }
}
