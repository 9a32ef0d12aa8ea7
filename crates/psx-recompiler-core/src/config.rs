//! Host-construction tunables (§10 "Ambient stack: configuration").

use crate::opcode::OpcodeKind;

/// Per-opcode cycle cost override, applied on top of [`crate::cycles::base_cost`].
pub type CycleCostOverride = fn(OpcodeKind) -> Option<u32>;

/// Tunables a host picks when constructing a [`crate::state::RecompilerState`].
/// Every field has a sensible default; hosts override only what they need.
#[derive(Clone)]
pub struct RecompilerConfig {
    /// Initial capacity reserved in the block cache's PC-keyed map, to
    /// avoid reallocation churn during the first few seconds of execution.
    pub initial_block_cache_capacity: usize,
    /// Upper bound on cycles a single `execute` call is allowed to run
    /// before returning control to the host, even absent a fault.
    pub default_cycle_budget: u32,
    /// Optional override consulted before falling back to
    /// [`crate::cycles::base_cost`]; lets a host model a different target
    /// machine's timing without forking the cost table.
    pub cycle_cost_override: Option<CycleCostOverride>,
}

impl Default for RecompilerConfig {
    fn default() -> Self {
        Self {
            initial_block_cache_capacity: 4096,
            default_cycle_budget: 33_868_800 / 60, // one PAL/NTSC video frame's worth of cycles
            cycle_cost_override: None,
        }
    }
}

impl RecompilerConfig {
    /// Resolves the cost of `kind`, consulting [`Self::cycle_cost_override`]
    /// first and falling back to [`crate::cycles::base_cost`].
    #[must_use]
    pub fn cost_of(&self, kind: OpcodeKind) -> u32 {
        self.cycle_cost_override
            .and_then(|f| f(kind))
            .unwrap_or_else(|| crate::cycles::base_cost(kind))
    }
}
