use std::fmt::{
    Display,
    Formatter,
};

use index_vec::IndexVec;
use iter_tools::Itertools;
use tracing::{
    debug,
    info,
};

pub use live_range::{
    LiveRange,
    LiveRangeId,
    RangeOwner,
    UseInterval,
    MAX_POSITION,
};
pub use liveness::Liveness;
pub use numbering::Numbering;

use crate::codegen::{
    machine::{
        FlowGraph,
        InstrId,
        PhysicalRegister,
        RegisterKind,
        TargetMachine,
        Vreg,
    },
    register_allocator::{
        numbering::ReachingDefs,
        spill::SpillSlots,
    },
};

mod builder;
mod linear_scan;
pub mod live_range;
pub mod liveness;
pub mod numbering;
mod resolve;
mod spill;
#[cfg(test)]
mod tests;

/// First position at which a parallel move may be inserted.
pub const NORMAL_ENTRY_POS: u32 = 2;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AllocatorConfig {
    /// Spilling is not allowed. Running out of registers fails with
    /// [`AllocationError::NeedsFallback`].
    pub intrinsic_mode: bool,
    /// Rotates the order in which registers are tried.
    pub register_allocation_bias: usize,
    /// Spill slots at the bottom of the CPU spill area holding catch entry state.
    pub reserved_catch_slots: usize,
}

impl AllocatorConfig {
    pub const fn default() -> Self {
        Self {
            intrinsic_mode: false,
            register_allocation_bias: 0,
            reserved_catch_slots: 0,
        }
    }

    pub const fn intrinsic() -> Self {
        Self {
            intrinsic_mode: true,
            ..Self::default()
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// A range could not stay in a register while compiling an intrinsic.
    /// The caller has to compile the function without the intrinsic.
    NeedsFallback { vreg: Option<Vreg>, position: u32 },
}

impl Display for AllocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NeedsFallback {
                vreg: Some(vreg),
                position,
            } => write!(f, "Ran out of registers for {vreg} at position {position} in intrinsic mode"),
            Self::NeedsFallback { vreg: None, position } => {
                write!(f, "Ran out of registers for a temporary at position {position} in intrinsic mode")
            }
        }
    }
}

impl std::error::Error for AllocationError {}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationSummary {
    pub cpu_spill_slot_count: usize,
    /// In double-slot units.
    pub fpu_spill_slot_count: usize,
    /// Words of spill area: CPU slots first, then FPU slots.
    pub spill_slot_count: usize,
}

/// Occupancy of one register file during an allocation pass.
#[derive(Debug, Clone)]
pub(crate) struct RegisterFile {
    pub kind: RegisterKind,
    /// Ranges currently holding each register, in allocation order.
    pub registers: Vec<Vec<LiveRangeId>>,
    pub blocked: Vec<bool>,
}

impl RegisterFile {
    fn new<TM: TargetMachine>(kind: RegisterKind) -> Self {
        let blocked: Vec<bool> = match kind {
            RegisterKind::Cpu => TM::Reg::all().iter().map(|reg| reg.is_blocked()).collect(),
            RegisterKind::Fpu => TM::FpuReg::all().iter().map(|reg| reg.is_blocked()).collect(),
        };
        Self {
            kind,
            registers: vec![Vec::new(); blocked.len()],
            blocked,
        }
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }
}

/// Linear scan register allocator working on SSA live ranges.
///
/// Allocation rewrites every location slot of the graph to a register, a
/// stack slot or a constant and inserts the parallel moves connecting split
/// ranges.
pub struct FlowGraphAllocator<'a, TM: TargetMachine> {
    graph: &'a mut FlowGraph<TM>,
    config: AllocatorConfig,
    liveness: Liveness,
    numbering: Numbering,
    reaching_defs: ReachingDefs,
    ranges: IndexVec<LiveRangeId, LiveRange<TM>>,
    /// Parent range of each virtual register.
    value_ranges: IndexVec<Vreg, Option<LiveRangeId>>,
    /// Instructions that can call, in decreasing position order.
    safepoints: Vec<InstrId>,
    cpu_blocking_ranges: Vec<Option<LiveRangeId>>,
    fpu_blocking_ranges: Vec<Option<LiveRangeId>>,
    /// Sorted by decreasing start, so the next range to allocate is last.
    unallocated_cpu: Vec<LiveRangeId>,
    unallocated_fpu: Vec<LiveRangeId>,
    unallocated: Vec<LiveRangeId>,
    register_file: RegisterFile,
    spill_slots: SpillSlots,
    cpu_spill_slot_count: usize,
    /// Parents that received a spill slot.
    spilled: Vec<LiveRangeId>,
}

impl<'a, TM: TargetMachine> FlowGraphAllocator<'a, TM> {
    pub fn new(graph: &'a mut FlowGraph<TM>, config: AllocatorConfig) -> Self {
        Self {
            graph,
            config,
            liveness: Liveness::default(),
            numbering: Numbering::default(),
            reaching_defs: ReachingDefs::default(),
            ranges: IndexVec::new(),
            value_ranges: IndexVec::new(),
            safepoints: Vec::new(),
            cpu_blocking_ranges: vec![None; TM::Reg::count()],
            fpu_blocking_ranges: vec![None; TM::FpuReg::count()],
            unallocated_cpu: Vec::new(),
            unallocated_fpu: Vec::new(),
            unallocated: Vec::new(),
            register_file: RegisterFile::new::<TM>(RegisterKind::Cpu),
            spill_slots: SpillSlots::default(),
            cpu_spill_slot_count: 0,
            spilled: Vec::new(),
        }
    }

    pub fn allocate_registers(&mut self) -> Result<AllocationSummary, AllocationError> {
        info!("Allocating registers");
        self.liveness = Liveness::analyze(&*self.graph);
        self.numbering = Numbering::number_instructions(&mut *self.graph);
        self.value_ranges = index_vec::index_vec![None; self.graph.max_vreg()];
        self.build_live_ranges();
        debug!("Live ranges:\n{}", self.dump_live_ranges());

        let cpu_ranges = std::mem::take(&mut self.unallocated_cpu);
        self.prepare_for_allocation(RegisterKind::Cpu, cpu_ranges);
        self.allocate_unallocated_ranges()?;
        self.cpu_spill_slot_count = self
            .spill_slots
            .len()
            .max(self.config.reserved_catch_slots);
        self.spill_slots.clear();

        let fpu_ranges = std::mem::take(&mut self.unallocated_fpu);
        self.prepare_for_allocation(RegisterKind::Fpu, fpu_ranges);
        self.allocate_unallocated_ranges()?;
        let fpu_spill_slot_count = self.spill_slots.len();

        let summary = AllocationSummary {
            cpu_spill_slot_count: self.cpu_spill_slot_count,
            fpu_spill_slot_count,
            spill_slot_count: self.cpu_spill_slot_count + fpu_spill_slot_count * TM::DOUBLE_SPILL_FACTOR,
        };
        self.graph.spill_slot_count = summary.spill_slot_count;

        self.resolve_control_flow();
        debug!("Allocated graph:\n{}", self.graph);
        info!("Register allocation finished: {summary:?}");
        Ok(summary)
    }

    pub fn graph(&self) -> &FlowGraph<TM> {
        &*self.graph
    }

    pub fn live_ranges(&self) -> &IndexVec<LiveRangeId, LiveRange<TM>> {
        &self.ranges
    }

    /// The parent range of `vreg`, if the value is live anywhere.
    pub fn parent_range(&self, vreg: Vreg) -> Option<LiveRangeId> {
        self.value_ranges.get(vreg).copied().flatten()
    }

    /// `range` followed by all of its split siblings, in position order.
    pub fn siblings(&self, range: LiveRangeId) -> impl Iterator<Item = LiveRangeId> + '_ {
        std::iter::successors(Some(range), |id| self.ranges[*id].next_sibling)
    }

    fn live_range_for(&mut self, vreg: Vreg) -> LiveRangeId {
        if let Some(id) = self.value_ranges[vreg] {
            return id;
        }
        let repr = self.graph.repr(vreg).half();
        let id = self.ranges.push(LiveRange::new(RangeOwner::Value(vreg), repr));
        self.value_ranges[vreg] = Some(id);
        id
    }

    fn parent_of(&self, range: LiveRangeId) -> Option<LiveRangeId> {
        self.ranges[range]
            .vreg()
            .and_then(|vreg| self.value_ranges[vreg])
    }

    fn position_of(&self, instr: InstrId) -> u32 {
        self.graph.instrs[instr]
            .pos
            .unwrap_or_else(|| panic!("{instr} has no lifetime position"))
    }

    fn dump_live_ranges(&self) -> String {
        self.value_ranges
            .iter()
            .flatten()
            .map(|id| self.ranges[*id].to_string())
            .join("\n")
    }
}

/// Allocates registers for `graph` in place.
pub fn allocate_registers<TM: TargetMachine>(
    graph: &mut FlowGraph<TM>,
    config: AllocatorConfig,
) -> Result<AllocationSummary, AllocationError> {
    FlowGraphAllocator::new(graph, config).allocate_registers()
}
