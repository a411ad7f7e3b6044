use index_vec::IndexVec;
use tracing::{
    debug,
    trace,
};

use crate::codegen::{
    machine::{
        function::LoopId,
        Location,
        Policy,
        RegisterKind,
        TargetMachine,
    },
    register_allocator::{
        live_range::{
            first_intersection,
            to_instruction_start,
            Hint,
            LiveRange,
            LiveRangeId,
            RangeOwner,
            MAX_POSITION,
        },
        AllocationError,
        FlowGraphAllocator,
        RegisterFile,
    },
};

/// Inserts `range` so that `list` stays sorted by decreasing start.
fn add_to_sorted_list<TM: TargetMachine>(
    ranges: &mut IndexVec<LiveRangeId, LiveRange<TM>>,
    list: &mut Vec<LiveRangeId>,
    range: LiveRangeId,
) {
    ranges[range].initialize_finger();
    let start = ranges[range].start();
    let index = list
        .iter()
        .rposition(|other| start <= ranges[*other].start())
        .map_or(0, |index| index + 1);
    list.insert(index, range);
}

impl<TM: TargetMachine> FlowGraphAllocator<'_, TM> {
    /// Queues a finished range for the pass of its register kind.
    pub(super) fn complete_range(&mut self, range: LiveRangeId, kind: RegisterKind) {
        let list = match kind {
            RegisterKind::Cpu => &mut self.unallocated_cpu,
            RegisterKind::Fpu => &mut self.unallocated_fpu,
        };
        add_to_sorted_list(&mut self.ranges, list, range);
    }

    pub(super) fn add_to_unallocated(&mut self, range: LiveRangeId) {
        add_to_sorted_list(&mut self.ranges, &mut self.unallocated, range);
    }

    pub(super) fn prepare_for_allocation(&mut self, kind: RegisterKind, unallocated: Vec<LiveRangeId>) {
        debug!("Allocating {kind} registers for {} ranges", unallocated.len());
        debug_assert!(self.unallocated.is_empty());
        self.register_file = RegisterFile::new::<TM>(kind);
        self.unallocated = unallocated;
        let blocking = match kind {
            RegisterKind::Cpu => self.cpu_blocking_ranges.clone(),
            RegisterKind::Fpu => self.fpu_blocking_ranges.clone(),
        };
        for (reg, range) in blocking.into_iter().enumerate() {
            if let Some(range) = range {
                self.ranges[range].initialize_finger();
                self.register_file.registers[reg].push(range);
            }
        }
    }

    pub(super) fn allocate_unallocated_ranges(&mut self) -> Result<(), AllocationError> {
        while let Some(range) = self.unallocated.pop() {
            let start = self.ranges[range].start();
            trace!("Processing {} starting at {start}", self.ranges[range]);
            self.advance_active_intervals(start);
            if !self.allocate_free_register(range) {
                if self.config.intrinsic_mode {
                    return Err(AllocationError::NeedsFallback {
                        vreg: self.ranges[range].vreg(),
                        position: start,
                    });
                }
                self.allocate_any_register(range);
            }
        }
        self.advance_active_intervals(MAX_POSITION);
        Ok(())
    }

    /// Retires every allocated range that ends before `start`.
    fn advance_active_intervals(&mut self, start: u32) {
        for reg in 0..self.register_file.len() {
            let mut index = 0;
            while index < self.register_file.registers[reg].len() {
                let range = self.register_file.registers[reg][index];
                if self.ranges[range].advance_finger(start) {
                    self.convert_all_uses(range);
                    self.register_file.registers[reg].remove(index);
                } else {
                    index += 1;
                }
            }
        }
    }

    fn first_intersection_with_allocated(&self, reg: usize, unallocated: LiveRangeId) -> u32 {
        let pending = self.ranges[unallocated].pending_intervals();
        let mut intersection = MAX_POSITION;
        for allocated in &self.register_file.registers[reg] {
            let allocated = self.ranges[*allocated].pending_intervals();
            match allocated.first() {
                Some(head) if head.start < intersection => {
                    intersection = intersection.min(first_intersection(allocated, pending));
                }
                _ => {}
            }
        }
        intersection
    }

    fn register_of_this_kind(&self, location: Location<TM>) -> Option<usize> {
        (location.register_kind() == Some(self.register_file.kind))
            .then(|| location.register_code())
            .flatten()
    }

    fn hint_location(&self, hint: Hint) -> Location<TM> {
        match hint {
            Hint::Slot(slot) => self.graph.location(slot),
            Hint::AssignedTo(range) => self.ranges[range].assigned,
        }
    }

    /// Tries to find a register that is free at least at the start of `range`.
    fn allocate_free_register(&mut self, range: LiveRangeId) -> bool {
        let register_count = self.register_file.len();
        let bias = self.config.register_allocation_bias;
        let mut candidate = None;
        let mut free_until = 0;

        // Hints towards ranges that are not allocated yet say nothing.
        let hint = self.ranges[range]
            .pending_hints()
            .map(|hint| self.hint_location(hint))
            .find(|location| !location.is_invalid() && !location.is_unallocated())
            .and_then(|location| self.register_of_this_kind(location));
        if let Some(reg) = hint {
            if !self.register_file.blocked[reg] {
                free_until = self.first_intersection_with_allocated(reg, range);
                candidate = Some(reg);
            }
            trace!("Hint r{reg} for {} is free until {free_until}", self.ranges[range]);
        } else {
            for i in 0..register_count {
                let reg = (i + bias) % register_count;
                if !self.register_file.blocked[reg] && self.register_file.registers[reg].is_empty() {
                    candidate = Some(reg);
                    free_until = MAX_POSITION;
                    break;
                }
            }
        }

        if free_until != MAX_POSITION {
            for i in 0..register_count {
                let reg = (i + bias) % register_count;
                if self.register_file.blocked[reg] || Some(reg) == candidate {
                    continue;
                }
                let intersection = self.first_intersection_with_allocated(reg, range);
                if intersection > free_until {
                    candidate = Some(reg);
                    free_until = intersection;
                    if free_until == MAX_POSITION {
                        break;
                    }
                }
            }
        }

        let start = self.ranges[range].start();
        let Some(mut candidate) = candidate.filter(|_| free_until > start) else {
            return false;
        };

        // Avoid registers that loop phis need on the back edge.
        if let Some(loop_id) = self.loop_needing_backedge_register(range, free_until) {
            let used_on_backedge = self.registers_used_on_backedge(loop_id, range);
            if used_on_backedge[candidate] {
                trace!("r{candidate} is used by a phi on the back edge");
                for reg in 0..register_count {
                    if self.register_file.blocked[reg] || reg == candidate || used_on_backedge[reg] {
                        continue;
                    }
                    let intersection = self.first_intersection_with_allocated(reg, range);
                    if intersection >= free_until {
                        candidate = reg;
                        free_until = intersection;
                        trace!("Found r{reg} free on the back edge");
                        break;
                    }
                }
            }
        }

        if free_until != MAX_POSITION {
            trace!("Splitting {} at {free_until}", self.ranges[range]);
            let tail = self.split_at(range, free_until);
            self.add_to_unallocated(tail);

            // A use-less head of a constant lives nowhere.
            let spills_to_constant = self
                .parent_of(range)
                .map_or(false, |parent| self.ranges[parent].spill_slot.is_constant());
            if self.ranges[range].uses().is_empty() && spills_to_constant {
                self.spill(range);
                return true;
            }
        }

        self.assign_register(range, candidate);
        true
    }

    fn loop_needing_backedge_register(&self, range: LiveRangeId, free_until: u32) -> Option<LoopId> {
        let vreg = self.ranges[range].vreg()?;
        let block = self.numbering.block_entry_at(self.ranges[range].start());
        let loop_id = self.graph.cfg().loop_of(block)?;
        let extra = &self.numbering.extra_loop_info[loop_id];
        let interferes = extra
            .backedge_interference
            .as_ref()
            .map_or(false, |set| set[vreg.index()]);
        (free_until >= extra.end && interferes).then_some(loop_id)
    }

    fn registers_used_on_backedge(&mut self, loop_id: LoopId, range: LiveRangeId) -> Vec<bool> {
        let vreg = self.ranges[range]
            .vreg()
            .expect("only values are checked against the back edge");
        let header = self.graph.cfg().loop_info(loop_id).header;
        let mut used = vec![false; self.register_file.len()];
        for phi in self.graph.blocks[header].phis.clone() {
            let phi_vreg = self.graph.instrs[phi].output.expect("phis define a value");
            let mut halves = vec![phi_vreg];
            if self.graph.repr(phi_vreg).is_pair() {
                halves.push(phi_vreg.second_of_pair());
            }
            for half in halves {
                let Some(phi_range) = self.value_ranges[half] else {
                    continue;
                };
                let Some(reg) = self.register_of_this_kind(self.ranges[phi_range].assigned) else {
                    continue;
                };
                if !self.reaching_defs.get(&*self.graph, phi_vreg)[vreg.index()] {
                    used[reg] = true;
                }
            }
        }
        used
    }

    /// Takes a register away from the ranges occupying it, or spills `range`
    /// up to its first register use.
    fn allocate_any_register(&mut self, range: LiveRangeId) {
        let start = self.ranges[range].start();
        let register_use = {
            let graph = &*self.graph;
            self.ranges[range].first_register_use(start, &graph.locations)
        };
        if register_use.is_none() && !(self.ranges[range].is_loop_phi && self.has_cheap_eviction_candidate(range)) {
            trace!("No register use, spilling {}", self.ranges[range]);
            self.spill(range);
            return;
        }

        let bias = self.config.register_allocation_bias;
        let register_count = self.register_file.len();
        let mut candidate = None;
        let mut free_until = 0;
        let mut blocked_at = MAX_POSITION;
        for i in 0..register_count {
            let reg = (i + bias) % register_count;
            if self.register_file.blocked[reg] {
                continue;
            }
            if self.update_free_until(reg, range, &mut free_until, &mut blocked_at) {
                candidate = Some(reg);
            }
        }

        let register_use_pos = register_use.map_or(start, |use_pos| use_pos.pos);
        if free_until < register_use_pos {
            let register_use = register_use.expect("a register use exists when no register is free at the start");
            debug_assert!(start < to_instruction_start(register_use.pos));
            self.spill_between(range, start, register_use.pos);
            return;
        }

        let candidate = candidate.expect("some register is free until the first register use");
        trace!("Assigning blocked r{candidate} to {}", self.ranges[range]);
        if blocked_at < self.ranges[range].end() {
            let tail = self.split_between(range, start, blocked_at + 1);
            self.add_to_unallocated(tail);
        }
        self.assign_non_free_register(range, candidate);
    }

    /// Computes how long `reg` could be taken for `range` by evicting
    /// spillable occupants. Returns true if that beats `cur_free_until`.
    fn update_free_until(&mut self, reg: usize, range: LiveRangeId, cur_free_until: &mut u32, cur_blocked_at: &mut u32) -> bool {
        let mut free_until = MAX_POSITION;
        let mut blocked_at = MAX_POSITION;
        let start = self.ranges[range].start();

        for index in 0..self.register_file.registers[reg].len() {
            let allocated = self.register_file.registers[reg][index];
            let head = self.ranges[allocated]
                .first_pending_interval()
                .expect("allocated ranges have pending intervals");
            if head.contains(start) {
                if !matches!(self.ranges[allocated].owner, RangeOwner::Value(_)) {
                    return false;
                }
                let use_pos = {
                    let graph = &*self.graph;
                    self.ranges[allocated].first_interfering_use(start, &graph.locations)
                };
                // Used in a register by the current instruction.
                if use_pos.map_or(false, |use_pos| to_instruction_start(use_pos.pos) - start <= 1) {
                    return false;
                }
                let use_pos = use_pos.map_or_else(|| self.ranges[allocated].end(), |use_pos| use_pos.pos);
                free_until = free_until.min(use_pos);
            } else {
                let intersection = first_intersection(
                    self.ranges[allocated].pending_intervals(),
                    self.ranges[range].intervals(),
                );
                if intersection != MAX_POSITION {
                    free_until = free_until.min(intersection);
                    if self.ranges[allocated].owner == RangeOwner::Blocking {
                        blocked_at = intersection;
                    }
                }
            }

            if free_until <= *cur_free_until {
                return false;
            }
        }

        *cur_free_until = free_until;
        *cur_blocked_at = blocked_at;
        true
    }

    fn has_cheap_eviction_candidate(&self, phi_range: LiveRangeId) -> bool {
        let header = self.numbering.block_entry_at(self.ranges[phi_range].start());
        let Some(loop_id) = self.graph.cfg().loop_with_header(header) else {
            return false;
        };
        (0..self.register_file.len())
            .any(|reg| !self.register_file.blocked[reg] && self.is_cheap_to_evict_register_in_loop(loop_id, reg))
    }

    /// True if every occupant of `reg` is either absent from the loop or
    /// enters it with only unconstrained uses.
    fn is_cheap_to_evict_register_in_loop(&self, loop_id: LoopId, reg: usize) -> bool {
        let extra = &self.numbering.extra_loop_info[loop_id];
        self.register_file.registers[reg].iter().all(|allocated| {
            let Some(head) = self.ranges[*allocated].first_pending_interval() else {
                return true;
            };
            if head.contains(extra.start) {
                self.parent_of(*allocated)
                    .map_or(false, |parent| self.ranges[parent].has_only_unconstrained_uses_in_loop(loop_id))
            } else {
                head.start >= extra.end
            }
        })
    }

    fn assign_non_free_register(&mut self, range: LiveRangeId, reg: usize) {
        let mut index = self.register_file.registers[reg].len();
        while index > 0 {
            index -= 1;
            let allocated = self.register_file.registers[reg][index];
            if !matches!(self.ranges[allocated].owner, RangeOwner::Value(_)) {
                continue;
            }
            if self.evict_intersection(allocated, range) {
                if self.ranges[allocated].assigned.is_machine_register() {
                    debug_assert!(self.ranges[allocated].end() <= self.ranges[range].start());
                    self.convert_all_uses(allocated);
                }
                self.register_file.registers[reg].remove(index);
            }
        }
        self.assign_register(range, reg);
    }

    /// Spills the part of `allocated` that overlaps `unallocated`.
    fn evict_intersection(&mut self, allocated: LiveRangeId, unallocated: LiveRangeId) -> bool {
        let unallocated_pending = self.ranges[unallocated].pending_intervals();
        let intersection = first_intersection(self.ranges[allocated].pending_intervals(), unallocated_pending);
        if intersection == MAX_POSITION {
            return false;
        }
        let spill_position = unallocated_pending[0].start;
        let use_pos = {
            let graph = &*self.graph;
            self.ranges[allocated].first_interfering_use(spill_position, &graph.locations)
        };
        trace!("Evicting {} at {spill_position}", self.ranges[allocated]);
        match use_pos {
            None => self.spill_after(allocated, spill_position),
            Some(use_pos) => {
                let restore_position = if spill_position < intersection {
                    intersection.min(use_pos.pos)
                } else {
                    use_pos.pos
                };
                self.spill_between(allocated, spill_position, restore_position);
            }
        }
        true
    }

    fn assign_register(&mut self, range: LiveRangeId, reg: usize) {
        let location = Location::machine_register(self.register_file.kind, reg);
        trace!("Assigning {location} to {}", self.ranges[range]);
        self.ranges[range].assigned = location;
        self.register_file.registers[reg].push(range);
    }

    /// Splits `range` at `pos` and links the tail as its next sibling.
    pub(super) fn split_at(&mut self, range: LiveRangeId, pos: u32) -> LiveRangeId {
        if self.ranges[range].start() == pos {
            return range;
        }
        let tail = self.ranges[range].split_off(pos);
        let tail = self.ranges.push(tail);
        self.ranges[range].next_sibling = Some(tail);
        trace!("Split {} at {pos}", self.ranges[range]);
        tail
    }

    /// Splits `range` somewhere in `(from, to]`, preferring block boundaries
    /// and the outermost loop header after `from`.
    pub(super) fn split_between(&mut self, range: LiveRangeId, from: u32, to: u32) -> LiveRangeId {
        debug_assert!(from < to);
        let mut split_block = self.numbering.block_entry_at(to);
        let split_pos = if from < self.graph.blocks[split_block].start_pos {
            let mut loop_header = self.numbering.block_info(split_block).loop_header;
            while let Some(header) = loop_header {
                if from >= self.graph.blocks[header].start_pos {
                    break;
                }
                split_block = header;
                loop_header = self.numbering.block_info(header).loop_header;
                trace!("Moved split position to loop header {header}");
            }
            self.graph.blocks[split_block].start_pos
        } else {
            to_instruction_start(to) - 1
        };
        debug_assert!(from < split_pos);
        self.split_at(range, split_pos)
    }

    /// Writes the assigned location of `range` into all of its use slots.
    pub(super) fn convert_all_uses(&mut self, range: LiveRangeId) {
        if self.ranges[range].owner == RangeOwner::Blocking {
            return;
        }
        let location = self.ranges[range].assigned;
        debug_assert!(!location.is_invalid(), "{} has no location", self.ranges[range]);
        trace!("Converting uses of {} to {location}", self.ranges[range]);

        let parent = self
            .parent_of(range)
            .filter(|parent| self.ranges[*parent].has_uses_which_require_stack);
        for index in 0..self.ranges[range].uses().len() {
            let slot = self.ranges[range].uses()[index].slot;
            let target = match parent {
                Some(parent) if self.graph.location(slot).has_policy(Policy::RequiresStack) => {
                    self.spill_slot_of(parent)
                }
                _ => location,
            };
            self.graph.set_location(slot, target);
        }

        if location.is_machine_register() {
            let repr = self.ranges[range].repr;
            for index in 0..self.ranges[range].safepoints().len() {
                let instr = self.ranges[range].safepoints()[index].instr;
                let locs = &mut self.graph.instrs[instr].locs;
                if !locs.always_calls() {
                    debug_assert!(locs.can_call());
                    locs.live_registers.add(location, repr);
                }
            }
        }
    }
}
