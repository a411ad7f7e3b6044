use bitvec::vec::BitVec;
use smallvec::{
    smallvec,
    SmallVec,
};
use tracing::{
    debug,
    trace,
};

use crate::codegen::{
    machine::{
        abi::CallingConvention,
        function::{
            BasicBlockId,
            BlockKind,
            LoopId,
        },
        instr::{
            MoveOperands,
            ParallelMove,
            SpecialParameterKind,
        },
        FlowGraph,
        Instr,
        InstrId,
        InstrKind,
        Location,
        OperandSlots,
        PhysicalRegister,
        Policy,
        RegisterKind,
        Representation,
        SlotId,
        StackSlot,
        TargetMachine,
        Vreg,
    },
    register_allocator::{
        live_range::{
            is_instruction_start,
            Hint,
            LiveRange,
            LiveRangeId,
            RangeOwner,
        },
        numbering::PositionOwner,
        FlowGraphAllocator,
        NORMAL_ENTRY_POS,
    },
};

impl<TM: TargetMachine> FlowGraphAllocator<'_, TM> {
    /// Builds live ranges by walking the blocks and their instructions backwards.
    pub(super) fn build_live_ranges(&mut self) {
        debug!("Building live ranges");
        let block_order = self.graph.block_order().to_vec();
        debug_assert_eq!(self.graph.blocks[block_order[0]].kind, BlockKind::GraphEntry);
        let mut interference: Option<LoopId> = None;
        for bb in block_order.iter().skip(1).rev().copied() {
            let (block_start, block_end) = (self.graph.blocks[bb].start_pos, self.graph.blocks[bb].end_pos);
            let live_out: Vec<usize> = self.liveness.live_out(bb).iter_ones().collect();
            for vreg in live_out {
                let range = self.live_range_for(Vreg::new(vreg));
                self.ranges[range].add_use_interval(block_start, block_end);
            }

            let cfg = self.graph.cfg();
            if let Some(loop_id) = cfg.loop_of(bb).filter(|loop_id| cfg.loop_info(*loop_id).is_back_edge(bb)) {
                let header = cfg.loop_info(loop_id).header;
                let extra = &mut self.numbering.extra_loop_info[loop_id];
                if extra.backedge_interference.is_none() {
                    // Everything flowing into the header is live at the back edge.
                    let mut set = BitVec::repeat(false, self.graph.max_vreg());
                    for vreg in self.liveness.live_in(header).iter_ones() {
                        set.set(vreg, true);
                    }
                    extra.backedge_interference = Some(set);
                }
                interference = Some(loop_id);
            }

            self.connect_outgoing_phi_moves(bb, interference);

            let instructions = self.graph.blocks[bb].instructions.clone();
            let skip_terminator = usize::from(self.graph.goto_of(bb).is_some());
            for instr in instructions.iter().rev().skip(skip_terminator) {
                if self.graph.instrs[*instr].is_parallel_move() {
                    continue;
                }
                self.process_one_instruction(bb, *instr, interference);
            }

            if self.numbering.block_info(bb).is_loop_header {
                let loop_id = self
                    .graph
                    .cfg()
                    .loop_with_header(bb)
                    .expect("loop headers have a loop");
                interference = None;
                let loop_end = self.numbering.extra_loop_info[loop_id].end;
                let live_in: Vec<usize> = self.liveness.live_in(bb).iter_ones().collect();
                for vreg in live_in {
                    let range = self.live_range_for(Vreg::new(vreg));
                    if self.has_only_unconstrained_uses_before(range, loop_end) {
                        trace!("{} has only unconstrained uses in {bb}", Vreg::new(vreg));
                        self.ranges[range].mark_has_only_unconstrained_uses_in_loop(loop_id);
                    }
                }
            }

            let block_kind = self.graph.blocks[bb].kind;
            match block_kind {
                BlockKind::Block if self.graph.blocks[bb].is_join() => self.connect_incoming_phi_moves(bb),
                BlockKind::CatchEntry => {
                    let definitions = self.graph.blocks[bb].initial_definitions.clone();
                    for (index, def) in definitions.into_iter().enumerate() {
                        let vreg = self.graph.instrs[def]
                            .output
                            .expect("initial definitions define a value");
                        let range = self.live_range_for(vreg);
                        self.ranges[range].define_at(block_start);
                        self.process_initial_definition(def, range, bb, index);
                    }
                }
                BlockKind::FunctionEntry => self.process_entry_definitions(bb, block_start + 2),
                _ => {}
            }
        }

        // Parameters and constants come last so that every safepoint is known.
        let graph_entry = self.graph.graph_entry;
        let graph_entry_end = self.graph.blocks[graph_entry].end_pos;
        self.process_entry_definitions(graph_entry, graph_entry_end);
    }

    fn process_entry_definitions(&mut self, bb: BasicBlockId, end: u32) {
        let start = self.graph.blocks[bb].start_pos;
        let definitions = self.graph.blocks[bb].initial_definitions.clone();
        for (index, def) in definitions.into_iter().enumerate() {
            let vreg = self.graph.instrs[def]
                .output
                .expect("initial definitions define a value");
            let mut halves: SmallVec<[Vreg; 2]> = smallvec![vreg];
            if self.graph.repr(vreg).is_pair() {
                halves.insert(0, vreg.second_of_pair());
            }
            for half in halves {
                let range = self.live_range_for(half);
                self.ranges[range].add_use_interval(start, end);
                self.ranges[range].define_at(start);
                self.process_initial_definition(def, range, bb, index);
            }
        }
    }

    fn has_only_unconstrained_uses_before(&self, range: LiveRangeId, boundary: u32) -> bool {
        self.ranges[range]
            .uses()
            .iter()
            .take_while(|use_pos| use_pos.pos < boundary)
            .all(|use_pos| self.graph.location(use_pos.slot) == Location::any())
    }

    fn has_only_unconstrained_uses(&self, range: LiveRangeId) -> bool {
        self.has_only_unconstrained_uses_before(range, u32::MAX)
    }

    /// Records the phi inputs flowing out of `bb` as uses at its `Goto`.
    fn connect_outgoing_phi_moves(&mut self, bb: BasicBlockId, interference: Option<LoopId>) {
        let Some(goto) = self.graph.goto_of(bb) else {
            return;
        };
        let Some(moves) = self.graph.instrs[goto]
            .parallel_move()
            .map(|parallel_move| parallel_move.moves.clone())
        else {
            return;
        };
        let InstrKind::Goto { target: join, .. } = self.graph.instrs[goto].kind else {
            unreachable!("{goto} is not a goto");
        };
        let pos = self.position_of(goto);
        let block_start = self.graph.blocks[bb].start_pos;
        let pred_index = self.graph.blocks[join]
            .index_of_predecessor(bb)
            .unwrap_or_else(|| panic!("{bb} is not a predecessor of {join}"));

        let mut move_index = 0;
        for phi in self.graph.blocks[join].phis.clone() {
            let phi_vreg = self.graph.instrs[phi].output.expect("phis define a value");
            let value = self.graph.instrs[phi].inputs[pred_index];
            let mut halves: SmallVec<[(Vreg, Vreg); 2]> = smallvec![(value, phi_vreg)];
            if self.graph.repr(phi_vreg).is_pair() {
                halves.push((value.second_of_pair(), phi_vreg.second_of_pair()));
            }
            for (input, phi_half) in halves {
                let mov = moves[move_index];
                move_index += 1;
                if self.graph.is_constant(value) {
                    self.graph.set_location(mov.src, Location::Constant(input));
                    continue;
                }
                let range = self.live_range_for(input);
                if let Some(loop_id) = interference {
                    if let Some(set) = self.numbering.extra_loop_info[loop_id]
                        .backedge_interference
                        .as_mut()
                    {
                        set.set(input.index(), true);
                    }
                }
                let phi_range = self.live_range_for(phi_half);
                self.ranges[range].add_use_interval(block_start, pos);
                self.ranges[range].add_hinted_use(pos, mov.src, Hint::AssignedTo(phi_range));
                self.graph.set_location(mov.src, Location::prefers_register());
            }
        }
    }

    /// Defines the phis of `join` at its start and connects them to the
    /// destinations of the phi moves in every predecessor.
    fn connect_incoming_phi_moves(&mut self, join: BasicBlockId) {
        let pos = self.graph.blocks[join].start_pos;
        let is_loop_header = self.numbering.block_info(join).is_loop_header;
        let preds = self.graph.blocks[join].preds.clone();
        let mut move_index = 0;
        for phi in self.graph.blocks[join].phis.clone() {
            let phi_vreg = self.graph.instrs[phi].output.expect("phis define a value");
            let mut halves: SmallVec<[Vreg; 2]> = smallvec![phi_vreg];
            if self.graph.repr(phi_vreg).is_pair() {
                halves.push(phi_vreg.second_of_pair());
            }
            let half_count = halves.len();
            for (half_index, half) in halves.into_iter().enumerate() {
                let range = self.live_range_for(half);
                self.ranges[range].define_at(pos);
                self.ranges[range].is_loop_phi = is_loop_header;
                for pred in &preds {
                    let goto = self
                        .graph
                        .goto_of(*pred)
                        .unwrap_or_else(|| panic!("predecessor {pred} of {join} does not end in a goto"));
                    let mov = self.graph.instrs[goto]
                        .parallel_move()
                        .map(|parallel_move| parallel_move.moves[move_index + half_index])
                        .expect("phi moves are created during numbering");
                    self.graph.set_location(mov.dest, Location::prefers_register());
                    self.ranges[range].add_use(pos, mov.dest);
                }
                self.assign_safepoints(Some(phi), range);
                let kind = self.ranges[range].repr.register_kind();
                self.complete_range(range, kind);
            }
            move_index += half_count;
        }
    }

    fn process_one_instruction(&mut self, bb: BasicBlockId, instr_id: InstrId, interference: Option<LoopId>) {
        let instr = &self.graph.instrs[instr_id];
        let inputs = instr.inputs.clone();
        let input_slots = instr.locs.inputs.clone();
        let temps = instr.locs.temps.clone();
        let output = instr.output;
        let output_slots = instr.locs.output;
        let env = instr.env;
        let is_constant = instr.is_constant();
        let (always_calls, can_call, callee_safe, slow_path) = (
            instr.locs.always_calls(),
            instr.locs.can_call(),
            instr.locs.callee_safe_call(),
            instr.locs.has_call_on_slow_path(),
        );

        if is_constant {
            if let (Some(vreg), Some(out)) = (output, output_slots) {
                let range = self.value_ranges[vreg];
                match range {
                    Some(range) if !self.ranges[range].uses().is_empty() => {
                        if self.has_only_unconstrained_uses(range) {
                            trace!("Using {vreg} as a constant operand everywhere");
                            let location = Location::Constant(vreg);
                            self.ranges[range].assigned = location;
                            self.ranges[range].spill_slot = location;
                            self.ranges[range].initialize_finger();
                            self.convert_all_uses(range);
                            self.graph.set_location(out.first(), Location::Invalid);
                            return;
                        }
                    }
                    _ => {
                        trace!("Dropping unused constant {vreg}");
                        self.graph.set_location(out.first(), Location::Invalid);
                        return;
                    }
                }
            }
        }

        let pos = self.position_of(instr_id);
        debug_assert!(is_instruction_start(pos));
        debug_assert_eq!(inputs.len(), input_slots.len());

        // A fixed first input pins a same-as-first-input output to the same register.
        if let Some(out) = output_slots {
            if self.graph.location(out.first()).has_policy(Policy::SameAsFirstInput) {
                match (out, input_slots.first().copied()) {
                    (OperandSlots::Single(out), Some(OperandSlots::Single(input))) => {
                        let location = self.graph.location(input);
                        if location.is_machine_register() {
                            self.graph.set_location(out, location);
                        }
                    }
                    (OperandSlots::Pair(out_lo, out_hi), Some(OperandSlots::Pair(in_lo, in_hi))) => {
                        let (lo, hi) = (self.graph.location(in_lo), self.graph.location(in_hi));
                        debug_assert_eq!(lo.is_machine_register(), hi.is_machine_register());
                        if lo.is_machine_register() && hi.is_machine_register() {
                            self.graph.set_location(out_lo, lo);
                            self.graph.set_location(out_hi, hi);
                        }
                    }
                    (out, input) => unreachable!("{instr_id}: same-as-first-input output {out:?} with input {input:?}"),
                }
            }
        }
        let output_same_as_first_input = output_slots.map_or(false, |out| {
            self.graph
                .location(out.first())
                .has_policy(Policy::SameAsFirstInput)
        });

        if env.is_some() {
            self.process_environment_uses(bb, instr_id);
        }

        let first_input = usize::from(output_same_as_first_input);
        for (input, slots) in inputs.iter().zip(&input_slots).skip(first_input) {
            match *slots {
                OperandSlots::Single(slot) => self.process_one_input(bb, pos, slot, *input, slow_path.then_some(instr_id)),
                OperandSlots::Pair(lo, hi) => {
                    self.process_one_input(bb, pos, lo, *input, slow_path.then_some(instr_id));
                    self.process_one_input(bb, pos, hi, input.second_of_pair(), slow_path.then_some(instr_id));
                }
            }
        }

        for slot in temps {
            let location = self.graph.location(slot);
            match location {
                Location::Register(_) | Location::FpuRegister(_) => {
                    debug_assert!(!always_calls, "{instr_id} calls and needs a fixed temp");
                    self.block_location(location, pos, pos + 1);
                }
                Location::Unallocated(policy) => {
                    let kind = policy.register_kind();
                    let range = self.make_temporary(kind);
                    self.ranges[range].add_use_interval(pos, pos + 1);
                    self.ranges[range].add_use(pos, slot);
                    self.complete_range(range, kind);
                }
                other => unreachable!("temp of {instr_id} has location {other}"),
            }
        }

        if always_calls && !callee_safe {
            for code in 0..TM::Reg::count() {
                self.block_location(Location::machine_register(RegisterKind::Cpu, code), pos, pos + 1);
            }
            for code in 0..TM::FpuReg::count() {
                self.block_location(Location::machine_register(RegisterKind::Fpu, code), pos, pos + 1);
            }
        }

        if can_call {
            self.safepoints.push(instr_id);
        }

        let (Some(def), Some(out)) = (output, output_slots) else {
            return;
        };
        if self.graph.location(out.first()).is_invalid() {
            return;
        }
        let same_as_first = |half: usize| {
            if !output_same_as_first_input {
                return None;
            }
            let input_slots = input_slots[0];
            let input = inputs[0];
            match (input_slots, half) {
                (OperandSlots::Single(slot), _) => Some((slot, input)),
                (OperandSlots::Pair(lo, _), 0) => Some((lo, input)),
                (OperandSlots::Pair(_, hi), _) => Some((hi, input.second_of_pair())),
            }
        };
        match out {
            OperandSlots::Single(slot) => {
                self.process_one_output(bb, pos, slot, instr_id, def, same_as_first(0), interference);
            }
            OperandSlots::Pair(lo, hi) => {
                self.process_one_output(bb, pos, lo, instr_id, def, same_as_first(0), interference);
                self.process_one_output(
                    bb,
                    pos,
                    hi,
                    instr_id,
                    def.second_of_pair(),
                    same_as_first(1),
                    interference,
                );
            }
        }
    }

    /// Values captured by deoptimization environments stay alive until the
    /// end of the instruction, in any location.
    fn process_environment_uses(&mut self, bb: BasicBlockId, instr_id: InstrId) {
        let block_start = self.graph.blocks[bb].start_pos;
        let use_pos = self.position_of(instr_id) + 1;
        let mut current = self.graph.instrs[instr_id].env;
        while let Some(env) = current {
            let values = self.graph.environments[env].values.clone();
            let mut locations = Vec::with_capacity(values.len());
            for value in values {
                let is_pair = self.graph.repr(value).is_pair();
                if self.graph.is_constant(value) {
                    let lo = self.graph.new_slot(Location::Constant(value));
                    locations.push(if is_pair {
                        OperandSlots::Pair(lo, self.graph.new_slot(Location::Constant(value.second_of_pair())))
                    } else {
                        OperandSlots::Single(lo)
                    });
                    continue;
                }
                let slots = if is_pair {
                    OperandSlots::Pair(self.graph.new_slot(Location::any()), self.graph.new_slot(Location::any()))
                } else {
                    OperandSlots::Single(self.graph.new_slot(Location::any()))
                };
                let halves = [value, value.second_of_pair()];
                for (half, slot) in halves.into_iter().zip(slots.iter()) {
                    let range = self.live_range_for(half);
                    self.ranges[range].add_use_interval(block_start, use_pos);
                    self.ranges[range].add_use(use_pos, slot);
                }
                locations.push(slots);
            }
            self.graph.environments[env].locations = locations;
            current = self.graph.environments[env].outer;
        }
    }

    fn process_one_input(
        &mut self,
        bb: BasicBlockId,
        pos: u32,
        slot: SlotId,
        vreg: Vreg,
        slow_path_call: Option<InstrId>,
    ) {
        let range = self.live_range_for(vreg);
        let block_start = self.graph.blocks[bb].start_pos;
        let location = self.graph.location(slot);
        match location {
            Location::Register(_) | Location::FpuRegister(_) => {
                // The value moves into the fixed register at the end of the
                // previous instruction; the register is blocked until this one ends.
                if let Some(instr) = slow_path_call {
                    let repr = self.ranges[range].repr;
                    self.graph.instrs[instr].locs.live_registers.add(location, repr);
                }
                let mov = self.add_move_at(pos - 1, location, Location::any());
                self.block_location(location, pos - 1, pos + 1);
                self.ranges[range].add_use_interval(block_start, pos - 1);
                self.ranges[range].add_hinted_use(pos - 1, mov.src, Hint::Slot(slot));
            }
            Location::Unallocated(Policy::WritableRegister) => {
                // The instruction clobbers its input, so it gets a copy in a temporary.
                let kind = self.ranges[range].repr.register_kind();
                let required = match kind {
                    RegisterKind::Cpu => Location::requires_register(),
                    RegisterKind::Fpu => Location::Unallocated(Policy::RequiresFpuRegister),
                };
                let mov = self.add_move_at(pos, required, Location::prefers_register());
                self.ranges[range].add_use_interval(block_start, pos);
                self.ranges[range].add_use(pos, mov.src);

                let temp = self.make_temporary(kind);
                self.ranges[temp].add_use_interval(pos, pos + 1);
                self.ranges[temp].add_hinted_use(pos, slot, Hint::Slot(mov.src));
                self.ranges[temp].add_use(pos, mov.dest);
                self.graph.set_location(slot, required);
                self.complete_range(temp, kind);
            }
            Location::Unallocated(policy) => {
                if policy == Policy::RequiresStack {
                    self.ranges[range].has_uses_which_require_stack = true;
                }
                self.ranges[range].add_use_interval(block_start, pos + 1);
                self.ranges[range].add_use(pos + 1, slot);
            }
            Location::Constant(_) => {}
            other => unreachable!("input of {vreg} has unsupported location {other}"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_one_output(
        &mut self,
        bb: BasicBlockId,
        pos: u32,
        slot: SlotId,
        def: InstrId,
        vreg: Vreg,
        same_as_first_input: Option<(SlotId, Vreg)>,
        interference: Option<LoopId>,
    ) {
        let range = self.live_range_for(vreg);
        let out = self.graph.location(slot);
        if out.is_machine_register() {
            self.block_location(out, pos, pos + 1);
            if self.ranges[range].uses().is_empty() {
                return;
            }
            // Inputs of the next instruction read the fixed register directly.
            while let Some(first) = self.ranges[range].uses().first().copied() {
                if first.pos != pos + 1 {
                    debug_assert!(first.pos > pos + 1);
                    break;
                }
                debug_assert!(self.graph.location(first.slot).is_unallocated());
                self.graph.set_location(first.slot, out);
                self.ranges[range].pop_first_use();
            }
            self.ranges[range].define_at(pos + 1);
            if self.ranges[range].start() == self.ranges[range].end() {
                return;
            }
            let mov = self.add_move_at(pos + 1, Location::any(), out);
            self.ranges[range].add_hinted_use(pos + 1, mov.dest, Hint::Slot(slot));
        } else if let Some((input_slot, input_vreg)) = same_as_first_input {
            let input_location = self.graph.location(input_slot);
            self.graph.set_location(slot, input_location);
            let mov = self.add_move_at(pos, input_location, Location::any());

            let block_start = self.graph.blocks[bb].start_pos;
            let input_range = self.live_range_for(input_vreg);
            self.ranges[input_range].add_use_interval(block_start, pos);
            self.ranges[input_range].add_use(pos, mov.src);

            self.ranges[range].define_at(pos);
            self.ranges[range].add_hinted_use(pos, slot, Hint::Slot(mov.src));
            self.ranges[range].add_use(pos, mov.dest);
            self.ranges[range].add_use(pos, input_slot);

            if let Some(set) = interference.and_then(|loop_id| {
                self.numbering.extra_loop_info[loop_id]
                    .backedge_interference
                    .as_mut()
            }) {
                if set[vreg.index()] {
                    set.set(input_vreg.index(), true);
                }
            }
        } else {
            self.ranges[range].define_at(pos);
            self.ranges[range].add_use(pos, slot);
        }

        self.assign_safepoints(Some(def), range);
        let kind = self.ranges[range].repr.register_kind();
        self.complete_range(range, kind);
    }

    fn process_initial_definition(&mut self, def: InstrId, range: LiveRangeId, bb: BasicBlockId, index: usize) {
        let range_end = self.ranges[range].end();
        let block_start = self.graph.blocks[bb].start_pos;
        let vreg = self.ranges[range]
            .vreg()
            .expect("initial definitions define a value");
        let block_kind = self.graph.blocks[bb].kind;
        let is_constant = self.graph.instrs[def].is_constant();
        let def_kind = self.graph.instrs[def].kind.clone();
        match def_kind {
            InstrKind::Parameter { index: param_index } => {
                let location = if block_kind == BlockKind::CatchEntry {
                    Location::Stack(StackSlot::word(TM::FRAME_LAYOUT.frame_slot_for_spill_index(param_index)))
                } else {
                    let count = self.parameter_count();
                    TM::CallingConvention::parameter_location(param_index, count, self.ranges[range].repr)
                };
                self.ranges[range].assigned = location;
                if location.is_machine_register() {
                    self.fix_initial_definition(def, range, block_start, location);
                    return;
                }
                self.ranges[range].spill_slot = location;
            }
            InstrKind::SpecialParameter(kind) => {
                let reg = match kind {
                    SpecialParameterKind::ArgumentsDescriptor => TM::arguments_descriptor_reg(),
                    SpecialParameterKind::Exception => TM::exception_reg(),
                    SpecialParameterKind::StackTrace => TM::stack_trace_reg(),
                };
                let location = Location::Register(reg);
                self.ranges[range].assigned = location;
                self.fix_initial_definition(def, range, block_start, location);
                return;
            }
            InstrKind::Constant(_) => {
                let location = Location::Constant(vreg);
                self.ranges[range].assigned = location;
                self.ranges[range].spill_slot = location;
            }
            other => unreachable!("{other:?} is not an initial definition"),
        }

        self.assign_safepoints(Some(def), range);
        self.ranges[range].initialize_finger();
        let first_use = self.ranges[range].first_register_beneficial_use(block_start, &self.graph.locations);
        if let Some(first_use) = first_use {
            let tail = self.split_between(range, block_start, first_use.pos);
            let kind = self.ranges[range].repr.register_kind();
            self.complete_range(tail, kind);
        }
        self.convert_all_uses(range);

        let spill_slot = self.ranges[range].spill_slot;
        let spill_index = spill_slot
            .stack_slot()
            .and_then(|slot| TM::FRAME_LAYOUT.spill_index_for_frame_slot(slot.index));
        if let Some(spill_index) = spill_index {
            // The incoming value already lives in the spill area.
            self.spill_slots.reserve(spill_index, range_end);
            if self.ranges[range].repr.is_tagged() {
                self.mark_as_object_at_safepoints(range);
            }
        } else if is_constant && block_kind == BlockKind::CatchEntry {
            self.spill_slots.reserve(index, range_end);
        }
    }

    /// Pins an initial definition arriving in a register to that register for
    /// the block entry and lets the rest of the range be allocated normally.
    fn fix_initial_definition(&mut self, def: InstrId, range: LiveRangeId, block_start: u32, location: Location<TM>) {
        self.assign_safepoints(Some(def), range);
        // No move can be placed inside the graph entry, so its definitions
        // keep their register until the normal entry.
        let split_pos = if block_start == 0 {
            NORMAL_ENTRY_POS
        } else {
            block_start + 1
        };
        if self.ranges[range].end() > split_pos {
            let tail = self.split_at(range, split_pos);
            let kind = self.ranges[range].repr.register_kind();
            self.complete_range(tail, kind);
        }
        self.convert_all_uses(range);
        self.block_location(location, block_start, split_pos);
    }

    fn parameter_count(&self) -> usize {
        let entry = self.graph.normal_entry;
        self.graph.blocks[entry]
            .initial_definitions
            .iter()
            .filter(|def| matches!(self.graph.instrs[**def].kind, InstrKind::Parameter { .. }))
            .count()
    }

    fn make_temporary(&mut self, kind: RegisterKind) -> LiveRangeId {
        let repr = match kind {
            RegisterKind::Cpu => Representation::Untagged,
            RegisterKind::Fpu => Representation::Double,
        };
        self.ranges.push(LiveRange::new(RangeOwner::Temporary, repr))
    }

    /// Keeps `location` unavailable to the allocator during `[from, to)`.
    fn block_location(&mut self, location: Location<TM>, from: u32, to: u32) {
        let (kind, code) = match location {
            Location::Register(reg) => (RegisterKind::Cpu, reg.code()),
            Location::FpuRegister(reg) => (RegisterKind::Fpu, reg.code()),
            other => unreachable!("cannot block {other}"),
        };
        let blocked = match kind {
            RegisterKind::Cpu => TM::Reg::from_code(code).is_blocked(),
            RegisterKind::Fpu => TM::FpuReg::from_code(code).is_blocked(),
        };
        if blocked {
            return;
        }
        let existing = match kind {
            RegisterKind::Cpu => self.cpu_blocking_ranges[code],
            RegisterKind::Fpu => self.fpu_blocking_ranges[code],
        };
        let range = match existing {
            Some(range) => range,
            None => {
                let range = self
                    .ranges
                    .push(LiveRange::new(RangeOwner::Blocking, Representation::Untagged));
                match kind {
                    RegisterKind::Cpu => self.cpu_blocking_ranges[code] = Some(range),
                    RegisterKind::Fpu => self.fpu_blocking_ranges[code] = Some(range),
                }
                range
            }
        };
        self.ranges[range].add_use_interval(from, to);
    }

    /// Attaches every recorded safepoint covered by `range`.
    pub(super) fn assign_safepoints(&mut self, def: Option<InstrId>, range: LiveRangeId) {
        let spills_to_constant = self.ranges[range].spill_slot.is_constant();
        for index in (0..self.safepoints.len()).rev() {
            let instr = self.safepoints[index];
            if Some(instr) == def {
                continue;
            }
            // Constants are rematerialized after calls.
            if spills_to_constant && self.graph.instrs[instr].locs.always_calls() {
                continue;
            }
            let pos = self.position_of(instr);
            if self.ranges[range].end() <= pos {
                break;
            }
            if self.ranges[range].contains(pos) {
                self.ranges[range].add_safepoint(pos, instr);
            }
        }
    }

    /// Adds a move to the parallel move at `pos`, creating it if needed.
    ///
    /// Even positions place the move before the instruction, odd positions after it.
    pub(super) fn add_move_at(&mut self, pos: u32, to: Location<TM>, from: Location<TM>) -> MoveOperands {
        assert!(pos >= NORMAL_ENTRY_POS, "cannot insert a move at {pos}, before the function entry");
        debug_assert!(!self.numbering.is_block_entry(pos), "cannot insert a move at block entry {pos}");
        let bb = self.numbering.block_entry_at(pos);
        let index = match self.numbering.instruction_at(pos) {
            PositionOwner::Block(_) => self.parallel_move_after(bb, None, pos),
            PositionOwner::Instr(instr) if is_instruction_start(pos) => self.parallel_move_before(bb, instr, pos),
            PositionOwner::Instr(instr) => self.parallel_move_after(bb, Some(instr), pos),
        };
        trace!("Adding move {to} <- {from} at {pos}");
        let instr = self.graph.blocks[bb].instructions[index];
        let graph = &mut *self.graph;
        let parallel_move = graph.instrs[instr]
            .parallel_move_mut()
            .expect("moves are only added to parallel moves");
        FlowGraph::add_move(&mut graph.locations, parallel_move, to, from)
    }

    fn is_parallel_move_at(&self, instr: InstrId, pos: u32) -> bool {
        let instr = &self.graph.instrs[instr];
        instr.is_parallel_move() && instr.pos == Some(pos)
    }

    fn parallel_move_before(&mut self, bb: BasicBlockId, instr: InstrId, pos: u32) -> usize {
        let instructions = &self.graph.blocks[bb].instructions;
        let index = instructions
            .iter()
            .position(|id| *id == instr)
            .unwrap_or_else(|| panic!("{instr} is not in {bb}"));
        if index > 0 && self.is_parallel_move_at(instructions[index - 1], pos) {
            return index - 1;
        }
        self.insert_parallel_move(bb, index, pos)
    }

    fn parallel_move_after(&mut self, bb: BasicBlockId, instr: Option<InstrId>, pos: u32) -> usize {
        let instructions = &self.graph.blocks[bb].instructions;
        let next = match instr {
            None => 0,
            Some(instr) => {
                instructions
                    .iter()
                    .position(|id| *id == instr)
                    .unwrap_or_else(|| panic!("{instr} is not in {bb}"))
                    + 1
            }
        };
        if let Some(next_instr) = instructions.get(next) {
            if self.is_parallel_move_at(*next_instr, pos) {
                return next;
            }
        }
        self.insert_parallel_move(bb, next, pos)
    }

    fn insert_parallel_move(&mut self, bb: BasicBlockId, index: usize, pos: u32) -> usize {
        let mut instr = Instr::new(InstrKind::ParallelMove(ParallelMove::default()));
        instr.pos = Some(pos);
        let instr = self.graph.instrs.push(instr);
        self.graph.blocks[bb].instructions.insert(index, instr);
        trace!("Inserted parallel move {instr} at {pos} in {bb}");
        index
    }
}
