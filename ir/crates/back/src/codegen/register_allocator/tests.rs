use rustc_hash::{
    FxHashMap,
    FxHashSet,
};
use tracing_test::traced_test;

use crate::codegen::{
    machine::{
        abi::CallingConvention,
        function::BasicBlockId,
        instr::{
            ParallelMove,
            SpecialParameterKind,
        },
        ContainsCall,
        FlowGraph,
        Instr,
        InstrId,
        InstrKind,
        Location,
        PhysicalRegister,
        Policy,
        RegisterKind,
        Representation,
        StackSlot,
        TargetMachine,
        Vreg,
    },
    register_allocator::{
        live_range::first_intersection,
        AllocationError,
        AllocatorConfig,
        FlowGraphAllocator,
        RangeOwner,
        MAX_POSITION,
        NORMAL_ENTRY_POS,
    },
    targets::x86_64::{
        Register,
        Target,
    },
};

type Builder = crate::codegen::machine::function::Builder<Target>;

/// Machine state along one path: which value each location holds.
type State = FxHashMap<Location<Target>, Vreg>;

fn read(state: &State, location: Location<Target>) -> Option<Vreg> {
    match location {
        Location::Constant(vreg) => Some(vreg),
        other => state.get(&other).copied(),
    }
}

/// Executes `parallel_move` with parallel semantics. The first moves are the
/// phi moves given as `(input, phi)` pairs and must read the phi input.
fn run_parallel_move(graph: &FlowGraph<Target>, state: &mut State, parallel_move: &ParallelMove, phi_moves: &[(Vreg, Vreg)]) {
    let values: Vec<Option<Vreg>> = parallel_move
        .moves
        .iter()
        .enumerate()
        .map(|(index, mov)| {
            let src = graph.location(mov.src);
            let value = read(state, src);
            match phi_moves.get(index) {
                Some((input, phi)) => {
                    assert_eq!(value, Some(*input), "phi move reads {src}");
                    Some(*phi)
                }
                None => value,
            }
        })
        .collect();
    for (mov, value) in parallel_move.moves.iter().zip(values) {
        let dest = graph.location(mov.dest);
        assert!(
            dest.is_machine_register() || dest.is_stack_slot(),
            "move into unallocated location {dest}"
        );
        match value {
            Some(value) => state.insert(dest, value),
            None => state.remove(&dest),
        };
    }
}

fn phi_moves(graph: &FlowGraph<Target>, pred: BasicBlockId, succ: BasicBlockId) -> Vec<(Vreg, Vreg)> {
    let pred_index = graph.blocks[succ]
        .preds
        .iter()
        .position(|p| *p == pred)
        .expect("edge exists");
    let mut moves = Vec::new();
    for phi in &graph.blocks[succ].phis {
        let instr = &graph.instrs[*phi];
        let (input, output) = (instr.inputs[pred_index], instr.output.expect("phis define a value"));
        moves.push((input, output));
        if graph.repr(output).is_pair() {
            moves.push((input.second_of_pair(), output.second_of_pair()));
        }
    }
    moves
}

fn check_operand(graph: &FlowGraph<Target>, state: &State, instr: &Instr, location: Location<Target>, vreg: Vreg) {
    assert_eq!(read(state, location), Some(vreg), "`{instr}` expects {vreg} in {location}");
}

fn execute(graph: &FlowGraph<Target>, state: &mut State, instr: &Instr) {
    for (input, slots) in instr.inputs.iter().zip(&instr.locs.inputs) {
        for (slot, vreg) in slots.iter().zip([*input, input.second_of_pair()]) {
            check_operand(graph, state, instr, graph.location(slot), vreg);
        }
    }
    let mut env = instr.env;
    while let Some(env_id) = env {
        let environment = &graph.environments[env_id];
        for (value, slots) in environment.values.iter().zip(&environment.locations) {
            for (slot, vreg) in slots.iter().zip([*value, value.second_of_pair()]) {
                check_operand(graph, state, instr, graph.location(slot), vreg);
            }
        }
        env = environment.outer;
    }
    for temp in &instr.locs.temps {
        state.remove(&graph.location(*temp));
    }
    if instr.locs.always_calls() && !instr.locs.callee_safe_call() {
        state.retain(|location, _| !location.is_machine_register());
    }
    if let (Some(output), Some(slots)) = (instr.output, instr.locs.output) {
        for (slot, vreg) in slots.iter().zip([output, output.second_of_pair()]) {
            let location = graph.location(slot);
            if location.is_invalid() {
                continue;
            }
            assert!(
                location.is_machine_register() || location.is_stack_slot(),
                "`{instr}` defines {vreg} in {location}"
            );
            state.insert(location, vreg);
        }
    }
}

/// Walks every control flow edge reachable from the normal entry once and
/// checks that each operand finds the value it expects.
fn simulate(graph: &FlowGraph<Target>) {
    let entry = graph.normal_entry;
    let mut state = State::default();
    let parameters: Vec<(usize, Vreg)> = graph.blocks[entry]
        .initial_definitions
        .iter()
        .filter_map(|def| match graph.instrs[*def].kind {
            InstrKind::Parameter { index } => Some((index, graph.instrs[*def].output?)),
            _ => None,
        })
        .collect();
    for (index, vreg) in &parameters {
        let location =
            <Target as TargetMachine>::CallingConvention::parameter_location(*index, parameters.len(), graph.repr(*vreg));
        state.insert(location, *vreg);
    }
    for def in &graph.blocks[graph.graph_entry].initial_definitions {
        let instr = &graph.instrs[*def];
        let (InstrKind::SpecialParameter(kind), Some(vreg)) = (&instr.kind, instr.output) else {
            continue;
        };
        let reg = match kind {
            SpecialParameterKind::ArgumentsDescriptor => Target::arguments_descriptor_reg(),
            SpecialParameterKind::Exception => Target::exception_reg(),
            SpecialParameterKind::StackTrace => Target::stack_trace_reg(),
        };
        state.insert(Location::Register(reg), vreg);
    }

    let mut visited_edges = FxHashSet::default();
    let mut worklist = vec![(entry, state)];
    while let Some((block, mut state)) = worklist.pop() {
        if let Some(entry_move) = &graph.blocks[block].entry_move {
            run_parallel_move(graph, &mut state, entry_move, &[]);
        }
        for instr_id in &graph.blocks[block].instructions {
            let instr = &graph.instrs[*instr_id];
            match &instr.kind {
                InstrKind::ParallelMove(parallel_move) => run_parallel_move(graph, &mut state, parallel_move, &[]),
                InstrKind::Goto {
                    target,
                    parallel_move: Some(parallel_move),
                } => {
                    let phi_moves = phi_moves(graph, block, *target);
                    run_parallel_move(graph, &mut state, parallel_move, &phi_moves);
                }
                InstrKind::Goto { .. } => {}
                _ => execute(graph, &mut state, instr),
            }
        }
        for succ in &graph.blocks[block].succs {
            if visited_edges.insert((block, *succ)) {
                worklist.push((*succ, state.clone()));
            }
        }
    }
}

/// Ranges sharing a machine register never overlap.
fn assert_no_overlapping_assignments(allocator: &FlowGraphAllocator<'_, Target>) {
    let assigned: Vec<_> = allocator
        .live_ranges()
        .iter()
        .filter(|range| range.owner != RangeOwner::Blocking && range.assigned.is_machine_register())
        .collect();
    for (index, a) in assigned.iter().enumerate() {
        for b in &assigned[index + 1..] {
            if a.assigned == b.assigned {
                assert_eq!(
                    first_intersection(a.intervals(), b.intervals()),
                    MAX_POSITION,
                    "{a} and {b} share {}",
                    a.assigned
                );
            }
        }
    }
}

/// Split siblings follow each other in position order without overlapping.
fn assert_siblings_partition(allocator: &FlowGraphAllocator<'_, Target>) {
    let ranges = allocator.live_ranges();
    for vreg in (0..allocator.graph().max_vreg()).map(Vreg::new) {
        let Some(parent) = allocator.parent_range(vreg) else {
            continue;
        };
        let siblings: Vec<_> = allocator.siblings(parent).collect();
        for pair in siblings.windows(2) {
            let (prev, next) = (&ranges[pair[0]], &ranges[pair[1]]);
            assert_eq!(next.vreg(), Some(vreg));
            assert!(prev.end() <= next.start(), "{prev} overlaps its sibling {next}");
        }
    }
}

/// Every slot of every instruction ended up in a concrete location.
fn assert_fully_allocated(graph: &FlowGraph<Target>) {
    for block in graph.block_order() {
        for instr_id in &graph.blocks[*block].instructions {
            let instr = &graph.instrs[*instr_id];
            for slot in instr.locs.inputs.iter().flat_map(|slots| slots.iter()) {
                let location = graph.location(slot);
                assert!(!location.is_unallocated() && !location.is_invalid(), "`{instr}` reads {location}");
            }
            for temp in &instr.locs.temps {
                assert!(graph.location(*temp).is_machine_register(), "`{instr}` has temp {}", graph.location(*temp));
            }
        }
    }
}

fn def(b: &mut Builder, block: BasicBlockId) -> Vreg {
    b.op(block, "Def")
        .output(Representation::Tagged, Location::requires_register())
        .value()
}

fn use_all(b: &mut Builder, block: BasicBlockId, values: &[Vreg]) -> InstrId {
    values
        .iter()
        .fold(b.op(block, "UseAll"), |op, value| op.input(*value, Location::any()))
        .finish()
}

/// Thirteen values live at once, one more than there are allocatable registers.
fn pressure_graph() -> (FlowGraph<Target>, Vec<Vreg>, InstrId) {
    let mut b = Builder::new();
    let entry = b.entry();
    let values: Vec<Vreg> = (0..13).map(|_| def(&mut b, entry)).collect();
    let user = use_all(&mut b, entry, &values);
    (b.finish(), values, user)
}

#[test]
#[traced_test]
fn spills_the_range_with_the_furthest_use() {
    let (mut graph, values, user) = pressure_graph();
    let mut allocator = FlowGraphAllocator::new(&mut graph, AllocatorConfig::default());
    let summary = allocator.allocate_registers().unwrap();
    assert_eq!(summary.cpu_spill_slot_count, 1);
    assert_eq!(summary.spill_slot_count, 1);
    assert_no_overlapping_assignments(&allocator);
    assert_siblings_partition(&allocator);

    let first = allocator.parent_range(values[0]).unwrap();
    let last = allocator.parent_range(values[12]).unwrap();
    let ranges = allocator.live_ranges();
    assert_eq!(ranges[first].assigned, Location::Register(Register::RAX));
    assert_eq!(ranges[first].spill_slot, Location::Stack(StackSlot::word(-2)));
    assert_eq!(ranges[last].assigned, Location::Register(Register::RAX));

    let graph = allocator.graph();
    let user = &graph.instrs[user];
    assert_eq!(
        graph.location(user.locs.inputs[0].first()),
        Location::Stack(StackSlot::word(-2))
    );
    assert_eq!(
        graph.location(user.locs.inputs[12].first()),
        Location::Register(Register::RAX)
    );
    // The evicted value is stored right after its definition.
    let store = &graph.instrs[graph.blocks[graph.normal_entry].instructions[1]];
    assert_eq!(store.pos, Some(5));
    let parallel_move = store.parallel_move().unwrap();
    assert_eq!(parallel_move.len(), 1);
    assert_eq!(
        graph.location(parallel_move.moves[0].dest),
        Location::Stack(StackSlot::word(-2))
    );
    assert_eq!(graph.location(parallel_move.moves[0].src), Location::Register(Register::RAX));
    assert_fully_allocated(graph);
    simulate(graph);
}

#[test]
#[traced_test]
fn intrinsic_mode_refuses_to_spill() {
    let (mut graph, values, _) = pressure_graph();
    let result = FlowGraphAllocator::new(&mut graph, AllocatorConfig::intrinsic()).allocate_registers();
    assert_eq!(
        result,
        Err(AllocationError::NeedsFallback {
            vreg: Some(values[12]),
            position: 28,
        })
    );
}

#[test]
#[traced_test]
fn phi_moves_are_placed_on_each_incoming_edge() {
    let mut b = Builder::new();
    let entry = b.entry();
    let left = b.create_block();
    let right = b.create_block();
    let join = b.create_block();
    let x = b.parameter(Representation::Tagged);
    b.branch(entry, x, left, right);
    let a = b
        .op(left, "A")
        .input(x, Location::requires_register())
        .output(Representation::Tagged, Location::requires_register())
        .value();
    b.goto(left, join);
    let c = b
        .op(right, "B")
        .output(Representation::Tagged, Location::Register(Register::RAX))
        .value();
    b.goto(right, join);
    let phi = b.phi(join, Representation::Tagged);
    b.phi_input(phi, left, a);
    b.phi_input(phi, right, c);
    b.ret(join, phi);
    let mut graph = b.finish();

    let mut allocator = FlowGraphAllocator::new(&mut graph, AllocatorConfig::default());
    let summary = allocator.allocate_registers().unwrap();
    assert_eq!(summary.spill_slot_count, 0);
    assert_no_overlapping_assignments(&allocator);
    assert_siblings_partition(&allocator);

    let assigned = |vreg: Vreg| allocator.live_ranges()[allocator.parent_range(vreg).unwrap()].assigned;
    let rax = Location::Register(Register::RAX);
    // The phi is hinted towards the return register, `c` towards its fixed output.
    assert_eq!(assigned(phi), rax);
    assert_eq!(assigned(c), rax);
    assert_ne!(assigned(a), rax);

    // One real move where the locations differ, none where they coincide.
    let graph = allocator.graph();
    for (pred, input, expected_moves) in [(left, a, 1), (right, c, 0)] {
        let goto = graph.goto_of(pred).unwrap();
        let parallel_move = graph.instrs[goto].parallel_move().unwrap();
        assert_eq!(graph.location(parallel_move.moves[0].dest), rax);
        assert_eq!(graph.location(parallel_move.moves[0].src), assigned(input));
        let moves = parallel_move
            .moves
            .iter()
            .filter(|mov| graph.location(mov.dest) != graph.location(mov.src))
            .count();
        assert_eq!(moves, expected_moves, "moves on {pred} -> {join}");
    }
    assert_fully_allocated(graph);
    simulate(graph);
}

#[test]
#[traced_test]
fn later_hint_applies_while_the_phi_is_unallocated() {
    let mut b = Builder::new();
    let entry = b.entry();
    let exit = b.create_block();
    let value = def(&mut b, entry);
    b.goto(entry, exit);
    let phi = b.phi(exit, Representation::Tagged);
    b.phi_input(phi, entry, value);
    b.op(exit, "Fixed")
        .input(value, Location::Register(Register::RCX))
        .finish();
    b.ret(exit, phi);
    let mut graph = b.finish();

    let mut allocator = FlowGraphAllocator::new(&mut graph, AllocatorConfig::default());
    allocator.allocate_registers().unwrap();
    assert_no_overlapping_assignments(&allocator);

    // The phi is allocated after `value`, so its hint is skipped for the fixed use.
    let ranges = allocator.live_ranges();
    let value_range = allocator.parent_range(value).unwrap();
    let phi_range = allocator.parent_range(phi).unwrap();
    assert_eq!(ranges[value_range].assigned, Location::Register(Register::RCX));
    assert_eq!(ranges[phi_range].assigned, Location::Register(Register::RAX));
    assert_fully_allocated(allocator.graph());
    simulate(allocator.graph());
}

#[test]
#[traced_test]
fn loop_phi_shares_a_register_with_its_back_edge_input() {
    let mut b = Builder::new();
    let entry = b.entry();
    let header = b.create_block();
    let body = b.create_block();
    let exit = b.create_block();
    let n = b.parameter(Representation::Tagged);
    let zero = b.constant(0, Representation::Tagged);
    b.goto(entry, header);
    let i = b.phi(header, Representation::Tagged);
    let cond = b
        .op(header, "Lt")
        .input(i, Location::requires_register())
        .input(n, Location::any())
        .output(Representation::Tagged, Location::requires_register())
        .value();
    b.branch(header, cond, body, exit);
    let next = b
        .op(body, "Inc")
        .input(i, Location::requires_register())
        .output(Representation::Tagged, Location::Unallocated(Policy::SameAsFirstInput))
        .value();
    b.goto(body, header);
    b.phi_input(i, entry, zero);
    b.phi_input(i, body, next);
    b.ret(exit, i);
    let mut graph = b.finish();

    let mut allocator = FlowGraphAllocator::new(&mut graph, AllocatorConfig::default());
    allocator.allocate_registers().unwrap();
    assert_no_overlapping_assignments(&allocator);
    assert_siblings_partition(&allocator);

    let i_range = allocator.parent_range(i).unwrap();
    let next_range = allocator.parent_range(next).unwrap();
    let ranges = allocator.live_ranges();
    assert!(ranges[i_range].is_loop_phi);
    assert_eq!(ranges[i_range].assigned, ranges[next_range].assigned);

    let graph = allocator.graph();
    let goto = graph.goto_of(body).unwrap();
    let back_edge_move = graph.instrs[goto].parallel_move().unwrap().moves[0];
    assert_eq!(graph.location(back_edge_move.dest), graph.location(back_edge_move.src));
    // The constant flows into the phi straight from its definition.
    let goto = graph.goto_of(entry).unwrap();
    let entry_move = graph.instrs[goto].parallel_move().unwrap().moves[0];
    assert_eq!(graph.location(entry_move.src), Location::Constant(zero));
    assert_fully_allocated(graph);
    simulate(graph);
}

#[test]
#[traced_test]
fn spill_of_loop_invariant_value_is_hoisted_to_the_header() {
    let mut b = Builder::new();
    let entry = b.entry();
    let header = b.create_block();
    let body = b.create_block();
    let exit = b.create_block();
    let k = b.constant(1, Representation::Tagged);
    let x = def(&mut b, entry);
    b.goto(entry, header);
    b.branch(header, k, body, exit);
    let mut values: Vec<Vreg> = (0..11).map(|_| def(&mut b, body)).collect();
    values.push(x);
    use_all(&mut b, body, &values);
    b.goto(body, header);
    b.op(exit, "Use").input(x, Location::any()).finish();
    let mut graph = b.finish();

    let mut allocator = FlowGraphAllocator::new(&mut graph, AllocatorConfig::default());
    let summary = allocator.allocate_registers().unwrap();
    assert_eq!(summary.cpu_spill_slot_count, 1);
    assert_no_overlapping_assignments(&allocator);
    assert_siblings_partition(&allocator);

    let parent = allocator.parent_range(x).unwrap();
    let siblings: Vec<_> = allocator.siblings(parent).collect();
    assert_eq!(siblings.len(), 2);
    let ranges = allocator.live_ranges();
    let graph = allocator.graph();
    let tail = &ranges[siblings[1]];
    assert_eq!(tail.start(), graph.blocks[header].start_pos);
    assert!(tail.assigned.is_stack_slot());
    assert_eq!(tail.assigned, ranges[parent].spill_slot);

    // Stored once before the loop, never inside it.
    let store = &graph.instrs[graph.blocks[entry].instructions[1]];
    let parallel_move = store.parallel_move().unwrap();
    assert_eq!(graph.location(parallel_move.moves[0].dest), ranges[parent].spill_slot);
    assert!(graph.blocks[body]
        .instructions
        .iter()
        .all(|instr| !graph.instrs[*instr].is_parallel_move()));
    assert_fully_allocated(graph);
    simulate(graph);
}

#[test]
#[traced_test]
fn values_live_across_calls_are_spilled_and_tracked_at_safepoints() {
    let mut b = Builder::new();
    let entry = b.entry();
    let tagged = def(&mut b, entry);
    let untagged = b
        .op(entry, "DefUntagged")
        .output(Representation::Untagged, Location::requires_register())
        .value();
    let call = b
        .op(entry, "Call")
        .call(ContainsCall::Call)
        .env(&[tagged, untagged])
        .finish();
    b.op(entry, "Use")
        .input(tagged, Location::requires_register())
        .input(untagged, Location::requires_register())
        .finish();
    let mut graph = b.finish();

    let mut allocator = FlowGraphAllocator::new(&mut graph, AllocatorConfig::default());
    let summary = allocator.allocate_registers().unwrap();
    assert_eq!(summary.cpu_spill_slot_count, 2);
    assert_no_overlapping_assignments(&allocator);
    assert_siblings_partition(&allocator);

    let spill_index = |vreg: Vreg| {
        let parent = allocator.parent_range(vreg).unwrap();
        let slot = allocator.live_ranges()[parent].spill_slot.stack_slot().unwrap();
        Target::FRAME_LAYOUT.spill_index_for_frame_slot(slot.index).unwrap()
    };
    let (tagged_index, untagged_index) = (spill_index(tagged), spill_index(untagged));
    assert_ne!(tagged_index, untagged_index);

    let graph = allocator.graph();
    let locs = &graph.instrs[call].locs;
    assert!(locs.stack_bit(tagged_index));
    assert!(!locs.stack_bit(untagged_index));
    // Registers do not survive the call, nothing to save on a slow path.
    assert!(locs.live_registers.is_empty());
    assert_fully_allocated(graph);
    simulate(graph);
}

#[test]
#[traced_test]
fn slow_path_calls_record_live_registers() {
    let mut b = Builder::new();
    let entry = b.entry();
    let value = def(&mut b, entry);
    let slow = b
        .op(entry, "CheckStack")
        .call(ContainsCall::CallOnSlowPath)
        .finish();
    b.op(entry, "Use")
        .input(value, Location::requires_register())
        .finish();
    let mut graph = b.finish();

    let mut allocator = FlowGraphAllocator::new(&mut graph, AllocatorConfig::default());
    let summary = allocator.allocate_registers().unwrap();
    assert_eq!(summary.spill_slot_count, 0);

    let graph = allocator.graph();
    let live_registers = graph.instrs[slow].locs.live_registers;
    assert!(live_registers.contains(Location::<Target>::Register(Register::RAX)));
    assert!(live_registers.is_tagged(Register::RAX.code()));
    assert_eq!(live_registers.len(RegisterKind::Cpu), 1);
    simulate(graph);
}

#[test]
#[traced_test]
fn catch_parameters_live_in_reserved_slots() {
    let mut b = Builder::new();
    let catch_entry = b.catch_entry();
    let local = b.catch_parameter(catch_entry, 0, Representation::Tagged);
    let marker = b.catch_constant(catch_entry, 7);
    let call = b
        .op(catch_entry, "Call")
        .call(ContainsCall::Call)
        .finish();
    let user = b
        .op(catch_entry, "Use")
        .input(local, Location::any())
        .input(marker, Location::any())
        .finish();
    let mut graph = b.finish();

    let config = AllocatorConfig {
        reserved_catch_slots: 1,
        ..AllocatorConfig::default()
    };
    let summary = FlowGraphAllocator::new(&mut graph, config)
        .allocate_registers()
        .unwrap();
    // The constant occupies the slot matching its position among the entry's definitions.
    assert_eq!(summary.cpu_spill_slot_count, 2);
    let inputs = &graph.instrs[user].locs.inputs;
    assert_eq!(graph.location(inputs[0].first()), Location::Stack(StackSlot::word(-2)));
    assert_eq!(graph.location(inputs[1].first()), Location::Constant(marker));
    assert!(graph.instrs[call].locs.stack_bit(0));
}

#[test]
#[traced_test]
fn untagged_catch_parameters_are_not_marked_at_safepoints() {
    let mut b = Builder::new();
    let catch_entry = b.catch_entry();
    let raw = b.catch_parameter(catch_entry, 0, Representation::Untagged);
    let call = b
        .op(catch_entry, "Call")
        .call(ContainsCall::Call)
        .finish();
    let user = b
        .op(catch_entry, "Use")
        .input(raw, Location::any())
        .finish();
    let mut graph = b.finish();

    let config = AllocatorConfig {
        reserved_catch_slots: 1,
        ..AllocatorConfig::default()
    };
    FlowGraphAllocator::new(&mut graph, config)
        .allocate_registers()
        .unwrap();
    let input = graph.instrs[user].locs.inputs[0].first();
    assert_eq!(graph.location(input), Location::Stack(StackSlot::word(-2)));
    assert!(!graph.instrs[call].locs.stack_bit(0));
}

#[test]
#[traced_test]
fn callee_safe_calls_are_safepoints() {
    let mut b = Builder::new();
    let entry = b.entry();
    let values: Vec<Vreg> = (0..13).map(|_| def(&mut b, entry)).collect();
    let call = b
        .op(entry, "SafeCall")
        .call(ContainsCall::CallCalleeSafe)
        .finish();
    use_all(&mut b, entry, &values);
    let mut graph = b.finish();

    let mut allocator = FlowGraphAllocator::new(&mut graph, AllocatorConfig::default());
    let summary = allocator.allocate_registers().unwrap();
    assert_eq!(summary.cpu_spill_slot_count, 1);
    assert_no_overlapping_assignments(&allocator);
    assert_siblings_partition(&allocator);

    let spilled = allocator.parent_range(values[0]).unwrap();
    assert_eq!(
        allocator.live_ranges()[spilled].spill_slot,
        Location::Stack(StackSlot::word(-2))
    );
    let graph = allocator.graph();
    let locs = &graph.instrs[call].locs;
    assert!(locs.stack_bit(0));
    // The callee preserves every register, so none are recorded.
    assert!(locs.live_registers.is_empty());
    assert_fully_allocated(graph);
    simulate(graph);
}

#[test]
#[traced_test]
fn graph_entry_values_in_registers_are_spilled_on_function_entry() {
    let mut b = Builder::new();
    let entry = b.entry();
    let descriptor = b.special_parameter(b.graph_entry(), SpecialParameterKind::ArgumentsDescriptor);
    let call = b
        .op(entry, "Call")
        .call(ContainsCall::Call)
        .finish();
    b.op(entry, "Use")
        .input(descriptor, Location::requires_register())
        .finish();
    let mut graph = b.finish();

    let mut allocator = FlowGraphAllocator::new(&mut graph, AllocatorConfig::default());
    let summary = allocator.allocate_registers().unwrap();
    assert_eq!(summary.cpu_spill_slot_count, 1);
    assert_no_overlapping_assignments(&allocator);
    assert_siblings_partition(&allocator);

    // The incoming register holds the value for the whole graph entry.
    let parent = allocator.parent_range(descriptor).unwrap();
    let siblings: Vec<_> = allocator.siblings(parent).collect();
    let ranges = allocator.live_ranges();
    let r10 = Location::Register(Register::R10);
    assert_eq!(ranges[parent].assigned, r10);
    assert_eq!(ranges[siblings[1]].start(), NORMAL_ENTRY_POS);
    let spill_slot = ranges[parent].spill_slot;
    assert_eq!(spill_slot, Location::Stack(StackSlot::word(-2)));

    let graph = allocator.graph();
    let entry_move = graph.blocks[entry].entry_move.as_ref().unwrap();
    assert!(entry_move
        .moves
        .iter()
        .any(|mov| graph.location(mov.dest) == spill_slot && graph.location(mov.src) == r10));
    assert!(graph.instrs[call].locs.stack_bit(0));
    assert_fully_allocated(graph);
    simulate(graph);
}
