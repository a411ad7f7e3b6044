use smallvec::SmallVec;
use tracing::debug;

use crate::codegen::machine::{
    abi::CallingConvention,
    function::{
        BasicBlock,
        BasicBlockId,
        BlockKind,
        FlowGraph,
        Value,
    },
    instr::{
        Environment,
        InstrKind,
        OperandSlots,
        SpecialParameterKind,
    },
    ContainsCall,
    Instr,
    InstrId,
    Location,
    Representation,
    TargetMachine,
    Vreg,
};

/// Incrementally constructs a [`FlowGraph`].
///
/// The graph entry and the function entry are created up front. Constants
/// live in the graph entry, parameters in the function entry.
#[derive(Debug)]
pub struct Builder<TM: TargetMachine> {
    graph: FlowGraph<TM>,
    phi_inputs: Vec<(Vreg, BasicBlockId, Vreg)>,
}

impl<TM: TargetMachine> Default for Builder<TM> {
    fn default() -> Self {
        Self::new()
    }
}

impl<TM: TargetMachine> Builder<TM> {
    pub fn new() -> Self {
        let graph_entry = BasicBlockId::new(0);
        let normal_entry = BasicBlockId::new(1);
        let mut graph = FlowGraph::new(graph_entry, normal_entry);
        graph.blocks.push(BasicBlock::new(graph_entry, BlockKind::GraphEntry));
        graph.blocks.push(BasicBlock::new(normal_entry, BlockKind::FunctionEntry));
        let mut builder = Self {
            graph,
            phi_inputs: Vec::new(),
        };
        builder.add_edge(graph_entry, normal_entry);
        builder
    }

    pub fn entry(&self) -> BasicBlockId {
        self.graph.normal_entry
    }

    pub fn graph_entry(&self) -> BasicBlockId {
        self.graph.graph_entry
    }

    pub fn create_block(&mut self) -> BasicBlockId {
        let id = self.graph.blocks.next_idx();
        self.graph.blocks.push(BasicBlock::new(id, BlockKind::Block))
    }

    /// A block entered from the runtime when an exception is thrown.
    pub fn catch_entry(&mut self) -> BasicBlockId {
        let id = self.graph.blocks.next_idx();
        self.graph.blocks.push(BasicBlock::new(id, BlockKind::CatchEntry));
        self.graph.catch_entries.push(id);
        self.add_edge(self.graph.graph_entry, id);
        id
    }

    fn add_edge(&mut self, from: BasicBlockId, to: BasicBlockId) {
        self.graph.blocks[from].succs.push(to);
        self.graph.blocks[to].preds.push(from);
    }

    fn push_instr(&mut self, instr: Instr, repr: Option<Representation>) -> (InstrId, Option<Vreg>) {
        let instr_id = self.graph.instrs.push(instr);
        let output = repr.map(|repr| {
            let vreg = self.graph.values.push(Value { repr, def: instr_id });
            if repr.is_pair() {
                self.graph.values.push(Value { repr, def: instr_id });
            }
            vreg
        });
        self.graph.instrs[instr_id].output = output;
        (instr_id, output)
    }

    fn initial_definition(&mut self, block: BasicBlockId, kind: InstrKind, repr: Representation) -> Vreg {
        let (instr_id, vreg) = self.push_instr(Instr::new(kind), Some(repr));
        self.graph.blocks[block].initial_definitions.push(instr_id);
        vreg.expect("initial definitions define a value")
    }

    /// The next incoming argument of the function.
    pub fn parameter(&mut self, repr: Representation) -> Vreg {
        assert!(!repr.is_pair(), "pair parameters are not supported");
        let entry = self.graph.normal_entry;
        let index = self.graph.blocks[entry]
            .initial_definitions
            .iter()
            .filter(|instr| matches!(self.graph.instrs[**instr].kind, InstrKind::Parameter { .. }))
            .count();
        self.initial_definition(entry, InstrKind::Parameter { index }, repr)
    }

    /// A local restored at a catch entry. Lives in reserved spill slot `index`.
    pub fn catch_parameter(&mut self, catch_entry: BasicBlockId, index: usize, repr: Representation) -> Vreg {
        self.initial_definition(catch_entry, InstrKind::Parameter { index }, repr)
    }

    /// A constant the runtime materializes in the catch entry's spill area.
    pub fn catch_constant(&mut self, catch_entry: BasicBlockId, value: i64) -> Vreg {
        self.initial_definition(catch_entry, InstrKind::Constant(value), Representation::Tagged)
    }

    pub fn special_parameter(&mut self, block: BasicBlockId, kind: SpecialParameterKind) -> Vreg {
        self.initial_definition(block, InstrKind::SpecialParameter(kind), Representation::Tagged)
    }

    pub fn constant(&mut self, value: i64, repr: Representation) -> Vreg {
        let graph_entry = self.graph.graph_entry;
        self.initial_definition(graph_entry, InstrKind::Constant(value), repr)
    }

    /// A constant materialized into a register inside `block`.
    pub fn unboxed_constant(&mut self, block: BasicBlockId, value: i64, repr: Representation) -> Vreg {
        self.op(block, "UnboxedConstant")
            .kind(InstrKind::Constant(value))
            .output(repr, Location::requires_register())
            .value()
    }

    pub fn op(&mut self, block: BasicBlockId, name: &'static str) -> OpBuilder<'_, TM> {
        OpBuilder {
            builder: self,
            block,
            instr: Instr::new(InstrKind::Op(name)),
            inputs: SmallVec::new(),
            temps: SmallVec::new(),
            output: None,
            env: None,
        }
    }

    pub fn phi(&mut self, block: BasicBlockId, repr: Representation) -> Vreg {
        let (instr_id, vreg) = self.push_instr(Instr::new(InstrKind::Phi), Some(repr));
        self.graph.blocks[block].phis.push(instr_id);
        vreg.expect("phis define a value")
    }

    /// Records that `value` flows into `phi` along the edge from `pred`.
    pub fn phi_input(&mut self, phi: Vreg, pred: BasicBlockId, value: Vreg) {
        self.phi_inputs.push((phi, pred, value));
    }

    pub fn goto(&mut self, from: BasicBlockId, to: BasicBlockId) {
        let (instr_id, _) = self.push_instr(
            Instr::new(InstrKind::Goto {
                target: to,
                parallel_move: None,
            }),
            None,
        );
        self.graph.blocks[from].instructions.push(instr_id);
        self.add_edge(from, to);
    }

    pub fn branch(&mut self, block: BasicBlockId, condition: Vreg, if_true: BasicBlockId, if_false: BasicBlockId) {
        self.op(block, "Branch")
            .kind(InstrKind::Branch { if_true, if_false })
            .input(condition, Location::requires_register())
            .finish();
        self.add_edge(block, if_true);
        self.add_edge(block, if_false);
    }

    /// Returns `value` in the location the calling convention prescribes.
    pub fn ret(&mut self, block: BasicBlockId, value: Vreg) {
        let repr = self.graph.repr(value);
        self.op(block, "Return")
            .kind(InstrKind::Return)
            .input(value, TM::CallingConvention::return_location(repr))
            .finish();
    }

    pub fn finish(mut self) -> FlowGraph<TM> {
        for block in self.graph.blocks.indices() {
            for phi_index in 0..self.graph.blocks[block].phis.len() {
                let instr_id = self.graph.blocks[block].phis[phi_index];
                let phi = self.graph.instrs[instr_id]
                    .output
                    .expect("phis define a value");
                let inputs = self.graph.blocks[block]
                    .preds
                    .iter()
                    .map(|pred| {
                        self.phi_inputs
                            .iter()
                            .find(|(p, from, _)| *p == phi && from == pred)
                            .map(|(_, _, value)| *value)
                            .unwrap_or_else(|| panic!("phi {phi} has no input for predecessor {pred}"))
                    })
                    .collect();
                self.graph.instrs[instr_id].inputs = inputs;
            }
        }
        self.graph.build_cfg();
        debug!("Built flow graph:\n{}", self.graph);
        self.graph
    }
}

pub struct OpBuilder<'a, TM: TargetMachine> {
    builder: &'a mut Builder<TM>,
    block: BasicBlockId,
    instr: Instr,
    inputs: SmallVec<[(Vreg, Location<TM>); 2]>,
    temps: SmallVec<[Location<TM>; 1]>,
    output: Option<(Representation, Location<TM>)>,
    env: Option<Vec<Vreg>>,
}

impl<'a, TM: TargetMachine> OpBuilder<'a, TM> {
    pub fn kind(mut self, kind: InstrKind) -> Self {
        self.instr.kind = kind;
        self
    }

    pub fn input(mut self, value: Vreg, location: Location<TM>) -> Self {
        self.inputs.push((value, location));
        self
    }

    pub fn temp(mut self, location: Location<TM>) -> Self {
        self.temps.push(location);
        self
    }

    pub fn output(mut self, repr: Representation, location: Location<TM>) -> Self {
        self.output = Some((repr, location));
        self
    }

    pub fn call(mut self, contains_call: ContainsCall) -> Self {
        self.instr.locs.contains_call = contains_call;
        self
    }

    /// Values needed to deoptimize at this instruction.
    pub fn env(mut self, values: &[Vreg]) -> Self {
        self.env = Some(values.to_vec());
        self
    }

    fn operand_slots(graph: &mut FlowGraph<TM>, repr: Representation, location: Location<TM>) -> OperandSlots {
        if repr.is_pair() {
            OperandSlots::Pair(graph.new_slot(location), graph.new_slot(location))
        } else {
            OperandSlots::Single(graph.new_slot(location))
        }
    }

    pub fn finish(self) -> InstrId {
        self.build().0
    }

    /// Finishes the instruction and returns the value it defines.
    pub fn value(self) -> Vreg {
        self.build().1.expect("instruction defines no value")
    }

    fn build(self) -> (InstrId, Option<Vreg>) {
        let Self {
            builder,
            block,
            mut instr,
            inputs,
            temps,
            output,
            env,
        } = self;
        let graph = &mut builder.graph;
        for (value, location) in inputs {
            let repr = graph.repr(value);
            instr.inputs.push(value);
            let slots = Self::operand_slots(graph, repr, location);
            instr.locs.inputs.push(slots);
        }
        for location in temps {
            let slot = graph.new_slot(location);
            instr.locs.temps.push(slot);
        }
        if let Some((repr, location)) = output {
            instr.locs.output = Some(Self::operand_slots(graph, repr, location));
        }
        if let Some(values) = env {
            instr.env = Some(graph.environments.push(Environment {
                values: values.into_iter().collect(),
                locations: Vec::new(),
                outer: None,
            }));
        }
        let (instr_id, vreg) = builder.push_instr(instr, output.map(|(repr, _)| repr));
        builder.graph.blocks[block].instructions.push(instr_id);
        (instr_id, vreg)
    }
}
