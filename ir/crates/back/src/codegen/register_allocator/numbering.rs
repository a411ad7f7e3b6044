use bitvec::vec::BitVec;
use index_vec::IndexVec;
use rustc_hash::FxHashMap;
use tracing::{
    debug,
    trace,
};

use crate::codegen::{
    machine::{
        function::{
            BasicBlockId,
            LoopId,
        },
        instr::{
            InstrKind,
            ParallelMove,
        },
        FlowGraph,
        InstrId,
        Location,
        TargetMachine,
        Vreg,
    },
    register_allocator::live_range::is_instruction_start,
};

/// What occupies a pair of lifetime positions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PositionOwner {
    Block(BasicBlockId),
    Instr(InstrId),
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Header of the innermost loop that linearly encloses this block.
    pub loop_header: Option<BasicBlockId>,
    pub is_loop_header: bool,
}

#[derive(Debug, Clone)]
pub struct ExtraLoopInfo {
    /// Start of the header.
    pub start: u32,
    /// End of the last back edge block.
    pub end: u32,
    /// Values flowing into the header across a back edge, computed while
    /// building live ranges.
    pub backedge_interference: Option<BitVec>,
}

#[derive(Debug, Default, Clone)]
pub struct Numbering {
    instructions: Vec<PositionOwner>,
    block_entries: Vec<BasicBlockId>,
    block_info: IndexVec<BasicBlockId, BlockInfo>,
    pub extra_loop_info: IndexVec<LoopId, ExtraLoopInfo>,
}

impl Numbering {
    /// Assigns lifetime positions to blocks and instructions in block order
    /// and creates empty phi moves in the gotos of join predecessors.
    pub fn number_instructions<TM: TargetMachine>(graph: &mut FlowGraph<TM>) -> Self {
        debug!("Numbering instructions");
        let block_order = graph.block_order().to_vec();
        let mut numbering = Self {
            instructions: Vec::new(),
            block_entries: Vec::new(),
            block_info: index_vec::index_vec![BlockInfo::default(); graph.blocks.len()],
            extra_loop_info: IndexVec::new(),
        };
        let mut pos = 0;
        for bb in &block_order {
            numbering.instructions.push(PositionOwner::Block(*bb));
            numbering.block_entries.push(*bb);
            graph.blocks[*bb].start_pos = pos;
            pos += 2;
            for instr_id in graph.blocks[*bb].instructions.clone() {
                if graph.instrs[instr_id].is_parallel_move() {
                    continue;
                }
                numbering.instructions.push(PositionOwner::Instr(instr_id));
                numbering.block_entries.push(*bb);
                graph.instrs[instr_id].pos = Some(pos);
                pos += 2;
            }
            graph.blocks[*bb].end_pos = pos;
            trace!("{bb} spans [{}, {pos})", graph.blocks[*bb].start_pos);
        }

        for bb in &block_order {
            if graph.blocks[*bb].phis.is_empty() {
                continue;
            }
            let move_count: usize = graph.blocks[*bb]
                .phis
                .iter()
                .map(|phi| {
                    let vreg = graph.instrs[*phi].output.expect("phis define a value");
                    if graph.repr(vreg).is_pair() {
                        2
                    } else {
                        1
                    }
                })
                .sum();
            for pred in graph.blocks[*bb].preds.clone() {
                let goto = graph
                    .goto_of(pred)
                    .unwrap_or_else(|| panic!("predecessor {pred} of join {bb} does not end in a goto"));
                let InstrKind::Goto {
                    parallel_move: existing, ..
                } = &mut graph.instrs[goto].kind
                else {
                    unreachable!("{goto} is not a goto");
                };
                let existing = existing.take().unwrap_or_default();
                // Phi moves come first, the edge keeps the moves it already had.
                let mut parallel_move = ParallelMove::default();
                for _ in 0..move_count {
                    FlowGraph::add_move(
                        &mut graph.locations,
                        &mut parallel_move,
                        Location::Invalid,
                        Location::Invalid,
                    );
                }
                parallel_move.moves.extend(existing.moves);
                if let InstrKind::Goto {
                    parallel_move: slot, ..
                } = &mut graph.instrs[goto].kind
                {
                    *slot = Some(parallel_move);
                }
            }
        }

        numbering.compute_block_info(graph, &block_order);
        numbering
    }

    fn compute_block_info<TM: TargetMachine>(&mut self, graph: &FlowGraph<TM>, block_order: &[BasicBlockId]) {
        let cfg = graph.cfg();
        for info in cfg.loops() {
            let start = graph.blocks[info.header].start_pos;
            let end = info
                .back_edges
                .iter()
                .map(|back_edge| graph.blocks[*back_edge].end_pos)
                .max()
                .unwrap_or(start);
            self.extra_loop_info.push(ExtraLoopInfo {
                start,
                end,
                backedge_interference: None,
            });
        }
        // Outer headers come first in block order, so inner loops overwrite
        // the enclosing header of the blocks they cover.
        for (index, bb) in block_order.iter().enumerate() {
            let Some(loop_id) = cfg.loop_with_header(*bb) else {
                continue;
            };
            self.block_info[*bb].is_loop_header = true;
            let end = self.extra_loop_info[loop_id].end;
            for inner in &block_order[index + 1..] {
                if graph.blocks[*inner].start_pos >= end {
                    break;
                }
                self.block_info[*inner].loop_header = Some(*bb);
            }
        }
    }

    pub fn instruction_at(&self, pos: u32) -> PositionOwner {
        self.instructions[(pos / 2) as usize]
    }

    pub fn block_entry_at(&self, pos: u32) -> BasicBlockId {
        self.block_entries[(pos / 2) as usize]
    }

    pub fn is_block_entry(&self, pos: u32) -> bool {
        is_instruction_start(pos) && matches!(self.instruction_at(pos), PositionOwner::Block(_))
    }

    pub fn block_info(&self, bb: BasicBlockId) -> BlockInfo {
        self.block_info[bb]
    }

    /// One past the last valid position.
    pub fn max_position(&self) -> u32 {
        (self.instructions.len() * 2) as u32
    }
}

/// For each phi, the values that may flow into it, directly or through other phis.
#[derive(Debug, Default, Clone)]
pub struct ReachingDefs {
    reaching: FxHashMap<Vreg, BitVec>,
}

impl ReachingDefs {
    pub fn get<TM: TargetMachine>(&mut self, graph: &FlowGraph<TM>, phi: Vreg) -> &BitVec {
        if !self.reaching.contains_key(&phi) {
            self.compute(graph, phi);
        }
        &self.reaching[&phi]
    }

    fn phi_inputs<TM: TargetMachine>(graph: &FlowGraph<TM>, phi: Vreg) -> impl Iterator<Item = Vreg> + '_ {
        graph.def(phi).inputs.iter().copied()
    }

    fn is_phi<TM: TargetMachine>(graph: &FlowGraph<TM>, vreg: Vreg) -> bool {
        matches!(graph.def(vreg).kind, InstrKind::Phi)
    }

    fn compute<TM: TargetMachine>(&mut self, graph: &FlowGraph<TM>, phi: Vreg) {
        let mut pending = vec![phi];
        let mut index = 0;
        while index < pending.len() {
            let current = pending[index];
            index += 1;
            if self.reaching.contains_key(&current) {
                continue;
            }
            let mut defs = BitVec::repeat(false, graph.max_vreg());
            for input in Self::phi_inputs(graph, current) {
                defs.set(input.index(), true);
                if graph.repr(current).is_pair() {
                    defs.set(input.second_of_pair().index(), true);
                }
                if Self::is_phi(graph, input) {
                    pending.push(input);
                }
            }
            self.reaching.insert(current, defs);
        }
        let mut changed = true;
        while changed {
            changed = false;
            for current in &pending {
                for input in Self::phi_inputs(graph, *current) {
                    if !Self::is_phi(graph, input) || input == *current {
                        continue;
                    }
                    let incoming: Vec<usize> = self.reaching[&input].iter_ones().collect();
                    let defs = self
                        .reaching
                        .get_mut(current)
                        .expect("reaching defs of pending phis are initialized");
                    for vreg in incoming {
                        if !defs[vreg] {
                            defs.set(vreg, true);
                            changed = true;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;
    use super::LoopId;

    use super::{
        Numbering,
        PositionOwner,
        ReachingDefs,
    };
    use crate::codegen::{
        machine::{
            function::Builder,
            instr::ParallelMove,
            FlowGraph,
            InstrKind,
            Location,
            Representation,
        },
        targets::x86_64::{
            Register,
            Target,
        },
    };

    #[test]
    #[traced_test]
    fn positions_follow_block_order() {
        let mut b = Builder::<Target>::new();
        let entry = b.entry();
        let exit = b.create_block();
        let x = b.parameter(Representation::Tagged);
        let y = b
            .op(entry, "Neg")
            .input(x, Location::requires_register())
            .output(Representation::Tagged, Location::requires_register())
            .value();
        b.goto(entry, exit);
        b.ret(exit, y);
        let mut graph = b.finish();
        let numbering = Numbering::number_instructions(&mut graph);

        assert_eq!(graph.blocks[graph.graph_entry].start_pos, 0);
        assert_eq!(graph.blocks[entry].start_pos, 2);
        let neg = graph.blocks[entry].instructions[0];
        assert_eq!(graph.instrs[neg].pos, Some(4));
        assert_eq!(graph.blocks[entry].end_pos, 8);
        assert_eq!(graph.blocks[exit].start_pos, 8);
        assert_eq!(numbering.instruction_at(5), PositionOwner::Instr(neg));
        assert!(numbering.is_block_entry(8));
        assert!(!numbering.is_block_entry(9));
        assert_eq!(numbering.block_entry_at(11), exit);
    }

    #[test]
    #[traced_test]
    fn joins_get_phi_moves_and_loops_get_spans() {
        let mut b = Builder::<Target>::new();
        let entry = b.entry();
        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();
        let init = b.parameter(Representation::Tagged);
        b.goto(entry, header);
        let phi = b.phi(header, Representation::Tagged);
        let inner = b.phi(header, Representation::Tagged);
        b.branch(header, phi, body, exit);
        b.goto(body, header);
        b.phi_input(phi, entry, init);
        b.phi_input(phi, body, inner);
        b.phi_input(inner, entry, init);
        b.phi_input(inner, body, phi);
        b.ret(exit, phi);
        let mut graph = b.finish();
        let numbering = Numbering::number_instructions(&mut graph);

        for pred in [entry, body] {
            let goto = graph.goto_of(pred).unwrap();
            assert_eq!(graph.instrs[goto].parallel_move().unwrap().len(), 2);
        }
        let info = &numbering.extra_loop_info[LoopId::from_usize(0)];
        assert_eq!(info.start, graph.blocks[header].start_pos);
        assert_eq!(info.end, graph.blocks[body].end_pos);
        assert!(numbering.block_info(header).is_loop_header);
        assert_eq!(numbering.block_info(body).loop_header, Some(header));

        let mut reaching = ReachingDefs::default();
        let defs = reaching.get(&graph, phi);
        assert!(defs[init.index()]);
        assert!(defs[inner.index()]);
        assert!(defs[phi.index()]);
    }

    #[test]
    #[traced_test]
    fn phi_moves_are_prepended_to_moves_already_on_the_edge() {
        let mut b = Builder::<Target>::new();
        let entry = b.entry();
        let exit = b.create_block();
        let x = b.parameter(Representation::Tagged);
        b.goto(entry, exit);
        let phi = b.phi(exit, Representation::Tagged);
        b.phi_input(phi, entry, x);
        b.ret(exit, phi);
        let mut graph = b.finish();

        let goto = graph.goto_of(entry).unwrap();
        let (dest, src) = (Location::Register(Register::RBX), Location::Register(Register::RCX));
        let mut edge_moves = ParallelMove::default();
        FlowGraph::add_move(&mut graph.locations, &mut edge_moves, dest, src);
        if let InstrKind::Goto { parallel_move, .. } = &mut graph.instrs[goto].kind {
            *parallel_move = Some(edge_moves);
        }
        Numbering::number_instructions(&mut graph);

        let parallel_move = graph.instrs[goto].parallel_move().unwrap();
        assert_eq!(parallel_move.len(), 2);
        assert!(graph.location(parallel_move.moves[0].dest).is_invalid());
        assert_eq!(graph.location(parallel_move.moves[1].dest), dest);
        assert_eq!(graph.location(parallel_move.moves[1].src), src);
    }
}
