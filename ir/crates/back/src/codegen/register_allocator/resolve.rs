use std::hash::BuildHasherDefault;

use indexmap::IndexMap;
use rustc_hash::FxHasher;
use tracing::{
    debug,
    trace,
};

use crate::codegen::{
    machine::{
        function::BasicBlockId,
        instr::ParallelMove,
        FlowGraph,
        InstrKind,
        Location,
        TargetMachine,
        Vreg,
    },
    register_allocator::{
        live_range::LiveRangeId,
        FlowGraphAllocator,
    },
};

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

impl<TM: TargetMachine> FlowGraphAllocator<'_, TM> {
    /// Inserts the moves that connect split siblings, both inside blocks and
    /// across control flow edges, and stores spilled values at their definition.
    pub(super) fn resolve_control_flow(&mut self) {
        debug!("Resolving control flow");
        self.connect_split_siblings();
        self.resolve_edges();
        self.emit_spill_stores();
    }

    fn connect_split_siblings(&mut self) {
        let parents: Vec<LiveRangeId> = self.value_ranges.iter().flatten().copied().collect();
        for parent in parents {
            let spill_slot = self.ranges[parent].spill_slot;
            let mut range = parent;
            while let Some(sibling) = self.ranges[range].next_sibling {
                let (from, to) = (self.ranges[range].assigned, self.ranges[sibling].assigned);
                let end = self.ranges[range].end();
                if end == self.ranges[sibling].start() && to != spill_slot && from != to && !self.numbering.is_block_entry(end) {
                    self.add_move_at(end, to, from);
                }
                range = sibling;
            }
        }
    }

    /// The sibling of `parent` that covers `pos`.
    fn find_cover(&self, parent: LiveRangeId, pos: u32) -> LiveRangeId {
        self.siblings(parent)
            .find(|sibling| self.ranges[*sibling].can_cover(pos))
            .unwrap_or_else(|| panic!("no sibling of {} covers {pos}", self.ranges[parent]))
    }

    fn resolve_edges(&mut self) {
        let block_order = self.graph.block_order().to_vec();
        for block in block_order.into_iter().skip(1) {
            let preds = self.graph.blocks[block].preds.clone();
            let block_start = self.graph.blocks[block].start_pos;
            // Moves that are the same on every incoming edge and may be sunk into the block.
            let mut pending: FxIndexMap<Location<TM>, Location<TM>> = FxIndexMap::default();
            let live_in: Vec<usize> = self.liveness.live_in(block).iter_ones().collect();
            for vreg in live_in {
                let Some(parent) = self.value_ranges[Vreg::new(vreg)] else {
                    continue;
                };
                if self.ranges[parent].next_sibling.is_none() {
                    continue;
                }
                let dst = self.ranges[self.find_cover(parent, block_start)].assigned;
                // Spilled values are stored eagerly, the slot is already up to date.
                if dst == self.ranges[parent].spill_slot {
                    continue;
                }
                let sources: Vec<Location<TM>> = preds
                    .iter()
                    .map(|pred| {
                        let pred_end = self.graph.blocks[*pred].end_pos;
                        self.ranges[self.find_cover(parent, pred_end - 1)].assigned
                    })
                    .collect();
                trace!("{} enters {block} in {dst} from {sources:?}", Vreg::new(vreg));
                let all_equal = sources.iter().all(|src| *src == sources[0]);
                if preds.len() > 1 && all_equal {
                    if dst != sources[0] {
                        pending.insert(dst, sources[0]);
                    }
                } else {
                    for (pred, src) in preds.iter().zip(sources) {
                        if dst != src {
                            self.emit_move_on_edge(block, *pred, dst, src);
                        }
                    }
                }
            }
            if !pending.is_empty() {
                self.sink_pending_moves(block, &preds, &pending);
            }
        }
    }

    /// Emits the pending moves of `block` at its entry when no predecessor
    /// overwrites their source, and on every incoming edge otherwise.
    fn sink_pending_moves(
        &mut self,
        block: BasicBlockId,
        preds: &[BasicBlockId],
        pending: &FxIndexMap<Location<TM>, Location<TM>>,
    ) {
        let clobbered_by_preds: Vec<Location<TM>> = preds
            .iter()
            .filter_map(|pred| self.graph.goto_of(*pred))
            .filter_map(|goto| self.graph.instrs[goto].parallel_move())
            .flat_map(|parallel_move| parallel_move.moves.iter())
            .map(|mov| self.graph.location(mov.dest))
            .collect();
        let mut can_sink: Vec<bool> = pending
            .values()
            .map(|src| !clobbered_by_preds.contains(src))
            .collect();
        let mut changed = true;
        while changed {
            changed = false;
            for (index, src) in pending.values().enumerate() {
                if !can_sink[index] {
                    continue;
                }
                let clobbered = pending
                    .keys()
                    .enumerate()
                    .any(|(other, dst)| !can_sink[other] && dst == src);
                if clobbered {
                    can_sink[index] = false;
                    changed = true;
                }
            }
        }

        for ((dst, src), sink) in pending.iter().zip(can_sink) {
            if sink {
                trace!("Sinking {dst} <- {src} into {block}");
                let graph = &mut *self.graph;
                FlowGraph::add_move(&mut graph.locations, graph.blocks[block].entry_move_mut(), *dst, *src);
            } else {
                for pred in preds {
                    self.emit_move_on_edge(block, *pred, *dst, *src);
                }
            }
        }
    }

    /// Places a move on the edge `pred -> succ`: in the predecessor's goto when
    /// it has a single successor, otherwise at the entry of `succ`.
    fn emit_move_on_edge(&mut self, succ: BasicBlockId, pred: BasicBlockId, dst: Location<TM>, src: Location<TM>) {
        trace!("Moving {dst} <- {src} on edge {pred} -> {succ}");
        let graph = &mut *self.graph;
        let goto = (pred != graph.graph_entry)
            .then(|| graph.goto_of(pred))
            .flatten();
        let parallel_move = match goto {
            Some(goto) => match &mut graph.instrs[goto].kind {
                InstrKind::Goto { parallel_move, .. } => parallel_move.get_or_insert_with(ParallelMove::default),
                _ => unreachable!("{goto} is not a goto"),
            },
            None => graph.blocks[succ].entry_move_mut(),
        };
        FlowGraph::add_move(&mut graph.locations, parallel_move, dst, src);
    }

    fn emit_spill_stores(&mut self) {
        for parent in self.spilled.clone() {
            let (assigned, spill_slot) = (self.ranges[parent].assigned, self.ranges[parent].spill_slot);
            if assigned == spill_slot {
                continue;
            }
            let start = self.ranges[parent].start();
            trace!("Storing {} to {spill_slot} at its definition", self.ranges[parent]);
            if start == 0 {
                // Defined in the graph entry, stored alongside the moves into the normal entry.
                let graph = &mut *self.graph;
                let entry = graph.normal_entry;
                FlowGraph::add_move(&mut graph.locations, graph.blocks[entry].entry_move_mut(), spill_slot, assigned);
                continue;
            }
            self.add_move_at(start + 1, spill_slot, assigned);
        }
    }
}
