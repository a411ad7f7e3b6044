use bitvec::vec::BitVec;
use daggy::{
    petgraph::{
        algo::dominators::{
            simple_fast,
            Dominators,
        },
        prelude::{
            DfsPostOrder,
            StableGraph,
        },
        Directed,
        Direction,
    },
    NodeIndex,
};
use index_vec::IndexVec;
use iter_tools::Itertools;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::codegen::machine::{
    instr::ParallelMove,
    InstrId,
};

index_vec::define_index_type! {
    pub struct BasicBlockId = u32;

    DISPLAY_FORMAT = "bb{}";
}

index_vec::define_index_type! {
    pub struct LoopId = u32;

    DISPLAY_FORMAT = "loop{}";
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// Owns the constants of the function. Has no instructions.
    GraphEntry,
    FunctionEntry,
    CatchEntry,
    Block,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BasicBlockId,
    pub kind: BlockKind,
    pub phis: Vec<InstrId>,
    /// Parameters, special parameters and constants defined on entry.
    pub initial_definitions: Vec<InstrId>,
    pub instructions: Vec<InstrId>,
    pub preds: Vec<BasicBlockId>,
    pub succs: Vec<BasicBlockId>,
    /// Moves executed on entry, before any instruction of the block.
    pub entry_move: Option<ParallelMove>,
    pub start_pos: u32,
    pub end_pos: u32,
}

impl BasicBlock {
    pub fn new(id: BasicBlockId, kind: BlockKind) -> Self {
        Self {
            id,
            kind,
            phis: Vec::new(),
            initial_definitions: Vec::new(),
            instructions: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            entry_move: None,
            start_pos: 0,
            end_pos: 0,
        }
    }

    pub fn is_join(&self) -> bool {
        !self.phis.is_empty() || self.preds.len() > 1
    }

    pub fn index_of_predecessor(&self, pred: BasicBlockId) -> Option<usize> {
        self.preds.iter().position(|p| *p == pred)
    }

    pub fn entry_move_mut(&mut self) -> &mut ParallelMove {
        self.entry_move.get_or_insert_with(ParallelMove::default)
    }
}

/// A natural loop.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub header: BasicBlockId,
    /// Sources of the edges into the header that close the loop.
    pub back_edges: Vec<BasicBlockId>,
    /// Blocks of the loop body, header included.
    pub blocks: BitVec,
    pub parent: Option<LoopId>,
    pub depth: usize,
}

impl LoopInfo {
    pub fn contains(&self, block: BasicBlockId) -> bool {
        self.blocks.get(block.index()).map_or(false, |bit| *bit)
    }

    pub fn is_back_edge(&self, block: BasicBlockId) -> bool {
        self.back_edges.contains(&block)
    }
}

#[derive(Debug, Clone)]
pub struct Cfg {
    graph: StableGraph<(), (), Directed>,
    node_of: IndexVec<BasicBlockId, NodeIndex>,
    block_of: FxHashMap<NodeIndex, BasicBlockId>,
    entry: BasicBlockId,
    rpo: Vec<BasicBlockId>,
    rpo_number: IndexVec<BasicBlockId, Option<usize>>,
    idom: IndexVec<BasicBlockId, Option<BasicBlockId>>,
    loops: IndexVec<LoopId, LoopInfo>,
    innermost_loop: IndexVec<BasicBlockId, Option<LoopId>>,
}

impl Cfg {
    pub fn build(blocks: &IndexVec<BasicBlockId, BasicBlock>, entry: BasicBlockId) -> Self {
        let mut graph = StableGraph::new();
        let node_of: IndexVec<BasicBlockId, NodeIndex> =
            blocks.iter().map(|_| graph.add_node(())).collect();
        let block_of = node_of
            .iter_enumerated()
            .map(|(bb, node)| (*node, bb))
            .collect::<FxHashMap<_, _>>();
        for block in blocks {
            for succ in &block.succs {
                graph.add_edge(node_of[block.id], node_of[*succ], ());
            }
        }
        let mut cfg = Self {
            graph,
            node_of,
            block_of,
            entry,
            rpo: Vec::new(),
            rpo_number: index_vec::index_vec![None; blocks.len()],
            idom: index_vec::index_vec![None; blocks.len()],
            loops: IndexVec::new(),
            innermost_loop: index_vec::index_vec![None; blocks.len()],
        };
        cfg.compute_orders();
        cfg.compute_dominators();
        cfg.discover_loops(blocks);
        cfg
    }

    fn compute_orders(&mut self) {
        let mut dfs = DfsPostOrder::new(&self.graph, self.node_of[self.entry]);
        let mut postorder = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            postorder.push(self.block_of[&node]);
        }
        self.rpo = postorder.into_iter().rev().collect();
        for (number, bb) in self.rpo.iter().enumerate() {
            self.rpo_number[*bb] = Some(number);
        }
    }

    fn compute_dominators(&mut self) {
        let dominators: Dominators<NodeIndex> = simple_fast(&self.graph, self.node_of[self.entry]);
        for bb in self.rpo.clone() {
            self.idom[bb] = dominators
                .immediate_dominator(self.node_of[bb])
                .map(|node| self.block_of[&node]);
        }
    }

    /// Finds natural loops. Back edges into the same header form one loop.
    fn discover_loops(&mut self, blocks: &IndexVec<BasicBlockId, BasicBlock>) {
        let mut by_header: FxHashMap<BasicBlockId, LoopId> = FxHashMap::default();
        for bb in self.rpo.clone() {
            for succ in &blocks[bb].succs {
                if !self.dominates(*succ, bb) {
                    continue;
                }
                let loop_id = *by_header.entry(*succ).or_insert_with(|| {
                    self.loops.push(LoopInfo {
                        header: *succ,
                        back_edges: Vec::new(),
                        blocks: BitVec::repeat(false, blocks.len()),
                        parent: None,
                        depth: 0,
                    })
                });
                self.loops[loop_id].back_edges.push(bb);
                self.collect_loop_body(blocks, loop_id, bb);
            }
        }
        for loop_id in self.loops.indices() {
            let header = self.loops[loop_id].header;
            let parent = self
                .loops
                .iter_enumerated()
                .filter(|(other, info)| *other != loop_id && info.header != header && info.contains(header))
                .min_by_key(|(_, info)| info.blocks.count_ones())
                .map(|(other, _)| other);
            self.loops[loop_id].parent = parent;
        }
        for loop_id in self.loops.indices() {
            let mut depth = 1;
            let mut parent = self.loops[loop_id].parent;
            while let Some(outer) = parent {
                depth += 1;
                parent = self.loops[outer].parent;
            }
            self.loops[loop_id].depth = depth;
        }
        for bb in self.rpo.clone() {
            self.innermost_loop[bb] = self
                .loops
                .iter_enumerated()
                .filter(|(_, info)| info.contains(bb))
                .max_by_key(|(_, info)| info.depth)
                .map(|(loop_id, _)| loop_id);
        }
        debug!(
            "Found {} loops: {}",
            self.loops.len(),
            self.loops.iter().map(|info| info.header).join(", ")
        );
    }

    fn collect_loop_body(
        &mut self,
        blocks: &IndexVec<BasicBlockId, BasicBlock>,
        loop_id: LoopId,
        back_edge: BasicBlockId,
    ) {
        let header = self.loops[loop_id].header;
        let rpo_number = &self.rpo_number;
        let body = &mut self.loops[loop_id].blocks;
        body.set(header.index(), true);
        let mut worklist = vec![back_edge];
        while let Some(bb) = worklist.pop() {
            if body[bb.index()] {
                continue;
            }
            body.set(bb.index(), true);
            worklist.extend(
                blocks[bb]
                    .preds
                    .iter()
                    .copied()
                    .filter(|pred| rpo_number[*pred].is_some()),
            );
        }
    }

    pub fn entry(&self) -> BasicBlockId {
        self.entry
    }

    /// Reachable blocks in reverse postorder. The entry comes first.
    pub fn reverse_postorder(&self) -> &[BasicBlockId] {
        &self.rpo
    }

    pub fn postorder(&self) -> impl Iterator<Item = BasicBlockId> + '_ {
        self.rpo.iter().rev().copied()
    }

    pub fn rpo_number(&self, bb: BasicBlockId) -> Option<usize> {
        self.rpo_number[bb]
    }

    pub fn predecessors(&self, bb: BasicBlockId) -> impl Iterator<Item = BasicBlockId> + '_ {
        self.graph
            .neighbors_directed(self.node_of[bb], Direction::Incoming)
            .map(|node| self.block_of[&node])
    }

    pub fn idom(&self, bb: BasicBlockId) -> Option<BasicBlockId> {
        self.idom[bb]
    }

    /// Returns true if every path from the entry to `b` goes through `a`.
    pub fn dominates(&self, a: BasicBlockId, b: BasicBlockId) -> bool {
        let mut current = Some(b);
        while let Some(bb) = current {
            if bb == a {
                return true;
            }
            current = self.idom[bb];
        }
        false
    }

    pub fn loops(&self) -> &IndexVec<LoopId, LoopInfo> {
        &self.loops
    }

    pub fn loop_info(&self, loop_id: LoopId) -> &LoopInfo {
        &self.loops[loop_id]
    }

    /// The innermost natural loop containing `bb`.
    pub fn loop_of(&self, bb: BasicBlockId) -> Option<LoopId> {
        self.innermost_loop[bb]
    }

    pub fn is_loop_header(&self, bb: BasicBlockId) -> bool {
        self.loops.iter().any(|info| info.header == bb)
    }

    pub fn loop_with_header(&self, bb: BasicBlockId) -> Option<LoopId> {
        self.loops
            .iter_enumerated()
            .find(|(_, info)| info.header == bb)
            .map(|(loop_id, _)| loop_id)
    }
}

#[cfg(test)]
mod tests {
    use index_vec::IndexVec;
    use tracing_test::traced_test;

    use super::{
        BasicBlock,
        BasicBlockId,
        BlockKind,
        Cfg,
    };

    fn graph(edges: &[(usize, usize)], count: usize) -> IndexVec<BasicBlockId, BasicBlock> {
        let mut blocks: IndexVec<BasicBlockId, BasicBlock> = (0..count)
            .map(|i| BasicBlock::new(BasicBlockId::new(i), BlockKind::Block))
            .collect();
        for (from, to) in edges {
            blocks[BasicBlockId::new(*from)].succs.push(BasicBlockId::new(*to));
            blocks[BasicBlockId::new(*to)].preds.push(BasicBlockId::new(*from));
        }
        blocks
    }

    #[test]
    #[traced_test]
    fn finds_nested_loops() {
        // 0 -> 1 -> 2 -> 3 -> 2, 3 -> 1, 1 -> 4
        let blocks = graph(&[(0, 1), (1, 2), (2, 3), (3, 2), (3, 1), (1, 4)], 5);
        let cfg = Cfg::build(&blocks, BasicBlockId::new(0));
        assert_eq!(cfg.loops().len(), 2);
        let outer = cfg.loop_with_header(BasicBlockId::new(1)).unwrap();
        let inner = cfg.loop_with_header(BasicBlockId::new(2)).unwrap();
        assert_eq!(cfg.loop_info(inner).parent, Some(outer));
        assert_eq!(cfg.loop_info(inner).depth, 2);
        assert_eq!(cfg.loop_of(BasicBlockId::new(3)), Some(inner));
        assert_eq!(cfg.loop_of(BasicBlockId::new(4)), None);
        assert!(cfg.loop_info(outer).is_back_edge(BasicBlockId::new(3)));
        assert!(cfg.dominates(BasicBlockId::new(1), BasicBlockId::new(4)));
        assert_eq!(cfg.idom(BasicBlockId::new(3)), Some(BasicBlockId::new(2)));
    }

    #[test]
    #[traced_test]
    fn reverse_postorder_starts_at_entry() {
        let blocks = graph(&[(0, 1), (0, 2), (1, 3), (2, 3)], 4);
        let cfg = Cfg::build(&blocks, BasicBlockId::new(0));
        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo[0], BasicBlockId::new(0));
        assert_eq!(rpo[3], BasicBlockId::new(3));
        assert_eq!(cfg.postorder().next(), Some(BasicBlockId::new(3)));
    }
}
