use std::fmt::{
    Display,
    Formatter,
};

pub use builder::Builder;
pub use cfg::{
    BasicBlock,
    BasicBlockId,
    BlockKind,
    Cfg,
    LoopId,
    LoopInfo,
};
use index_vec::IndexVec;
use iter_tools::Itertools;

use crate::codegen::machine::{
    instr::{
        EnvId,
        Environment,
        InstrKind,
        MoveOperands,
        OperandSlots,
        ParallelMove,
    },
    Instr,
    InstrId,
    Location,
    Representation,
    SlotId,
    TargetMachine,
    Vreg,
};

pub mod builder;
pub mod cfg;

/// An SSA value. Pair values own two consecutive virtual registers, both
/// pointing at the same definition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Value {
    pub repr: Representation,
    pub def: InstrId,
}

/// A function in SSA form, ready for register allocation.
#[derive(Debug, Clone)]
pub struct FlowGraph<TM: TargetMachine> {
    pub blocks: IndexVec<BasicBlockId, BasicBlock>,
    pub instrs: IndexVec<InstrId, Instr>,
    /// Every operand slot of every instruction, move and environment.
    pub locations: IndexVec<SlotId, Location<TM>>,
    pub values: IndexVec<Vreg, Value>,
    pub environments: IndexVec<EnvId, Environment>,
    pub graph_entry: BasicBlockId,
    pub normal_entry: BasicBlockId,
    pub catch_entries: Vec<BasicBlockId>,
    /// Total spill area size in words, filled in by the allocator.
    pub spill_slot_count: usize,
    cfg: Option<Cfg>,
}

impl<TM: TargetMachine> FlowGraph<TM> {
    pub(crate) fn new(graph_entry: BasicBlockId, normal_entry: BasicBlockId) -> Self {
        Self {
            blocks: IndexVec::new(),
            instrs: IndexVec::new(),
            locations: IndexVec::new(),
            values: IndexVec::new(),
            environments: IndexVec::new(),
            graph_entry,
            normal_entry,
            catch_entries: Vec::new(),
            spill_slot_count: 0,
            cfg: None,
        }
    }

    pub fn build_cfg(&mut self) {
        self.cfg = Some(Cfg::build(&self.blocks, self.graph_entry));
    }

    pub fn cfg(&self) -> &Cfg {
        self.cfg.as_ref().expect("cfg has not been built")
    }

    pub fn new_slot(&mut self, location: Location<TM>) -> SlotId {
        self.locations.push(location)
    }

    pub fn location(&self, slot: SlotId) -> Location<TM> {
        self.locations[slot]
    }

    pub fn set_location(&mut self, slot: SlotId, location: Location<TM>) {
        self.locations[slot] = location;
    }

    /// Number of virtual registers, counting both halves of pair values.
    pub fn max_vreg(&self) -> usize {
        self.values.len()
    }

    pub fn repr(&self, vreg: Vreg) -> Representation {
        self.values[vreg].repr
    }

    pub fn def(&self, vreg: Vreg) -> &Instr {
        &self.instrs[self.values[vreg].def]
    }

    pub fn is_constant(&self, vreg: Vreg) -> bool {
        self.def(vreg).is_constant()
    }

    pub fn block_order(&self) -> &[BasicBlockId] {
        self.cfg().reverse_postorder()
    }

    pub fn last_instr(&self, bb: BasicBlockId) -> Option<InstrId> {
        self.blocks[bb].instructions.last().copied()
    }

    /// The terminating `Goto` of `bb`, if it ends in one.
    pub fn goto_of(&self, bb: BasicBlockId) -> Option<InstrId> {
        self.last_instr(bb)
            .filter(|instr| matches!(self.instrs[*instr].kind, InstrKind::Goto { .. }))
    }

    /// Adds a move between two fresh slots to `parallel_move`.
    pub fn add_move(
        locations: &mut IndexVec<SlotId, Location<TM>>,
        parallel_move: &mut ParallelMove,
        dest: Location<TM>,
        src: Location<TM>,
    ) -> MoveOperands {
        let operands = MoveOperands {
            dest: locations.push(dest),
            src: locations.push(src),
        };
        parallel_move.moves.push(operands);
        operands
    }

    fn fmt_slots(&self, f: &mut Formatter<'_>, slots: OperandSlots) -> std::fmt::Result {
        match slots {
            OperandSlots::Single(slot) => write!(f, "{}", self.locations[slot]),
            OperandSlots::Pair(lo, hi) => {
                write!(f, "({}, {})", self.locations[lo], self.locations[hi])
            }
        }
    }

    fn fmt_parallel_move(&self, f: &mut Formatter<'_>, parallel_move: &ParallelMove) -> std::fmt::Result {
        let moves = parallel_move
            .moves
            .iter()
            .map(|mov| format!("{} <- {}", self.locations[mov.dest], self.locations[mov.src]))
            .join(", ");
        write!(f, "[{moves}]")
    }
}

impl<TM: TargetMachine> Display for FlowGraph<TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let order = match &self.cfg {
            Some(cfg) => cfg.reverse_postorder().to_vec(),
            None => self.blocks.indices().collect(),
        };
        for bb in order {
            let block = &self.blocks[bb];
            writeln!(
                f,
                "{bb}[{}, {}) preds: {}",
                block.start_pos,
                block.end_pos,
                block.preds.iter().join(", ")
            )?;
            if let Some(entry_move) = &block.entry_move {
                write!(f, "    ")?;
                self.fmt_parallel_move(f, entry_move)?;
                writeln!(f)?;
            }
            for instr_id in block
                .initial_definitions
                .iter()
                .chain(&block.phis)
                .chain(&block.instructions)
            {
                let instr = &self.instrs[*instr_id];
                match instr.pos {
                    Some(pos) => write!(f, "{pos:>6}: ")?,
                    None => write!(f, "        ")?,
                }
                if let Some(parallel_move) = instr.parallel_move() {
                    self.fmt_parallel_move(f, parallel_move)?;
                    write!(f, " ")?;
                }
                if !instr.is_parallel_move() {
                    write!(f, "{instr}")?;
                }
                if !instr.locs.inputs.is_empty() || instr.locs.output.is_some() {
                    write!(f, " {{")?;
                    for (i, input) in instr.locs.inputs.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        self.fmt_slots(f, *input)?;
                    }
                    if let Some(output) = instr.locs.output {
                        write!(f, " -> ")?;
                        self.fmt_slots(f, output)?;
                    }
                    write!(f, "}}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
