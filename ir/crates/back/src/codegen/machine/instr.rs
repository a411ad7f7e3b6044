use std::fmt::{
    Display,
    Formatter,
};

use bitvec::vec::BitVec;
use smallvec::SmallVec;

use crate::codegen::machine::{
    function::BasicBlockId,
    reg::{
        RegisterSet,
        Vreg,
    },
};

index_vec::define_index_type! {
    pub struct InstrId = u32;

    DISPLAY_FORMAT = "instr{}";
}

index_vec::define_index_type! {
    /// Handle of an entry in the location side table of a [`FlowGraph`](super::FlowGraph).
    pub struct SlotId = u32;

    DISPLAY_FORMAT = "slot{}";
}

index_vec::define_index_type! {
    pub struct EnvId = u32;

    DISPLAY_FORMAT = "env{}";
}

/// Location slots of one operand. Pair values use one slot per half.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperandSlots {
    Single(SlotId),
    Pair(SlotId, SlotId),
}

impl OperandSlots {
    pub const fn first(self) -> SlotId {
        match self {
            Self::Single(slot) | Self::Pair(slot, _) => slot,
        }
    }

    pub fn iter(self) -> impl Iterator<Item = SlotId> {
        let slots: SmallVec<[SlotId; 2]> = match self {
            Self::Single(slot) => smallvec::smallvec![slot],
            Self::Pair(lo, hi) => smallvec::smallvec![lo, hi],
        };
        slots.into_iter()
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ContainsCall {
    #[default]
    NoCall,
    /// Always calls and clobbers every allocatable register.
    Call,
    /// Always calls, but the callee preserves all registers.
    CallCalleeSafe,
    /// May call on a slow path that saves live registers itself.
    CallOnSlowPath,
}

/// Operand constraints of an instruction and the allocator's answers to them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocationSummary {
    pub inputs: SmallVec<[OperandSlots; 2]>,
    pub temps: SmallVec<[SlotId; 1]>,
    pub output: Option<OperandSlots>,
    pub contains_call: ContainsCall,
    /// Registers live across a slow-path call.
    pub live_registers: RegisterSet,
    /// Spill-area indices holding tagged values at this safepoint.
    pub stack_bitmap: BitVec,
}

impl LocationSummary {
    pub const fn always_calls(&self) -> bool {
        matches!(
            self.contains_call,
            ContainsCall::Call | ContainsCall::CallCalleeSafe
        )
    }

    pub const fn can_call(&self) -> bool {
        !matches!(self.contains_call, ContainsCall::NoCall)
    }

    pub const fn callee_safe_call(&self) -> bool {
        matches!(self.contains_call, ContainsCall::CallCalleeSafe)
    }

    pub const fn has_call_on_slow_path(&self) -> bool {
        matches!(self.contains_call, ContainsCall::CallOnSlowPath)
    }

    pub fn set_stack_bit(&mut self, spill_index: usize) {
        if self.stack_bitmap.len() <= spill_index {
            self.stack_bitmap.resize(spill_index + 1, false);
        }
        self.stack_bitmap.set(spill_index, true);
    }

    pub fn stack_bit(&self, spill_index: usize) -> bool {
        self.stack_bitmap
            .get(spill_index)
            .map_or(false, |bit| *bit)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MoveOperands {
    pub dest: SlotId,
    pub src: SlotId,
}

/// A batch of moves that happen simultaneously.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParallelMove {
    pub moves: SmallVec<[MoveOperands; 4]>,
}

impl ParallelMove {
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum SpecialParameterKind {
    ArgumentsDescriptor,
    Exception,
    StackTrace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrKind {
    /// Incoming argument number `index` of the function or catch entry.
    Parameter { index: usize },
    SpecialParameter(SpecialParameterKind),
    Constant(i64),
    /// Inputs are ordered like the predecessors of the block.
    Phi,
    ParallelMove(ParallelMove),
    /// `parallel_move` holds phi and edge moves executed before the jump.
    Goto {
        target: BasicBlockId,
        parallel_move: Option<ParallelMove>,
    },
    Branch {
        if_true: BasicBlockId,
        if_false: BasicBlockId,
    },
    Return,
    /// Any other machine operation; the allocator only sees its location summary.
    Op(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub kind: InstrKind,
    pub inputs: SmallVec<[Vreg; 2]>,
    pub output: Option<Vreg>,
    pub locs: LocationSummary,
    /// Deoptimization environment captured by this instruction.
    pub env: Option<EnvId>,
    /// Lifetime position, assigned by the allocator's numbering.
    pub pos: Option<u32>,
}

impl Instr {
    pub fn new(kind: InstrKind) -> Self {
        Self {
            kind,
            inputs: SmallVec::new(),
            output: None,
            locs: LocationSummary::default(),
            env: None,
            pos: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            InstrKind::Parameter { .. } => "Parameter",
            InstrKind::SpecialParameter(_) => "SpecialParameter",
            InstrKind::Constant(_) => "Constant",
            InstrKind::Phi => "Phi",
            InstrKind::ParallelMove(_) => "ParallelMove",
            InstrKind::Goto { .. } => "Goto",
            InstrKind::Branch { .. } => "Branch",
            InstrKind::Return => "Return",
            InstrKind::Op(name) => name,
        }
    }

    pub const fn is_parallel_move(&self) -> bool {
        matches!(self.kind, InstrKind::ParallelMove(_))
    }

    pub const fn is_constant(&self) -> bool {
        matches!(self.kind, InstrKind::Constant(_))
    }

    pub fn parallel_move(&self) -> Option<&ParallelMove> {
        match &self.kind {
            InstrKind::ParallelMove(parallel_move) => Some(parallel_move),
            InstrKind::Goto { parallel_move, .. } => parallel_move.as_ref(),
            _ => None,
        }
    }

    pub fn parallel_move_mut(&mut self) -> Option<&mut ParallelMove> {
        match &mut self.kind {
            InstrKind::ParallelMove(parallel_move) => Some(parallel_move),
            InstrKind::Goto { parallel_move, .. } => parallel_move.as_mut(),
            _ => None,
        }
    }

    pub fn successors(&self) -> SmallVec<[BasicBlockId; 2]> {
        match &self.kind {
            InstrKind::Goto { target, .. } => smallvec::smallvec![*target],
            InstrKind::Branch { if_true, if_false } => smallvec::smallvec![*if_true, *if_false],
            _ => SmallVec::new(),
        }
    }
}

impl Display for Instr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(output) = self.output {
            write!(f, "{output} = ")?;
        }
        match &self.kind {
            InstrKind::Parameter { index } => write!(f, "Parameter({index})")?,
            InstrKind::Constant(value) => write!(f, "Constant({value})")?,
            InstrKind::SpecialParameter(kind) => write!(f, "SpecialParameter({kind})")?,
            InstrKind::Goto { target, .. } => write!(f, "Goto {target}")?,
            InstrKind::Branch { if_true, if_false } => {
                write!(f, "Branch {if_true}, {if_false}")?;
            }
            _ => write!(f, "{}", self.name())?,
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if i == 0 {
                write!(f, " {input}")?;
            } else {
                write!(f, ", {input}")?;
            }
        }
        Ok(())
    }
}

/// Values a deoptimizing instruction needs to rebuild the unoptimized frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub values: SmallVec<[Vreg; 4]>,
    /// One entry per value, filled by the allocator.
    pub locations: Vec<OperandSlots>,
    pub outer: Option<EnvId>,
}
