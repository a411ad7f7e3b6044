use std::{
    fmt::{
        Debug,
        Display,
        Formatter,
    },
    hash::Hash,
};

pub use function::{
    BasicBlockId,
    FlowGraph,
};
pub use instr::{
    ContainsCall,
    Instr,
    InstrId,
    InstrKind,
    LocationSummary,
    OperandSlots,
    SlotId,
};
pub use isa::{
    PhysicalRegister,
    RegisterKind,
};
pub use reg::{
    RegisterSet,
    Vreg,
};

use crate::codegen::machine::abi::CallingConvention;

pub mod abi;
pub mod function;
pub mod instr;
pub mod isa;
pub mod reg;

/// How a value is laid out in machine registers and stack slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
pub enum Representation {
    /// A pointer to a heap object, visible to the GC.
    Tagged,
    /// A raw machine word. Never reported to the GC.
    Untagged,
    Int32,
    Uint32,
    Int64,
    /// A 64-bit value that occupies two word-sized slots on 32-bit targets.
    PairInt64,
    Float,
    Double,
    Simd128,
}

impl Representation {
    pub const fn register_kind(self) -> RegisterKind {
        match self {
            Self::Float | Self::Double | Self::Simd128 => RegisterKind::Fpu,
            _ => RegisterKind::Cpu,
        }
    }

    pub const fn is_pair(self) -> bool {
        matches!(self, Self::PairInt64)
    }

    pub const fn is_tagged(self) -> bool {
        matches!(self, Self::Tagged)
    }

    pub const fn is_quad(self) -> bool {
        matches!(self, Self::Simd128)
    }

    /// Representation of each half of a value, as seen by the allocator.
    ///
    /// Pair values are split into two independent word-sized ranges.
    pub const fn half(self) -> Self {
        match self {
            Self::PairInt64 => Self::Untagged,
            other => other,
        }
    }
}

/// Constraint attached to an unallocated location slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Policy {
    Any,
    PrefersRegister,
    RequiresRegister,
    RequiresFpuRegister,
    /// The instruction mutates the input in place, so it receives a copy.
    WritableRegister,
    SameAsFirstInput,
    RequiresStack,
}

impl Policy {
    pub const fn register_kind(self) -> RegisterKind {
        match self {
            Self::RequiresFpuRegister => RegisterKind::Fpu,
            _ => RegisterKind::Cpu,
        }
    }
}

/// Register a stack slot is addressed from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FrameBase {
    FramePointer,
    StackPointer,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SlotWidth {
    Word,
    Double,
    Quad,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StackSlot {
    pub index: i32,
    pub base: FrameBase,
    pub width: SlotWidth,
}

impl StackSlot {
    pub const fn word(index: i32) -> Self {
        Self {
            index,
            base: FrameBase::FramePointer,
            width: SlotWidth::Word,
        }
    }
}

/// Shape of the frame below the frame pointer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    /// Frame pointer relative index of the first spill slot.
    pub first_local_from_fp: i32,
    /// Frame pointer relative index of the last parameter passed on the stack.
    pub param_end_from_fp: i32,
}

impl FrameLayout {
    /// Maps a spill area index (0, 1, ...) to a frame pointer relative slot index.
    pub const fn frame_slot_for_spill_index(&self, spill_index: usize) -> i32 {
        self.first_local_from_fp - spill_index as i32
    }

    /// Inverse of [`Self::frame_slot_for_spill_index`].
    pub const fn spill_index_for_frame_slot(&self, frame_slot: i32) -> Option<usize> {
        let index = self.first_local_from_fp - frame_slot;
        if index < 0 {
            None
        } else {
            Some(index as usize)
        }
    }
}

pub trait TargetMachine: Debug + Default + Copy + Clone + PartialEq + Eq + Hash {
    type Reg: PhysicalRegister;

    type FpuReg: PhysicalRegister;

    type CallingConvention: CallingConvention<TM = Self>;

    /// Number of word-sized stack slots a double occupies.
    const DOUBLE_SPILL_FACTOR: usize;

    const FRAME_LAYOUT: FrameLayout;

    fn arguments_descriptor_reg() -> Self::Reg;

    fn exception_reg() -> Self::Reg;

    fn stack_trace_reg() -> Self::Reg;
}

/// Where a value lives at a particular operand slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Location<TM: TargetMachine> {
    Invalid,
    Unallocated(Policy),
    Register(TM::Reg),
    FpuRegister(TM::FpuReg),
    Stack(StackSlot),
    /// The value of the constant defined by this virtual register.
    Constant(Vreg),
}

impl<TM: TargetMachine> Default for Location<TM> {
    fn default() -> Self {
        Self::Invalid
    }
}

impl<TM: TargetMachine> Location<TM> {
    pub const fn any() -> Self {
        Self::Unallocated(Policy::Any)
    }

    pub const fn requires_register() -> Self {
        Self::Unallocated(Policy::RequiresRegister)
    }

    pub const fn prefers_register() -> Self {
        Self::Unallocated(Policy::PrefersRegister)
    }

    pub fn machine_register(kind: RegisterKind, code: usize) -> Self {
        match kind {
            RegisterKind::Cpu => Self::Register(TM::Reg::from_code(code)),
            RegisterKind::Fpu => Self::FpuRegister(TM::FpuReg::from_code(code)),
        }
    }

    pub const fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid)
    }

    pub const fn is_unallocated(&self) -> bool {
        matches!(self, Self::Unallocated(_))
    }

    pub const fn policy(&self) -> Option<Policy> {
        match self {
            Self::Unallocated(policy) => Some(*policy),
            _ => None,
        }
    }

    pub fn has_policy(&self, policy: Policy) -> bool {
        matches!(self, Self::Unallocated(p) if *p == policy)
    }

    /// True for unallocated slots that must end up in a register.
    pub const fn requires_register_now(&self) -> bool {
        matches!(
            self,
            Self::Unallocated(Policy::RequiresRegister | Policy::RequiresFpuRegister)
        )
    }

    /// True for unallocated slots for which a register is better than memory.
    pub const fn is_register_beneficial(&self) -> bool {
        matches!(
            self,
            Self::Unallocated(
                Policy::PrefersRegister
                    | Policy::RequiresRegister
                    | Policy::RequiresFpuRegister
                    | Policy::WritableRegister
                    | Policy::SameAsFirstInput
            )
        )
    }

    pub const fn is_machine_register(&self) -> bool {
        matches!(self, Self::Register(_) | Self::FpuRegister(_))
    }

    pub const fn is_stack_slot(&self) -> bool {
        matches!(self, Self::Stack(_))
    }

    pub const fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    pub fn register_kind(&self) -> Option<RegisterKind> {
        match self {
            Self::Register(_) => Some(RegisterKind::Cpu),
            Self::FpuRegister(_) => Some(RegisterKind::Fpu),
            _ => None,
        }
    }

    pub fn register_code(&self) -> Option<usize> {
        match self {
            Self::Register(reg) => Some(reg.code()),
            Self::FpuRegister(reg) => Some(reg.code()),
            _ => None,
        }
    }

    pub const fn stack_slot(&self) -> Option<StackSlot> {
        match self {
            Self::Stack(slot) => Some(*slot),
            _ => None,
        }
    }
}

impl<TM: TargetMachine> Display for Location<TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "_"),
            Self::Unallocated(policy) => match policy {
                Policy::Any => write!(f, "any"),
                Policy::PrefersRegister => write!(f, "R?"),
                Policy::RequiresRegister => write!(f, "R"),
                Policy::RequiresFpuRegister => write!(f, "F"),
                Policy::WritableRegister => write!(f, "W"),
                Policy::SameAsFirstInput => write!(f, "0"),
                Policy::RequiresStack => write!(f, "S"),
            },
            Self::Register(reg) => write!(f, "${}", reg.name()),
            Self::FpuRegister(reg) => write!(f, "${}", reg.name()),
            Self::Stack(slot) => {
                let base = match slot.base {
                    FrameBase::FramePointer => "fp",
                    FrameBase::StackPointer => "sp",
                };
                let prefix = match slot.width {
                    SlotWidth::Word => "S",
                    SlotWidth::Double => "DS",
                    SlotWidth::Quad => "QS",
                };
                write!(f, "{prefix}{:+}({base})", slot.index)
            }
            Self::Constant(vreg) => write!(f, "C({vreg})"),
        }
    }
}
