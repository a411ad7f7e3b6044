use std::fmt::{
    Display,
    Formatter,
};

use crate::codegen::machine::{
    isa::{
        PhysicalRegister,
        RegisterKind,
    },
    Location,
    Representation,
    TargetMachine,
};

index_vec::define_index_type! {
    /// An SSA value. Pair values own two consecutive virtual registers.
    pub struct Vreg = u32;

    DISPLAY_FORMAT = "v{}";
}

impl Vreg {
    /// The virtual register holding the high half of a pair value.
    pub fn second_of_pair(self) -> Self {
        self + 1
    }
}

/// Registers holding live values across a call on a slow path.
///
/// Bit `n` of a mask corresponds to register code `n`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet {
    cpu: u64,
    untagged_cpu: u64,
    fpu: u64,
}

impl RegisterSet {
    pub fn add<TM: TargetMachine>(&mut self, location: Location<TM>, repr: Representation) {
        match location {
            Location::Register(reg) => {
                let bit = 1 << reg.code();
                self.cpu |= bit;
                if repr.is_tagged() {
                    self.untagged_cpu &= !bit;
                } else {
                    self.untagged_cpu |= bit;
                }
            }
            Location::FpuRegister(reg) => {
                self.fpu |= 1 << reg.code();
            }
            other => unreachable!("{other} is not a machine register"),
        }
    }

    pub fn contains<TM: TargetMachine>(&self, location: Location<TM>) -> bool {
        match location {
            Location::Register(reg) => self.cpu & (1 << reg.code()) != 0,
            Location::FpuRegister(reg) => self.fpu & (1 << reg.code()) != 0,
            _ => false,
        }
    }

    /// True if the register holds a tagged pointer.
    pub fn is_tagged(&self, code: usize) -> bool {
        let bit = 1 << code;
        self.cpu & bit != 0 && self.untagged_cpu & bit == 0
    }

    pub fn len(&self, kind: RegisterKind) -> usize {
        match kind {
            RegisterKind::Cpu => self.cpu.count_ones() as usize,
            RegisterKind::Fpu => self.fpu.count_ones() as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu == 0 && self.fpu == 0
    }
}

impl Display for RegisterSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{cpu: {:#x}, fpu: {:#x}}}", self.cpu, self.fpu)
    }
}
