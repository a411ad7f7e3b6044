use strum::VariantArray;

use crate::codegen::{
    machine::{
        isa::PhysicalRegister,
        FrameLayout,
        TargetMachine,
    },
    targets::calling_convention::systemv::SystemV,
};

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Target;

impl TargetMachine for Target {
    type Reg = Register;
    type FpuReg = FpuRegister;
    type CallingConvention = SystemV;

    const DOUBLE_SPILL_FACTOR: usize = 1;

    const FRAME_LAYOUT: FrameLayout = FrameLayout {
        first_local_from_fp: -2,
        param_end_from_fp: 1,
    };

    fn arguments_descriptor_reg() -> Register {
        Register::R10
    }

    fn exception_reg() -> Register {
        Register::RAX
    }

    fn stack_trace_reg() -> Register {
        Register::RDX
    }
}

/// General purpose registers, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, VariantArray, Hash)]
pub enum Register {
    RAX,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl PhysicalRegister for Register {
    fn name(&self) -> &'static str {
        self.into()
    }

    fn all() -> &'static [Self] {
        Self::VARIANTS
    }

    fn is_blocked(&self) -> bool {
        // R11 is the scratch register of the move resolver, R14 holds the thread.
        matches!(self, Self::RSP | Self::RBP | Self::R11 | Self::R14)
    }

    fn code(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, VariantArray, Hash)]
pub enum FpuRegister {
    XMM0,
    XMM1,
    XMM2,
    XMM3,
    XMM4,
    XMM5,
    XMM6,
    XMM7,
    XMM8,
    XMM9,
    XMM10,
    XMM11,
    XMM12,
    XMM13,
    XMM14,
    XMM15,
}

impl PhysicalRegister for FpuRegister {
    fn name(&self) -> &'static str {
        self.into()
    }

    fn all() -> &'static [Self] {
        Self::VARIANTS
    }

    fn is_blocked(&self) -> bool {
        matches!(self, Self::XMM15)
    }

    fn code(self) -> usize {
        self as usize
    }
}
