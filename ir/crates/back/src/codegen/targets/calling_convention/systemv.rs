use crate::codegen::{
    machine::{
        abi::CallingConvention,
        Location,
        RegisterKind,
        Representation,
        StackSlot,
        TargetMachine,
    },
    targets::x86_64::{
        FpuRegister,
        Register,
        Target,
    },
};

const INTEGER_ARGUMENT_REGISTERS: [Register; 6] = [
    Register::RDI,
    Register::RSI,
    Register::RDX,
    Register::RCX,
    Register::R8,
    Register::R9,
];

const FLOAT_ARGUMENT_REGISTERS: [FpuRegister; 8] = [
    FpuRegister::XMM0,
    FpuRegister::XMM1,
    FpuRegister::XMM2,
    FpuRegister::XMM3,
    FpuRegister::XMM4,
    FpuRegister::XMM5,
    FpuRegister::XMM6,
    FpuRegister::XMM7,
];

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SystemV;

impl CallingConvention for SystemV {
    type TM = Target;

    fn parameter_location(index: usize, _count: usize, repr: Representation) -> Location<Target> {
        let is_float = repr.register_kind() == RegisterKind::Fpu;
        if is_float {
            if let Some(reg) = FLOAT_ARGUMENT_REGISTERS.get(index) {
                return Location::FpuRegister(*reg);
            }
        } else if let Some(reg) = INTEGER_ARGUMENT_REGISTERS.get(index) {
            return Location::Register(*reg);
        }
        let limit = if is_float {
            FLOAT_ARGUMENT_REGISTERS.len()
        } else {
            INTEGER_ARGUMENT_REGISTERS.len()
        };
        let stack_index = index - limit;
        Location::Stack(StackSlot::word(
            Target::FRAME_LAYOUT.param_end_from_fp + 1 + stack_index as i32,
        ))
    }

    fn return_location(repr: Representation) -> Location<Target> {
        if repr.register_kind() == RegisterKind::Fpu {
            Location::FpuRegister(FpuRegister::XMM0)
        } else {
            Location::Register(Register::RAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SystemV;
    use crate::codegen::{
        machine::{
            abi::CallingConvention,
            Location,
            Representation,
            StackSlot,
        },
        targets::x86_64::{
            FpuRegister,
            Register,
        },
    };

    #[test]
    fn first_arguments_are_passed_in_registers() {
        assert_eq!(
            SystemV::parameter_location(0, 2, Representation::Tagged),
            Location::Register(Register::RDI)
        );
        assert_eq!(
            SystemV::parameter_location(1, 2, Representation::Double),
            Location::FpuRegister(FpuRegister::XMM1)
        );
    }

    #[test]
    fn remaining_arguments_live_above_the_frame_pointer() {
        assert_eq!(
            SystemV::parameter_location(7, 8, Representation::Tagged),
            Location::Stack(StackSlot::word(3))
        );
    }
}
