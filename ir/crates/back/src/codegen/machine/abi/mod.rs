use crate::codegen::machine::{
    Location,
    Representation,
    TargetMachine,
};

/// Decides where incoming parameters and return values live.
pub trait CallingConvention {
    type TM: TargetMachine;

    /// Location of parameter `index` out of `count` parameters.
    ///
    /// Stack parameters are addressed relative to the frame pointer.
    fn parameter_location(index: usize, count: usize, repr: Representation) -> Location<Self::TM>;

    fn return_location(repr: Representation) -> Location<Self::TM>;
}
