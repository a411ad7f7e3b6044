use std::{
    fmt::Debug,
    hash::Hash,
};

/// The two register files the allocator runs a pass for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
pub enum RegisterKind {
    Cpu,
    Fpu,
}

pub trait PhysicalRegister: Debug + Clone + Copy + PartialEq + Eq + Hash + Sized + 'static {
    fn name(&self) -> &'static str;

    /// All registers of this file, indexed by their code.
    fn all() -> &'static [Self];

    /// Registers that are never handed out by the allocator, e.g. the stack pointer.
    fn is_blocked(&self) -> bool;

    fn code(self) -> usize;

    fn from_code(code: usize) -> Self {
        Self::all()[code]
    }

    fn count() -> usize {
        Self::all().len()
    }
}
