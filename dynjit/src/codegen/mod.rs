//! Register allocation and x64 code generation for LIR.

pub mod moves;
pub mod phyloc;
pub mod regalloc;
pub mod x64;
