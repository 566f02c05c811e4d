//! dynjit: a method JIT for a small dynamically typed bytecode.
//!
//! Functions are translated from wordcode into HIR, given explicit reference counting operations,
//! lowered to LIR, register allocated, and assembled into x64 machine code. Every point at which
//! compiled code may need to hand control back to the interpreter carries a [deopt::DeoptMetadata]
//! record from which an interpreter [runtime::Frame] can be rebuilt.

#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

/// Abort with a diagnostic if `$cond` does not hold. These checks guard invariants whose
/// violation is a bug in the compiler: they are never caught or recovered from.
#[macro_export]
macro_rules! jit_check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            panic!("JIT check failed: {}: {}", stringify!($cond), format_args!($($arg)+));
        }
    };
}

/// As [jit_check!], but only checked in debug builds.
#[macro_export]
macro_rules! jit_dcheck {
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) {
            $crate::jit_check!($cond, $($arg)+);
        }
    };
}

/// Abort unconditionally with a diagnostic.
#[macro_export]
macro_rules! jit_abort {
    ($($arg:tt)+) => {
        panic!("JIT abort: {}", format_args!($($arg)+))
    };
}

/// Define the boilerplate for an index type suitable for use with `TiVec`.
macro_rules! index_type {
    ($struct:ident) => {
        impl $struct {
            pub fn new(v: usize) -> Self {
                match u32::try_from(v) {
                    Ok(x) => Self(x),
                    Err(_) => $crate::jit_abort!("{} index {v} overflows", stringify!($struct)),
                }
            }

            pub fn index(self) -> usize {
                // `u32` always fits in `usize` on the platforms we support.
                self.0 as usize
            }
        }

        impl From<usize> for $struct {
            fn from(v: usize) -> Self {
                Self::new(v)
            }
        }

        impl From<$struct> for usize {
            fn from(v: $struct) -> Self {
                v.index()
            }
        }
    };
}

pub mod codegen;
pub mod compile;
pub mod deopt;
pub mod hir;
pub mod lir;
pub(crate) mod log;
pub mod runtime;

pub use compile::{CompilationError, CompiledFunction, Jit};
