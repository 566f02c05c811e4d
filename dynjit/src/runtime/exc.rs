//! Runtime exceptions.
//!
//! Native code called from the interpreter returns `Result<_, Exception>`. Native code called from
//! JITted code can't return a Rust `Result`, so it instead records the exception in a per-thread
//! pending slot and returns a sentinel (null or a negative number).

use std::cell::RefCell;
use strum::Display;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ExceptionKind {
    AttributeError,
    IndexError,
    NameError,
    OverflowError,
    RuntimeError,
    SystemError,
    TypeError,
    UnboundLocalError,
    ValueError,
    ZeroDivisionError,
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind}: {msg}")]
pub struct Exception {
    pub kind: ExceptionKind,
    pub msg: String,
}

impl Exception {
    pub fn new(kind: ExceptionKind, msg: impl Into<String>) -> Self {
        Exception {
            kind,
            msg: msg.into(),
        }
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::new(ExceptionKind::TypeError, msg)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new(ExceptionKind::NameError, format!("name '{name}' is not defined"))
    }

    pub fn unbound_local(name: &str) -> Self {
        Self::new(
            ExceptionKind::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }
}

thread_local! {
    static PENDING: RefCell<Option<Exception>> = const { RefCell::new(None) };
}

/// Record `e` as this thread's pending exception, replacing any previous one.
pub fn set_pending(e: Exception) {
    PENDING.with(|p| *p.borrow_mut() = Some(e));
}

/// Take this thread's pending exception, if there is one.
pub fn take_pending() -> Option<Exception> {
    PENDING.with(|p| p.borrow_mut().take())
}

pub fn has_pending() -> bool {
    PENDING.with(|p| p.borrow().is_some())
}
