//! The managed runtime that compiled code executes against.

pub mod code;
pub mod exc;
pub mod frame;
pub mod helpers;
pub mod interp;
pub mod object;
pub mod ops;
pub mod refs;

pub use code::{CodeBuilder, CodeObject};
pub use exc::{Exception, ExceptionKind};
pub use frame::{BlockStackEntry, Frame, Globals};
pub use object::{BorrowedObj, ObjRef, Object};
pub use refs::{BorrowedRef, Ref};
