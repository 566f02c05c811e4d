//! Native functions called directly from JITted code.
//!
//! Every object argument is borrowed and every object result is a new reference. Failures record
//! the exception with [set_pending] and return null (or -1 for helpers returning an integer); the
//! compiled code guards on that and deoptimises.

use super::{
    code::{CodeObject, CompareOp},
    exc::{set_pending, Exception, ExceptionKind},
    frame::Globals,
    object::{none, BorrowedObj, ObjRef, Object, Value},
    ops::{self, BinaryOpKind, UnaryOpKind},
    refs::{Ref, RefCounted},
};
use std::ptr::{self, NonNull};

/// # Safety
///
/// `p` must be non-null and point to an object kept alive by the caller.
unsafe fn borrowed<'a>(p: *mut Object) -> BorrowedObj<'a> {
    crate::jit_dcheck!(!p.is_null(), "null object passed to a helper");
    BorrowedObj::from_raw(NonNull::new_unchecked(p))
}

fn ret(r: Result<ObjRef, Exception>) -> *mut Object {
    match r {
        Ok(x) => x.release().as_ptr(),
        Err(e) => {
            set_pending(e);
            ptr::null_mut()
        }
    }
}

fn ret_status(r: Result<(), Exception>) -> i64 {
    match r {
        Ok(()) => 0,
        Err(e) => {
            set_pending(e);
            -1
        }
    }
}

unsafe fn name<'a>(code: *const CodeObject, idx: u64) -> Result<&'a str, Exception> {
    let code = &*code;
    code.names
        .get(idx as usize)
        .map(|x| x.as_str())
        .ok_or_else(|| Exception::new(ExceptionKind::SystemError, "name index out of range"))
}

pub unsafe extern "C" fn jit_load_global(
    code: *const CodeObject,
    globals: *const Globals,
    idx: u64,
) -> *mut Object {
    ret(name(code, idx).and_then(|n| (*globals).get(n).ok_or_else(|| Exception::name_error(n))))
}

pub unsafe extern "C" fn jit_load_attr(
    code: *const CodeObject,
    idx: u64,
    obj: *mut Object,
) -> *mut Object {
    ret(name(code, idx).and_then(|n| ops::load_attr(borrowed(obj), n)))
}

pub unsafe extern "C" fn jit_load_method(
    code: *const CodeObject,
    idx: u64,
    obj: *mut Object,
) -> *mut Object {
    ret(name(code, idx).and_then(|n| ops::load_method(borrowed(obj), n)))
}

pub unsafe extern "C" fn jit_binary_op(kind: u64, l: *mut Object, r: *mut Object) -> *mut Object {
    ret(match BinaryOpKind::from_repr(kind as u8) {
        Some(k) => ops::binary_op(k, borrowed(l), borrowed(r)),
        None => Err(Exception::new(ExceptionKind::SystemError, "bad binary op")),
    })
}

pub unsafe extern "C" fn jit_unary_op(kind: u64, v: *mut Object) -> *mut Object {
    ret(match UnaryOpKind::from_repr(kind as u8) {
        Some(k) => ops::unary_op(k, borrowed(v)),
        None => Err(Exception::new(ExceptionKind::SystemError, "bad unary op")),
    })
}

pub unsafe extern "C" fn jit_compare(op: u64, l: *mut Object, r: *mut Object) -> *mut Object {
    ret(match CompareOp::from_repr(op as u8) {
        Some(op) => ops::compare(op, borrowed(l), borrowed(r)),
        None => Err(Exception::new(ExceptionKind::SystemError, "bad comparison")),
    })
}

/// Returns 1 if `v` is truthy, 0 if not, -1 on error.
pub unsafe extern "C" fn jit_is_truthy(v: *mut Object) -> i64 {
    match ops::is_truthy(borrowed(v)) {
        Ok(b) => i64::from(b),
        Err(e) => {
            set_pending(e);
            -1
        }
    }
}

pub unsafe extern "C" fn jit_call0(f: *mut Object) -> *mut Object {
    ret(ops::call(borrowed(f), &[]))
}

pub unsafe extern "C" fn jit_call1(f: *mut Object, a: *mut Object) -> *mut Object {
    ret(ops::call(borrowed(f), &[borrowed(a)]))
}

pub unsafe extern "C" fn jit_call2(f: *mut Object, a: *mut Object, b: *mut Object) -> *mut Object {
    ret(ops::call(borrowed(f), &[borrowed(a), borrowed(b)]))
}

pub unsafe extern "C" fn jit_call3(
    f: *mut Object,
    a: *mut Object,
    b: *mut Object,
    c: *mut Object,
) -> *mut Object {
    ret(ops::call(borrowed(f), &[borrowed(a), borrowed(b), borrowed(c)]))
}

pub unsafe extern "C" fn jit_call4(
    f: *mut Object,
    a: *mut Object,
    b: *mut Object,
    c: *mut Object,
    d: *mut Object,
) -> *mut Object {
    ret(ops::call(
        borrowed(f),
        &[borrowed(a), borrowed(b), borrowed(c), borrowed(d)],
    ))
}

/// The address of the helper calling a function with `nargs` arguments.
pub fn call_helper(nargs: usize) -> usize {
    match nargs {
        0 => jit_call0 as usize,
        1 => jit_call1 as usize,
        2 => jit_call2 as usize,
        3 => jit_call3 as usize,
        4 => jit_call4 as usize,
        _ => crate::jit_abort!("no call helper for {nargs} arguments"),
    }
}

pub unsafe extern "C" fn jit_call_method0(recv: *mut Object, m: *mut Object) -> *mut Object {
    ret(ops::call_method(borrowed(recv), borrowed(m), &[]))
}

pub unsafe extern "C" fn jit_call_method1(
    recv: *mut Object,
    m: *mut Object,
    a: *mut Object,
) -> *mut Object {
    ret(ops::call_method(borrowed(recv), borrowed(m), &[borrowed(a)]))
}

pub unsafe extern "C" fn jit_call_method2(
    recv: *mut Object,
    m: *mut Object,
    a: *mut Object,
    b: *mut Object,
) -> *mut Object {
    ret(ops::call_method(
        borrowed(recv),
        borrowed(m),
        &[borrowed(a), borrowed(b)],
    ))
}

pub unsafe extern "C" fn jit_call_method3(
    recv: *mut Object,
    m: *mut Object,
    a: *mut Object,
    b: *mut Object,
    c: *mut Object,
) -> *mut Object {
    ret(ops::call_method(
        borrowed(recv),
        borrowed(m),
        &[borrowed(a), borrowed(b), borrowed(c)],
    ))
}

/// The address of the helper calling a method with `nargs` arguments besides the receiver.
pub fn call_method_helper(nargs: usize) -> usize {
    match nargs {
        0 => jit_call_method0 as usize,
        1 => jit_call_method1 as usize,
        2 => jit_call_method2 as usize,
        3 => jit_call_method3 as usize,
        _ => crate::jit_abort!("no method call helper for {nargs} arguments"),
    }
}

/// Allocate a list of `n` `None`s, to be filled with [jit_list_tuple_set].
pub extern "C" fn jit_make_list(n: u64) -> *mut Object {
    Object::list((0..n).map(|_| none()).collect()).release().as_ptr()
}

pub extern "C" fn jit_make_tuple(n: u64) -> *mut Object {
    Object::tuple((0..n).map(|_| none()).collect()).release().as_ptr()
}

pub unsafe extern "C" fn jit_list_tuple_set(seq: *mut Object, i: u64, item: *mut Object) {
    let seq = borrowed(seq);
    match seq.value() {
        Value::List(items) | Value::Tuple(items) => {
            items.borrow_mut()[i as usize] = ObjRef::create(borrowed(item));
        }
        _ => crate::jit_abort!("initialising a non-sequence"),
    }
}

/// `c[i] = v`. Returns 0 on success, -1 on error.
pub unsafe extern "C" fn jit_store_subscr(c: *mut Object, i: *mut Object, v: *mut Object) -> i64 {
    ret_status(ops::store_subscr(borrowed(c), borrowed(i), borrowed(v)))
}

pub unsafe extern "C" fn jit_get_iter(v: *mut Object) -> *mut Object {
    ret(ops::get_iter(borrowed(v)))
}

/// The iterator's next item, or null when it is exhausted.
pub unsafe extern "C" fn jit_iter_next(it: *mut Object) -> *mut Object {
    match ops::iter_next(borrowed(it)) {
        Ok(Some(x)) => x.release().as_ptr(),
        Ok(None) => ptr::null_mut(),
        Err(e) => {
            set_pending(e);
            ptr::null_mut()
        }
    }
}

pub unsafe extern "C" fn jit_xincref(v: *mut Object) {
    if !v.is_null() {
        (*v).incref();
    }
}

pub unsafe extern "C" fn jit_decref(v: *mut Object) {
    drop(Ref::steal(NonNull::new_unchecked(v)));
}

pub unsafe extern "C" fn jit_xdecref(v: *mut Object) {
    drop(Ref::steal_raw(v));
}
