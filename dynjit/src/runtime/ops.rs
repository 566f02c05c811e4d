//! The semantics of the operations shared by the interpreter and JITted code.

use super::{
    exc::{Exception, ExceptionKind},
    object::{none, py_bool, BorrowedObj, ObjRef, Object, SeqIter, Value},
    code::{CompareOp, Opcode},
};
use std::cell::Cell;
use strum::{Display, FromRepr};

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
pub enum BinaryOpKind {
    Add,
    Subtract,
    Multiply,
    FloorDivide,
    Modulo,
    Subscript,
    And,
    Or,
    Xor,
    LShift,
    RShift,
}

impl BinaryOpKind {
    /// The operation performed by a `BINARY_*` or `INPLACE_*` opcode.
    pub fn from_opcode(op: Opcode) -> Option<Self> {
        Some(match op {
            Opcode::BinaryAdd | Opcode::InplaceAdd => BinaryOpKind::Add,
            Opcode::BinarySubtract | Opcode::InplaceSubtract => BinaryOpKind::Subtract,
            Opcode::BinaryMultiply | Opcode::InplaceMultiply => BinaryOpKind::Multiply,
            Opcode::BinaryFloorDivide => BinaryOpKind::FloorDivide,
            Opcode::BinaryModulo => BinaryOpKind::Modulo,
            Opcode::BinarySubscr => BinaryOpKind::Subscript,
            Opcode::BinaryAnd => BinaryOpKind::And,
            Opcode::BinaryOr => BinaryOpKind::Or,
            Opcode::BinaryXor | Opcode::InplaceXor => BinaryOpKind::Xor,
            Opcode::BinaryLshift => BinaryOpKind::LShift,
            Opcode::BinaryRshift => BinaryOpKind::RShift,
            _ => return None,
        })
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
pub enum UnaryOpKind {
    Not,
    Negative,
    Invert,
}

impl UnaryOpKind {
    pub fn from_opcode(op: Opcode) -> Option<Self> {
        match op {
            Opcode::UnaryNot => Some(UnaryOpKind::Not),
            Opcode::UnaryNegative => Some(UnaryOpKind::Negative),
            Opcode::UnaryInvert => Some(UnaryOpKind::Invert),
            _ => None,
        }
    }
}

fn unsupported(op: &str, l: BorrowedObj<'_>, r: BorrowedObj<'_>) -> Exception {
    Exception::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        l.type_name(),
        r.type_name()
    ))
}

fn overflow() -> Exception {
    Exception::new(ExceptionKind::OverflowError, "integer overflow")
}

fn zero_division() -> Exception {
    Exception::new(
        ExceptionKind::ZeroDivisionError,
        "integer division or modulo by zero",
    )
}

fn floor_div(a: i64, b: i64) -> Result<i64, Exception> {
    if b == 0 {
        return Err(zero_division());
    }
    let q = a.checked_div(b).ok_or_else(overflow)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn floor_mod(a: i64, b: i64) -> Result<i64, Exception> {
    if b == 0 {
        return Err(zero_division());
    }
    let r = a.checked_rem(b).ok_or_else(overflow)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

fn as_float(o: BorrowedObj<'_>) -> Option<f64> {
    match o.value() {
        Value::Float(f) => Some(*f),
        // Precision loss for huge integers mirrors the usual int-to-float conversion.
        _ => o.as_int().map(|i| i as f64),
    }
}

fn seq_index(len: usize, idx: i64) -> Result<usize, Exception> {
    let len = i64::try_from(len).map_err(|_| overflow())?;
    let i = if idx < 0 { idx + len } else { idx };
    if i < 0 || i >= len {
        return Err(Exception::new(ExceptionKind::IndexError, "index out of range"));
    }
    // Checked to be in 0..len above.
    Ok(i as usize)
}

pub fn binary_op(
    kind: BinaryOpKind,
    l: BorrowedObj<'_>,
    r: BorrowedObj<'_>,
) -> Result<ObjRef, Exception> {
    if kind == BinaryOpKind::Subscript {
        return subscript(l, r);
    }
    if let (Some(a), Some(b)) = (l.as_int(), r.as_int()) {
        if let (Value::Bool(x), Value::Bool(y)) = (l.value(), r.value()) {
            match kind {
                BinaryOpKind::And => return Ok(py_bool(*x & *y)),
                BinaryOpKind::Or => return Ok(py_bool(*x | *y)),
                BinaryOpKind::Xor => return Ok(py_bool(*x ^ *y)),
                _ => (),
            }
        }
        let v = match kind {
            BinaryOpKind::Add => a.checked_add(b).ok_or_else(overflow)?,
            BinaryOpKind::Subtract => a.checked_sub(b).ok_or_else(overflow)?,
            BinaryOpKind::Multiply => a.checked_mul(b).ok_or_else(overflow)?,
            BinaryOpKind::FloorDivide => floor_div(a, b)?,
            BinaryOpKind::Modulo => floor_mod(a, b)?,
            BinaryOpKind::And => a & b,
            BinaryOpKind::Or => a | b,
            BinaryOpKind::Xor => a ^ b,
            BinaryOpKind::LShift | BinaryOpKind::RShift => {
                let s = u32::try_from(b)
                    .map_err(|_| {
                        Exception::new(ExceptionKind::ValueError, "negative shift count")
                    })?;
                if kind == BinaryOpKind::LShift {
                    a.checked_shl(s)
                        .filter(|x| *x >> s == a)
                        .ok_or_else(overflow)?
                } else {
                    a >> s.min(63)
                }
            }
            BinaryOpKind::Subscript => unreachable!(),
        };
        return Ok(Object::int(v));
    }
    if let (Some(a), Some(b)) = (as_float(l), as_float(r)) {
        let v = match kind {
            BinaryOpKind::Add => a + b,
            BinaryOpKind::Subtract => a - b,
            BinaryOpKind::Multiply => a * b,
            BinaryOpKind::FloorDivide | BinaryOpKind::Modulo if b == 0.0 => {
                return Err(Exception::new(
                    ExceptionKind::ZeroDivisionError,
                    "float division by zero",
                ))
            }
            BinaryOpKind::FloorDivide => (a / b).floor(),
            BinaryOpKind::Modulo => a - b * (a / b).floor(),
            _ => return Err(unsupported(&kind.to_string(), l, r)),
        };
        return Ok(Object::float(v));
    }
    match (kind, l.value(), r.value()) {
        (BinaryOpKind::Add, Value::Str(a), Value::Str(b)) => Ok(Object::str(&format!("{a}{b}"))),
        (BinaryOpKind::Multiply, Value::Str(a), Value::Int(n)) => {
            Ok(Object::str(&a.repeat(usize::try_from(*n).unwrap_or(0))))
        }
        (BinaryOpKind::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Object::list(items))
        }
        (BinaryOpKind::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Object::tuple(items))
        }
        _ => Err(unsupported(&kind.to_string(), l, r)),
    }
}

fn subscript(c: BorrowedObj<'_>, i: BorrowedObj<'_>) -> Result<ObjRef, Exception> {
    let idx = i
        .as_int()
        .ok_or_else(|| Exception::type_error("indices must be integers"))?;
    match c.value() {
        Value::List(items) | Value::Tuple(items) => {
            let items = items.borrow();
            Ok(items[seq_index(items.len(), idx)?].clone())
        }
        Value::Str(s) => {
            let chars = s.chars().collect::<Vec<_>>();
            let ch = chars[seq_index(chars.len(), idx)?];
            Ok(Object::str(&ch.to_string()))
        }
        _ => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            c.type_name()
        ))),
    }
}

pub fn store_subscr(
    c: BorrowedObj<'_>,
    i: BorrowedObj<'_>,
    v: BorrowedObj<'_>,
) -> Result<(), Exception> {
    let idx = i
        .as_int()
        .ok_or_else(|| Exception::type_error("indices must be integers"))?;
    match c.value() {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = seq_index(items.len(), idx)?;
            items[i] = ObjRef::create(v);
            Ok(())
        }
        _ => Err(Exception::type_error(format!(
            "'{}' object does not support item assignment",
            c.type_name()
        ))),
    }
}

pub fn unary_op(kind: UnaryOpKind, v: BorrowedObj<'_>) -> Result<ObjRef, Exception> {
    match kind {
        UnaryOpKind::Not => Ok(py_bool(!is_truthy(v)?)),
        UnaryOpKind::Negative => match v.value() {
            Value::Float(f) => Ok(Object::float(-f)),
            _ => match v.as_int() {
                Some(i) => Ok(Object::int(i.checked_neg().ok_or_else(overflow)?)),
                None => Err(Exception::type_error(format!(
                    "bad operand type for unary -: '{}'",
                    v.type_name()
                ))),
            },
        },
        UnaryOpKind::Invert => match v.as_int() {
            Some(i) => Ok(Object::int(!i)),
            None => Err(Exception::type_error(format!(
                "bad operand type for unary ~: '{}'",
                v.type_name()
            ))),
        },
    }
}

pub fn is_truthy(v: BorrowedObj<'_>) -> Result<bool, Exception> {
    Ok(match v.value() {
        Value::None => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Tuple(items) | Value::List(items) => !items.borrow().is_empty(),
        Value::Builtin(_) | Value::BoundMethod { .. } | Value::Exception(_) => true,
        Value::Iterator(_) => {
            return Err(Exception::type_error("iterators have no truth value"));
        }
    })
}

fn values_eq(l: BorrowedObj<'_>, r: BorrowedObj<'_>) -> bool {
    if l.ptr_eq(r) {
        return true;
    }
    if let (Some(a), Some(b)) = (l.as_int(), r.as_int()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (as_float(l), as_float(r)) {
        return a == b;
    }
    match (l.value(), r.value()) {
        (Value::None, Value::None) => true,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            a.len() == b.len()
                && a
                    .iter()
                    .zip(b.iter())
                    .all(|(x, y)| values_eq(x.borrow(), y.borrow()))
        }
        _ => false,
    }
}

pub fn compare(op: CompareOp, l: BorrowedObj<'_>, r: BorrowedObj<'_>) -> Result<ObjRef, Exception> {
    let ord = || -> Result<std::cmp::Ordering, Exception> {
        if let (Some(a), Some(b)) = (l.as_int(), r.as_int()) {
            return Ok(a.cmp(&b));
        }
        if let (Some(a), Some(b)) = (as_float(l), as_float(r)) {
            return a
                .partial_cmp(&b)
                .ok_or_else(|| Exception::type_error("unordered comparison"));
        }
        match (l.value(), r.value()) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            _ => Err(Exception::type_error(format!(
                "'{op}' not supported between instances of '{}' and '{}'",
                l.type_name(),
                r.type_name()
            ))),
        }
    };
    let b = match op {
        CompareOp::Is => l.ptr_eq(r),
        CompareOp::IsNot => !l.ptr_eq(r),
        CompareOp::Equal => values_eq(l, r),
        CompareOp::NotEqual => !values_eq(l, r),
        CompareOp::LessThan => ord()?.is_lt(),
        CompareOp::LessThanEqual => ord()?.is_le(),
        CompareOp::GreaterThan => ord()?.is_gt(),
        CompareOp::GreaterThanEqual => ord()?.is_ge(),
    };
    Ok(py_bool(b))
}

pub fn get_iter(v: BorrowedObj<'_>) -> Result<ObjRef, Exception> {
    match v.value() {
        Value::List(_) | Value::Tuple(_) => Ok(Object::new(Value::Iterator(SeqIter {
            seq: ObjRef::create(v),
            idx: Cell::new(0),
        }))),
        Value::Iterator(_) => Ok(ObjRef::create(v)),
        _ => Err(Exception::type_error(format!(
            "'{}' object is not iterable",
            v.type_name()
        ))),
    }
}

/// Return the iterator's next item, or `None` if it is exhausted.
pub fn iter_next(it: BorrowedObj<'_>) -> Result<Option<ObjRef>, Exception> {
    match it.value() {
        Value::Iterator(si) => match si.seq.value() {
            Value::List(items) | Value::Tuple(items) => {
                let items = items.borrow();
                let i = si.idx.get();
                if i < items.len() {
                    si.idx.set(i + 1);
                    Ok(Some(items[i].clone()))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        },
        _ => Err(Exception::type_error(format!(
            "'{}' object is not an iterator",
            it.type_name()
        ))),
    }
}

fn list_append(args: &[BorrowedObj<'_>]) -> Result<ObjRef, Exception> {
    match args {
        [l, x] => match l.value() {
            Value::List(items) => {
                items.borrow_mut().push(ObjRef::create(*x));
                Ok(none())
            }
            _ => Err(Exception::type_error("append requires a list")),
        },
        _ => Err(Exception::type_error("append takes exactly one argument")),
    }
}

fn list_pop(args: &[BorrowedObj<'_>]) -> Result<ObjRef, Exception> {
    match args {
        [l] => match l.value() {
            Value::List(items) => items
                .borrow_mut()
                .pop()
                .ok_or_else(|| Exception::new(ExceptionKind::IndexError, "pop from empty list")),
            _ => Err(Exception::type_error("pop requires a list")),
        },
        _ => Err(Exception::type_error("pop takes no arguments")),
    }
}

fn str_upper(args: &[BorrowedObj<'_>]) -> Result<ObjRef, Exception> {
    match args {
        [s] => match s.value() {
            Value::Str(s) => Ok(Object::str(&s.to_uppercase())),
            _ => Err(Exception::type_error("upper requires a str")),
        },
        _ => Err(Exception::type_error("upper takes no arguments")),
    }
}

fn builtin_len(args: &[BorrowedObj<'_>]) -> Result<ObjRef, Exception> {
    match args {
        [x] => {
            let n = match x.value() {
                Value::Str(s) => s.chars().count(),
                Value::List(items) | Value::Tuple(items) => items.borrow().len(),
                _ => {
                    return Err(Exception::type_error(format!(
                        "object of type '{}' has no len()",
                        x.type_name()
                    )))
                }
            };
            Ok(Object::int(i64::try_from(n).map_err(|_| overflow())?))
        }
        _ => Err(Exception::type_error("len() takes exactly one argument")),
    }
}

/// The builtins every [super::Globals] starts with.
pub fn builtins() -> Vec<(&'static str, ObjRef)> {
    vec![("len", Object::builtin("len", builtin_len))]
}

/// Find the unbound method `name` on `obj`'s type.
fn lookup_method(obj: BorrowedObj<'_>, name: &str) -> Option<ObjRef> {
    match (obj.value(), name) {
        (Value::List(_), "append") => Some(Object::method("append", list_append)),
        (Value::List(_), "pop") => Some(Object::method("pop", list_pop)),
        (Value::Str(_), "upper") => Some(Object::method("upper", str_upper)),
        _ => None,
    }
}

fn no_attr(obj: BorrowedObj<'_>, name: &str) -> Exception {
    Exception::new(
        ExceptionKind::AttributeError,
        format!("'{}' object has no attribute '{name}'", obj.type_name()),
    )
}

pub fn load_attr(obj: BorrowedObj<'_>, name: &str) -> Result<ObjRef, Exception> {
    match lookup_method(obj, name) {
        Some(func) => Ok(Object::new(Value::BoundMethod {
            receiver: ObjRef::create(obj),
            func,
        })),
        None => Err(no_attr(obj, name)),
    }
}

/// Look up `name` for an immediate call: an unbound method if there is one (the caller must pass
/// `obj` as the first argument), otherwise the ordinary attribute.
pub fn load_method(obj: BorrowedObj<'_>, name: &str) -> Result<ObjRef, Exception> {
    match lookup_method(obj, name) {
        Some(m) => Ok(m),
        None => load_attr(obj, name),
    }
}

pub fn call(f: BorrowedObj<'_>, args: &[BorrowedObj<'_>]) -> Result<ObjRef, Exception> {
    match f.value() {
        Value::Builtin(b) => (b.func)(args),
        Value::BoundMethod { receiver, func } => {
            let mut all = Vec::with_capacity(args.len() + 1);
            all.push(receiver.borrow());
            all.extend_from_slice(args);
            call(func.borrow(), &all)
        }
        _ => Err(Exception::type_error(format!(
            "'{}' object is not callable",
            f.type_name()
        ))),
    }
}

/// Call the result of a method load: `callable` came from [load_method] on `receiver`.
pub fn call_method(
    receiver: BorrowedObj<'_>,
    callable: BorrowedObj<'_>,
    args: &[BorrowedObj<'_>],
) -> Result<ObjRef, Exception> {
    if callable.is_unbound_method() {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(receiver);
        all.extend_from_slice(args);
        call(callable, &all)
    } else {
        call(callable, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::object::live_objects;

    #[test]
    fn arithmetic() {
        let a = Object::int(-7);
        let b = Object::int(2);
        let r = binary_op(BinaryOpKind::FloorDivide, a.borrow(), b.borrow()).unwrap();
        assert_eq!(r.as_int(), Some(-4));
        let r = binary_op(BinaryOpKind::Modulo, a.borrow(), b.borrow()).unwrap();
        assert_eq!(r.as_int(), Some(1));
        let z = Object::int(0);
        let e = binary_op(BinaryOpKind::FloorDivide, a.borrow(), z.borrow()).unwrap_err();
        assert_eq!(e.kind, ExceptionKind::ZeroDivisionError);
        let m = Object::int(i64::MAX);
        let e = binary_op(BinaryOpKind::Add, m.borrow(), b.borrow()).unwrap_err();
        assert_eq!(e.kind, ExceptionKind::OverflowError);
        let s = Object::str("a");
        let e = binary_op(BinaryOpKind::Add, s.borrow(), b.borrow()).unwrap_err();
        assert_eq!(e.kind, ExceptionKind::TypeError);
    }

    #[test]
    fn methods_and_calls() {
        let before = live_objects();
        {
            let l = Object::list(vec![]);
            let x = Object::int(4);
            let m = load_method(l.borrow(), "append").unwrap();
            assert!(m.is_unbound_method());
            call_method(l.borrow(), m.borrow(), &[x.borrow()]).unwrap();
            let bm = load_attr(l.borrow(), "append").unwrap();
            assert!(!bm.is_unbound_method());
            call_method(l.borrow(), bm.borrow(), &[x.borrow()]).unwrap();
            assert_eq!(format!("{l:?}"), "[4, 4]");
            let e = load_method(x.borrow(), "append").unwrap_err();
            assert_eq!(e.kind, ExceptionKind::AttributeError);
        }
        assert_eq!(live_objects(), before);
    }

    #[test]
    fn iteration() {
        let t = Object::tuple(vec![Object::int(1), Object::int(2)]);
        let it = get_iter(t.borrow()).unwrap();
        assert_eq!(iter_next(it.borrow()).unwrap().unwrap().as_int(), Some(1));
        assert_eq!(iter_next(it.borrow()).unwrap().unwrap().as_int(), Some(2));
        assert!(iter_next(it.borrow()).unwrap().is_none());
    }
}
