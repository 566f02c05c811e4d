//! Managed objects.
//!
//! Objects are heap allocated and reference counted. The reference count is the first field of
//! [Object] so that compiled code can adjust it with a single instruction on `[obj + 0]`.

use super::{
    exc::Exception,
    refs::{BorrowedRef, Ref, RefCounted},
};
use static_assertions::const_assert_eq;
use std::{
    cell::{Cell, RefCell},
    fmt,
    mem::offset_of,
    ptr::NonNull,
};

pub type ObjRef = Ref<Object>;
pub type BorrowedObj<'a> = BorrowedRef<'a, Object>;

/// The signature of functions implemented natively.
pub type NativeFn = fn(&[BorrowedObj<'_>]) -> Result<ObjRef, Exception>;

/// Objects whose reference count starts here are never freed.
const IMMORTAL_REFCNT: isize = 1 << 40;

#[repr(C)]
pub struct Object {
    refcnt: Cell<isize>,
    value: Value,
}

/// The offset of the reference count inside an [Object].
pub const REFCNT_OFFSET: i32 = 0;
const_assert_eq!(offset_of!(Object, refcnt), 0);

pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Tuples are only mutated while being initialised.
    Tuple(RefCell<Vec<ObjRef>>),
    List(RefCell<Vec<ObjRef>>),
    Builtin(Builtin),
    BoundMethod { receiver: ObjRef, func: ObjRef },
    Iterator(SeqIter),
    Exception(Exception),
}

pub struct Builtin {
    pub name: &'static str,
    pub func: NativeFn,
    /// Is this a method that must be called with its receiver as the first argument?
    pub is_method: bool,
}

/// An iterator over a tuple or a list.
pub struct SeqIter {
    pub seq: ObjRef,
    pub idx: Cell<usize>,
}

thread_local! {
    static LIVE_OBJECTS: Cell<isize> = const { Cell::new(0) };
    static NONE: ObjRef = Object::new_immortal(Value::None);
    static TRUE: ObjRef = Object::new_immortal(Value::Bool(true));
    static FALSE: ObjRef = Object::new_immortal(Value::Bool(false));
}

/// How many mortal objects are currently allocated on this thread?
pub fn live_objects() -> isize {
    LIVE_OBJECTS.with(|x| x.get())
}

pub fn none() -> ObjRef {
    NONE.with(|x| x.clone())
}

pub fn py_true() -> ObjRef {
    TRUE.with(|x| x.clone())
}

pub fn py_false() -> ObjRef {
    FALSE.with(|x| x.clone())
}

pub fn py_bool(b: bool) -> ObjRef {
    if b {
        py_true()
    } else {
        py_false()
    }
}

impl Object {
    pub fn new(value: Value) -> ObjRef {
        LIVE_OBJECTS.with(|x| x.set(x.get() + 1));
        Self::alloc(value, 1)
    }

    fn new_immortal(value: Value) -> ObjRef {
        Self::alloc(value, IMMORTAL_REFCNT)
    }

    fn alloc(value: Value, refcnt: isize) -> ObjRef {
        let b = Box::new(Object {
            refcnt: Cell::new(refcnt),
            value,
        });
        // The box gives us a unique, non-null pointer, and the single reference is ours.
        unsafe { Ref::steal(NonNull::from(Box::leak(b))) }
    }

    pub fn int(i: i64) -> ObjRef {
        Self::new(Value::Int(i))
    }

    pub fn float(f: f64) -> ObjRef {
        Self::new(Value::Float(f))
    }

    pub fn str(s: &str) -> ObjRef {
        Self::new(Value::Str(s.to_owned()))
    }

    pub fn list(items: Vec<ObjRef>) -> ObjRef {
        Self::new(Value::List(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<ObjRef>) -> ObjRef {
        Self::new(Value::Tuple(RefCell::new(items)))
    }

    pub fn builtin(name: &'static str, func: NativeFn) -> ObjRef {
        Self::new(Value::Builtin(Builtin {
            name,
            func,
            is_method: false,
        }))
    }

    pub fn method(name: &'static str, func: NativeFn) -> ObjRef {
        Self::new(Value::Builtin(Builtin {
            name,
            func,
            is_method: true,
        }))
    }

    pub fn exception(e: Exception) -> ObjRef {
        Self::new(Value::Exception(e))
    }

    pub fn refcnt(&self) -> isize {
        self.refcnt.get()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_none(&self) -> bool {
        matches!(self.value, Value::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            Value::Int(i) => Some(i),
            Value::Bool(b) => Some(i64::from(b)),
            _ => None,
        }
    }

    /// Is this an unbound method, i.e. one which expects its receiver as its first argument?
    pub fn is_unbound_method(&self) -> bool {
        matches!(&self.value, Value::Builtin(b) if b.is_method)
    }

    pub fn type_name(&self) -> &'static str {
        match &self.value {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::BoundMethod { .. } => "method",
            Value::Iterator(_) => "iterator",
            Value::Exception(_) => "exception",
        }
    }
}

impl RefCounted for Object {
    fn incref(&self) {
        self.refcnt.set(self.refcnt.get() + 1);
    }

    unsafe fn decref(ptr: NonNull<Self>) {
        let obj = ptr.as_ref();
        let n = obj.refcnt.get() - 1;
        crate::jit_dcheck!(n >= 0, "negative reference count");
        obj.refcnt.set(n);
        if n == 0 {
            drop(Box::from_raw(ptr.as_ptr()));
            LIVE_OBJECTS.with(|x| x.set(x.get() - 1));
        }
    }
}

fn fmt_seq(f: &mut fmt::Formatter<'_>, items: &[ObjRef], open: &str, close: &str) -> fmt::Result {
    write!(f, "{open}")?;
    for (i, x) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{x:?}")?;
    }
    if open == "(" && items.len() == 1 {
        write!(f, ",")?;
    }
    write!(f, "{close}")
}

impl fmt::Debug for Object {
    /// The `repr` of the object.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Str(s) => write!(f, "{s:?}"),
            _ => write!(f, "{self}"),
        }
    }
}

impl fmt::Display for Object {
    /// The `str` of the object.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Tuple(items) => fmt_seq(f, &items.borrow(), "(", ")"),
            Value::List(items) => fmt_seq(f, &items.borrow(), "[", "]"),
            Value::Builtin(b) => write!(f, "<built-in {}>", b.name),
            Value::BoundMethod { func, .. } => write!(f, "<bound {func}>"),
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::Exception(e) => write!(f, "{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singletons_are_shared_and_uncounted() {
        let before = live_objects();
        let a = none();
        let b = none();
        assert!(Ref::ptr_eq(&a, &b));
        assert!(a.is_none());
        assert!(Ref::ptr_eq(&py_bool(true), &py_true()));
        assert_eq!(live_objects(), before);
    }

    #[test]
    fn containers_release_items() {
        let before = live_objects();
        let i = Object::int(1);
        let l = Object::list(vec![i.clone(), Object::str("a")]);
        assert_eq!(i.refcnt(), 2);
        assert_eq!(live_objects(), before + 3);
        drop(l);
        assert_eq!(i.refcnt(), 1);
        drop(i);
        assert_eq!(live_objects(), before);
    }

    #[test]
    fn repr() {
        let t = Object::tuple(vec![Object::int(1)]);
        assert_eq!(format!("{t:?}"), "(1,)");
        let l = Object::list(vec![Object::str("x"), Object::float(1.5), none()]);
        assert_eq!(format!("{l:?}"), "['x', 1.5, None]".replace('\'', "\""));
    }
}
