//! Deoptimisation metadata and frame reification.
//!
//! Every HIR instruction which can hand control back to the interpreter is compiled with a
//! [DeoptMetadata] record describing, in terms of machine locations, how to rebuild the
//! interpreter's view of the frame: which values are live, where they end up after register
//! allocation, how their references are held, and how they map onto the frame's locals and
//! operand stack. When a guard fails or an exception must unwind, [reify_frame] uses a dump of the
//! machine registers to construct that frame.

use crate::{
    codegen::phyloc::PhyLocation,
    hir::{self, InstrKind, Type},
    runtime::{
        frame::{BlockStackEntry, Frame},
        object::{py_bool, BorrowedObj, ObjRef, Object},
    },
};
use std::{collections::HashSet, fmt, ptr::NonNull};
use strum::Display;

/// How a live value is held at a deopt point.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum RefKind {
    /// Not a reference counted object.
    Uncounted,
    /// An object whose reference is owned by someone else.
    Borrowed,
    /// An object whose reference is owned by the compiled code.
    Owned,
    Signed,
    Unsigned,
    Bool,
    Double,
}

/// Where a live value came from, as far as the load-method convention is concerned.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ValueSource {
    /// The result of a `LoadMethod` that was compiled with the unbound-method fast path.
    Optimizable,
    /// The result of a `LoadMethod` that was compiled as a plain attribute load.
    Unoptimizable,
    Unknown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LiveValue {
    pub location: PhyLocation,
    pub ref_kind: RefKind,
    pub source: ValueSource,
}

impl LiveValue {
    pub fn is_load_method_result(&self) -> bool {
        self.source != ValueSource::Unknown
    }
}

#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq)]
pub enum DeoptReason {
    GuardFailure,
    Raise,
    RaiseStatic,
    Reraise,
    #[default]
    UnhandledException,
    UnhandledUnboundLocal,
    UnhandledNullField,
    UnhandledNone,
}

#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq)]
pub enum DeoptAction {
    /// Continue executing the function in the interpreter.
    ResumeInInterpreter,
    /// Raise the pending exception in the reified frame.
    #[default]
    Unwind,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeoptMetadata {
    pub reason: DeoptReason,
    pub action: DeoptAction,
    /// For unbound locals, the index of the local whose name to report; -1 otherwise.
    pub eh_name_index: i32,
    pub live_values: Vec<LiveValue>,
    /// One entry per localsplus slot: an index into `live_values`, or -1 if the slot is dead.
    pub localsplus: Vec<i32>,
    /// Indices into `live_values`, bottom of the stack first.
    pub stack: Vec<i32>,
    pub block_stack: Vec<BlockStackEntry>,
    pub next_instr_offset: usize,
    pub nonce: i32,
}

impl Default for DeoptMetadata {
    fn default() -> Self {
        DeoptMetadata {
            reason: DeoptReason::default(),
            action: DeoptAction::default(),
            eh_name_index: -1,
            live_values: Vec::new(),
            localsplus: Vec::new(),
            stack: Vec::new(),
            block_stack: Vec::new(),
            next_instr_offset: 0,
            nonce: -1,
        }
    }
}

/// Classify a value of type `ty` whose reference, if it is an object, is held as `lifetime`.
pub fn deopt_ref_kind(ty: Type, lifetime: RefKind) -> RefKind {
    if ty == Type::Bottom {
        return lifetime;
    }
    if ty.le(Type::CBool) {
        RefKind::Bool
    } else if ty.le(Type::CInt | Type::Nullptr) && ty.could_be(Type::CInt) {
        RefKind::Signed
    } else if ty.le(Type::CUInt) {
        RefKind::Unsigned
    } else if ty.le(Type::CDouble) {
        RefKind::Double
    } else {
        lifetime
    }
}

impl DeoptMetadata {
    /// Build the metadata for the deopt base `idx` of `func`. `optimizable` is the set of
    /// `LoadMethod`s compiled with the unbound-method fast path.
    pub fn from_instr(
        func: &hir::Function,
        idx: hir::InstrIdx,
        optimizable: &HashSet<hir::InstrIdx>,
    ) -> DeoptMetadata {
        let instr = func.instr(idx);
        let Some(d) = &instr.deopt else {
            crate::jit_abort!("{} is not a deopt base", instr.kind.name())
        };
        let types = func.reg_types();

        let live_values = d
            .live_regs
            .iter()
            .map(|rs| {
                let source = match func.resolve_def(rs.reg) {
                    Some(def) if matches!(func.instr(def).kind, InstrKind::LoadMethod { .. }) => {
                        if optimizable.contains(&def) {
                            ValueSource::Optimizable
                        } else {
                            ValueSource::Unoptimizable
                        }
                    }
                    _ => ValueSource::Unknown,
                };
                LiveValue {
                    location: PhyLocation::REG_INVALID,
                    ref_kind: deopt_ref_kind(types[rs.reg], rs.ref_kind),
                    source,
                }
            })
            .collect();

        let index_of = |r: hir::Reg| -> i32 {
            match d.live_regs.iter().position(|rs| rs.reg == r) {
                Some(i) => i as i32,
                None => crate::jit_abort!("register {r} is missing from the live values"),
            }
        };
        let fs = &d.frame_state;
        let localsplus = fs
            .locals
            .iter()
            .map(|l| l.map_or(-1, index_of))
            .collect();
        let stack = fs.stack.iter().map(|r| index_of(*r)).collect();

        let (reason, action, eh_name_index) = match &instr.kind {
            InstrKind::Guard { .. } | InstrKind::Deopt => {
                (DeoptReason::GuardFailure, DeoptAction::ResumeInInterpreter, -1)
            }
            InstrKind::CheckVar { idx, .. } => (
                DeoptReason::UnhandledUnboundLocal,
                DeoptAction::Unwind,
                *idx as i32,
            ),
            _ => (DeoptReason::UnhandledException, DeoptAction::Unwind, -1),
        };

        DeoptMetadata {
            reason,
            action,
            eh_name_index,
            live_values,
            localsplus,
            stack,
            block_stack: fs.block_stack.clone(),
            next_instr_offset: fs.next_instr_offset,
            nonce: d.nonce,
        }
    }

    pub fn stack_value(&self, i: usize) -> &LiveValue {
        &self.live_values[self.stack[i] as usize]
    }

    /// The value of local `i`, or `None` if it is dead.
    pub fn local_value(&self, i: usize) -> Option<&LiveValue> {
        let v = self.localsplus[i];
        if v < 0 {
            None
        } else {
            Some(&self.live_values[v as usize])
        }
    }
}

impl fmt::Display for DeoptMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @{}", self.reason, self.action, self.next_instr_offset)?;
        for (i, lv) in self.live_values.iter().enumerate() {
            write!(f, " {i}:{}:{}", lv.location, lv.ref_kind)?;
        }
        Ok(())
    }
}

/// Read the raw machine word of `lv`.
///
/// # Safety
///
/// If `lv` lives in a stack slot, `regs[RBP]` must be the frame pointer of a live frame.
unsafe fn raw_value(lv: &LiveValue, regs: &[u64]) -> u64 {
    let loc = lv.location;
    if loc.is_register() {
        crate::jit_check!(
            (loc.loc() as usize) < regs.len(),
            "no saved value for {loc}"
        );
        regs[loc.loc() as usize]
    } else {
        crate::jit_check!(loc != PhyLocation::REG_INVALID, "live value was never placed");
        let addr = regs[PhyLocation::RBP.loc() as usize].wrapping_add_signed(i64::from(loc.loc()));
        *(addr as *const u64)
    }
}

/// Produce a new reference for `raw`, a value classified as `lv`. Null objects are `None`.
///
/// # Safety
///
/// If `raw` is a non-null object pointer, it must point to a live object.
unsafe fn box_value(lv: &LiveValue, raw: u64) -> Option<ObjRef> {
    match lv.ref_kind {
        RefKind::Signed => Some(Object::int(raw as i64)),
        RefKind::Unsigned => {
            crate::jit_check!(i64::try_from(raw).is_ok(), "unsigned value {raw} overflows");
            Some(Object::int(raw as i64))
        }
        RefKind::Bool => Some(py_bool(raw != 0)),
        RefKind::Double => Some(Object::float(f64::from_bits(raw))),
        RefKind::Uncounted | RefKind::Borrowed | RefKind::Owned => {
            NonNull::new(raw as *mut Object).map(|p| ObjRef::create(BorrowedObj::from_raw(p)))
        }
    }
}

/// Populate `frame` from the live values of `meta` as found in `regs`, a dump of the general
/// purpose registers indexed by [PhyLocation]. `frame`'s code and globals must already be set.
///
/// Afterwards the frame holds its own reference to every value, and the references the compiled
/// code owned have been released.
///
/// # Safety
///
/// `regs` must be the register state at the deopt point `meta` describes, so that every object
/// value is a live object and every stack slot is readable through `regs[RBP]`.
pub unsafe fn reify_frame(frame: &mut Frame, meta: &DeoptMetadata, regs: &[u64]) {
    crate::jit_check!(
        frame.localsplus.len() == meta.localsplus.len(),
        "frame has {} locals, metadata {}",
        frame.localsplus.len(),
        meta.localsplus.len()
    );
    for (i, slot) in frame.localsplus.iter_mut().enumerate() {
        *slot = match meta.local_value(i) {
            Some(lv) => box_value(lv, raw_value(lv, regs)),
            None => None,
        };
    }

    frame.stack.clear();
    let mut i = 0;
    while i < meta.stack.len() {
        let lv = meta.stack_value(i);
        if i + 1 < meta.stack.len() && meta.stack_value(i + 1).is_load_method_result() {
            let callable_lv = meta.stack_value(i + 1);
            let Some(callable) = box_value(callable_lv, raw_value(callable_lv, regs)) else {
                crate::jit_abort!("null method on the stack at {i}")
            };
            if callable_lv.source == ValueSource::Optimizable && callable.is_unbound_method() {
                let receiver = box_value(lv, raw_value(lv, regs));
                crate::jit_check!(receiver.is_some(), "null receiver on the stack at {i}");
                frame.stack.push(Some(callable));
                frame.stack.push(receiver);
            } else {
                frame.stack.push(None);
                frame.stack.push(Some(callable));
            }
            i += 2;
            continue;
        }
        let v = box_value(lv, raw_value(lv, regs));
        crate::jit_check!(v.is_some(), "null value on the stack at {i}");
        frame.stack.push(v);
        i += 1;
    }

    frame.block_stack = meta.block_stack.clone();
    frame.next_instr_offset = meta.next_instr_offset;

    for lv in &meta.live_values {
        if lv.ref_kind == RefKind::Owned {
            if let Some(p) = NonNull::new(raw_value(lv, regs) as *mut Object) {
                drop(ObjRef::steal(p));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hir::{builder::build, refcount::insert_refcount_ops},
        runtime::{
            code::{CodeBuilder, Opcode},
            object::live_objects,
            refs::Ref,
            Globals,
        },
    };

    fn frame(nlocals: usize) -> Frame {
        let names = (0..nlocals).map(|i| format!("l{i}")).collect::<Vec<_>>();
        let names = names.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        Frame::new(CodeBuilder::new("f").locals(&names).build(), Globals::new())
    }

    fn reg(loc: PhyLocation, ref_kind: RefKind) -> LiveValue {
        LiveValue {
            location: loc,
            ref_kind,
            source: ValueSource::Unknown,
        }
    }

    fn ptr(o: &ObjRef) -> u64 {
        o.as_ptr() as u64
    }

    #[test]
    fn round_trip_locals_and_stack() {
        let before = live_objects();
        {
            let a = Object::int(1);
            let b = Object::str("b");
            let meta = DeoptMetadata {
                live_values: vec![
                    reg(PhyLocation::RBX, RefKind::Borrowed),
                    reg(PhyLocation::R12, RefKind::Borrowed),
                ],
                localsplus: vec![0, -1, 1],
                stack: vec![1, 0],
                next_instr_offset: 6,
                ..Default::default()
            };
            let mut regs = [0u64; 16];
            regs[PhyLocation::RBX.loc() as usize] = ptr(&a);
            regs[PhyLocation::R12.loc() as usize] = ptr(&b);
            let mut f = frame(3);
            unsafe { reify_frame(&mut f, &meta, &regs) };
            assert!(Ref::ptr_eq(f.localsplus[0].as_ref().unwrap(), &a));
            assert!(f.localsplus[1].is_none());
            assert!(Ref::ptr_eq(f.localsplus[2].as_ref().unwrap(), &b));
            assert_eq!(f.stack.len(), 2);
            assert!(Ref::ptr_eq(f.stack[0].as_ref().unwrap(), &b));
            assert!(Ref::ptr_eq(f.stack[1].as_ref().unwrap(), &a));
            assert_eq!(f.next_instr_offset, 6);
            assert_eq!(a.refcnt(), 3);
            drop(f);
            assert_eq!(a.refcnt(), 1);
            assert_eq!(b.refcnt(), 1);
        }
        assert_eq!(live_objects(), before);
    }

    #[test]
    fn owned_and_borrowed_net_one() {
        let a = Object::int(7);
        // The compiled code owns one reference, which it hands over to the frame.
        let owned = a.clone().release();
        let meta = DeoptMetadata {
            live_values: vec![
                reg(PhyLocation::RAX, RefKind::Owned),
                reg(PhyLocation::RCX, RefKind::Borrowed),
            ],
            localsplus: vec![0],
            stack: vec![1],
            ..Default::default()
        };
        let mut regs = [0u64; 16];
        regs[0] = owned.as_ptr() as u64;
        regs[1] = ptr(&a);
        assert_eq!(a.refcnt(), 2);
        let mut f = frame(1);
        unsafe { reify_frame(&mut f, &meta, &regs) };
        assert_eq!(a.refcnt(), 3);
        drop(f);
        assert_eq!(a.refcnt(), 1);
    }

    #[test]
    fn guard_without_live_values() {
        let meta = DeoptMetadata {
            reason: DeoptReason::GuardFailure,
            action: DeoptAction::ResumeInInterpreter,
            localsplus: vec![-1, -1],
            next_instr_offset: 12,
            ..Default::default()
        };
        let mut f = frame(2);
        f.stack.push(Some(Object::int(1)));
        unsafe { reify_frame(&mut f, &meta, &[0; 16]) };
        assert!(f.localsplus.iter().all(|l| l.is_none()));
        assert!(f.stack.is_empty());
        assert_eq!(f.next_instr_offset, 12);
    }

    #[test]
    fn stack_slots_and_primitives() {
        let a = Object::str("spilled");
        let mut slots = [0u64; 4];
        slots[3] = ptr(&a);
        slots[2] = (-5i64) as u64;
        let mut regs = [0u64; 16];
        regs[PhyLocation::RBP.loc() as usize] = slots.as_ptr() as u64 + 32;
        regs[PhyLocation::RDX.loc() as usize] = 1;
        let meta = DeoptMetadata {
            live_values: vec![
                reg(PhyLocation::new(-8), RefKind::Borrowed),
                reg(PhyLocation::new(-16), RefKind::Signed),
                reg(PhyLocation::RDX, RefKind::Bool),
            ],
            localsplus: vec![0],
            stack: vec![1, 2],
            ..Default::default()
        };
        let mut f = frame(1);
        unsafe { reify_frame(&mut f, &meta, &regs) };
        assert!(Ref::ptr_eq(f.localsplus[0].as_ref().unwrap(), &a));
        assert_eq!(f.stack[0].as_ref().unwrap().as_int(), Some(-5));
        assert_eq!(f.stack[1].as_ref().unwrap().to_string(), "True");
    }

    #[test]
    fn load_method_pairs() {
        let recv = Object::list(Vec::new());
        let append = Object::method("append", |_| Ok(crate::runtime::object::none()));
        let lm = |source| LiveValue {
            location: PhyLocation::RCX,
            ref_kind: RefKind::Owned,
            source,
        };
        let mut regs = [0u64; 16];
        regs[PhyLocation::RAX.loc() as usize] = ptr(&recv);
        regs[PhyLocation::RCX.loc() as usize] = ptr(&append);
        let mut meta = DeoptMetadata {
            live_values: vec![
                reg(PhyLocation::RAX, RefKind::Borrowed),
                lm(ValueSource::Optimizable),
            ],
            stack: vec![0, 1],
            ..Default::default()
        };
        let mut f = frame(0);
        // Keep the method alive across the release of the owned reference.
        let _owned = append.clone().release();
        unsafe { reify_frame(&mut f, &meta, &regs) };
        assert!(Ref::ptr_eq(f.stack[0].as_ref().unwrap(), &append));
        assert!(Ref::ptr_eq(f.stack[1].as_ref().unwrap(), &recv));

        meta.live_values[1] = lm(ValueSource::Unoptimizable);
        let _owned = append.clone().release();
        unsafe { reify_frame(&mut f, &meta, &regs) };
        assert!(f.stack[0].is_none());
        assert!(Ref::ptr_eq(f.stack[1].as_ref().unwrap(), &append));
        drop(f);
        assert_eq!(append.refcnt(), 1);
    }

    #[test]
    fn ref_kinds() {
        assert_eq!(deopt_ref_kind(Type::CBool, RefKind::Owned), RefKind::Bool);
        assert_eq!(deopt_ref_kind(Type::CInt32, RefKind::Owned), RefKind::Signed);
        assert_eq!(
            deopt_ref_kind(Type::CInt64 | Type::Nullptr, RefKind::Owned),
            RefKind::Signed
        );
        assert_eq!(deopt_ref_kind(Type::CUInt8, RefKind::Owned), RefKind::Unsigned);
        assert_eq!(deopt_ref_kind(Type::CDouble, RefKind::Owned), RefKind::Double);
        assert_eq!(deopt_ref_kind(Type::Object, RefKind::Owned), RefKind::Owned);
        assert_eq!(deopt_ref_kind(Type::Nullptr, RefKind::Uncounted), RefKind::Uncounted);
    }

    #[test]
    fn from_hir() {
        // def f(x): y; return g
        let code = CodeBuilder::new("f")
            .args(&["x"])
            .locals(&["y"])
            .names(&["g"])
            .op(Opcode::LoadFast, 1)
            .op(Opcode::PopTop, 0)
            .op(Opcode::LoadGlobal, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        let globals = Globals::new();
        globals.set("g", Object::int(4));
        let mut func = build(code, &globals).unwrap();
        insert_refcount_ops(&mut func);
        let metas = func
            .rpo()
            .into_iter()
            .flat_map(|b| func.blocks[b].instrs.clone())
            .filter(|idx| func.instr(*idx).deopt.is_some())
            .map(|idx| DeoptMetadata::from_instr(&func, idx, &HashSet::new()))
            .collect::<Vec<_>>();

        let check_var = &metas[0];
        assert_eq!(check_var.reason, DeoptReason::UnhandledUnboundLocal);
        assert_eq!(check_var.action, DeoptAction::Unwind);
        assert_eq!(check_var.eh_name_index, 1);
        // `y` has never been assigned, so is not an object yet.
        assert_eq!(check_var.local_value(0).unwrap().ref_kind, RefKind::Owned);
        assert_eq!(check_var.local_value(1).unwrap().ref_kind, RefKind::Uncounted);

        let guard = metas
            .iter()
            .find(|m| m.reason == DeoptReason::GuardFailure)
            .unwrap();
        assert_eq!(guard.action, DeoptAction::ResumeInInterpreter);
        assert_eq!(guard.stack.len(), 1);
        assert!(guard.nonce >= 0);
        globals.clear();
    }
}
