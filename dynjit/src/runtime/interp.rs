//! The bytecode interpreter.
//!
//! This is both the baseline tier and the place deoptimised frames are resumed in, so it can start
//! executing at any offset with any operand and block stack.

use super::{
    code::{CodeObject, CompareOp, Opcode},
    exc::{Exception, ExceptionKind},
    frame::{BlockStackEntry, Frame, Globals},
    object::{BorrowedObj, ObjRef, Object},
    ops::{self, BinaryOpKind, UnaryOpKind},
};
use std::rc::Rc;

fn stack_error(msg: &str) -> Exception {
    Exception::new(ExceptionKind::SystemError, msg)
}

impl Frame {
    fn push(&mut self, x: ObjRef) {
        self.stack.push(Some(x));
    }

    /// Pop a slot that may be the null half of a method-load pair.
    fn pop_opt(&mut self) -> Result<Option<ObjRef>, Exception> {
        self.stack
            .pop()
            .ok_or_else(|| stack_error("operand stack underflow"))
    }

    fn pop(&mut self) -> Result<ObjRef, Exception> {
        self.pop_opt()?
            .ok_or_else(|| stack_error("unexpected null on operand stack"))
    }

    fn top(&self) -> Result<BorrowedObj<'_>, Exception> {
        match self.stack.last() {
            Some(Some(x)) => Ok(x.borrow()),
            _ => Err(stack_error("no object on top of operand stack")),
        }
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<ObjRef>, Exception> {
        if self.stack.len() < n {
            return Err(stack_error("operand stack underflow"));
        }
        self.stack
            .split_off(self.stack.len() - n)
            .into_iter()
            .map(|x| x.ok_or_else(|| stack_error("unexpected null on operand stack")))
            .collect()
    }

    fn name(&self, idx: u8) -> Result<&str, Exception> {
        self.code
            .names
            .get(usize::from(idx))
            .map(|x| x.as_str())
            .ok_or_else(|| stack_error("name index out of range"))
    }
}

/// What to do after executing one instruction.
enum Step {
    Next,
    Jump(usize),
    Return(ObjRef),
}

/// Execute `frame` from its next instruction offset until it returns.
pub fn eval_frame(frame: &mut Frame) -> Result<ObjRef, Exception> {
    loop {
        match step(frame) {
            Ok(Step::Next) => (),
            Ok(Step::Jump(off)) => frame.next_instr_offset = off,
            Ok(Step::Return(x)) => return Ok(x),
            Err(e) => unwind(frame, e)?,
        }
    }
}

/// Transfer control to the innermost exception handler, or return `exc` if there is none.
pub fn unwind(frame: &mut Frame, exc: Exception) -> Result<(), Exception> {
    while let Some(b) = frame.block_stack.pop() {
        if b.opcode != Opcode::SetupFinally as u8 {
            continue;
        }
        frame.stack.truncate(b.level);
        frame.push(Object::exception(exc));
        frame.next_instr_offset = b.handler_off;
        return Ok(());
    }
    frame.stack.clear();
    Err(exc)
}

/// Call `code` with `args`.
pub fn call_function(
    code: Rc<CodeObject>,
    globals: Rc<Globals>,
    args: &[BorrowedObj<'_>],
) -> Result<ObjRef, Exception> {
    if args.len() != code.argcount {
        return Err(Exception::type_error(format!(
            "{}() takes {} positional arguments but {} were given",
            code.name,
            code.argcount,
            args.len()
        )));
    }
    let mut frame = Frame::for_call(code, globals, args);
    eval_frame(&mut frame)
}

fn step(frame: &mut Frame) -> Result<Step, Exception> {
    let instr = frame.code.instr_at(frame.next_instr_offset)?;
    frame.next_instr_offset = instr.next_offset();
    let arg = instr.arg;
    match instr.opcode {
        Opcode::Nop => (),
        Opcode::PopTop => {
            frame.pop_opt()?;
        }
        Opcode::RotTwo => {
            let n = frame.stack.len();
            if n < 2 {
                return Err(stack_error("operand stack underflow"));
            }
            frame.stack.swap(n - 1, n - 2);
        }
        Opcode::DupTop => {
            let x = ObjRef::create(frame.top()?);
            frame.push(x);
        }
        op @ (Opcode::UnaryNot | Opcode::UnaryNegative | Opcode::UnaryInvert) => {
            let v = frame.pop()?;
            let kind = UnaryOpKind::from_opcode(op).ok_or_else(|| stack_error("bad unary op"))?;
            frame.push(ops::unary_op(kind, v.borrow())?);
        }
        op @ (Opcode::BinaryAdd
        | Opcode::BinarySubtract
        | Opcode::BinaryMultiply
        | Opcode::BinaryFloorDivide
        | Opcode::BinaryModulo
        | Opcode::BinarySubscr
        | Opcode::BinaryAnd
        | Opcode::BinaryOr
        | Opcode::BinaryXor
        | Opcode::BinaryLshift
        | Opcode::BinaryRshift
        | Opcode::InplaceAdd
        | Opcode::InplaceSubtract
        | Opcode::InplaceMultiply
        | Opcode::InplaceXor) => {
            let r = frame.pop()?;
            let l = frame.pop()?;
            let kind = BinaryOpKind::from_opcode(op).ok_or_else(|| stack_error("bad binary op"))?;
            frame.push(ops::binary_op(kind, l.borrow(), r.borrow())?);
        }
        Opcode::StoreSubscr => {
            let i = frame.pop()?;
            let c = frame.pop()?;
            let v = frame.pop()?;
            ops::store_subscr(c.borrow(), i.borrow(), v.borrow())?;
        }
        Opcode::GetIter => {
            let v = frame.pop()?;
            frame.push(ops::get_iter(v.borrow())?);
        }
        Opcode::ForIter => {
            let next = ops::iter_next(frame.top()?)?;
            match next {
                Some(x) => frame.push(x),
                None => {
                    frame.pop()?;
                    return Ok(Step::Jump(instr.jump_target().unwrap_or(instr.next_offset())));
                }
            }
        }
        Opcode::ReturnValue => return Ok(Step::Return(frame.pop()?)),
        Opcode::PopBlock => {
            frame
                .block_stack
                .pop()
                .ok_or_else(|| stack_error("block stack underflow"))?;
        }
        Opcode::SetupFinally => {
            let handler_off = instr
                .jump_target()
                .ok_or_else(|| stack_error("SETUP_FINALLY without target"))?;
            let level = frame.stack.len();
            frame.block_stack.push(BlockStackEntry {
                opcode: Opcode::SetupFinally as u8,
                handler_off,
                level,
            });
        }
        Opcode::LoadConst => {
            let c = frame
                .code
                .consts
                .get(usize::from(arg))
                .cloned()
                .ok_or_else(|| stack_error("constant index out of range"))?;
            frame.push(c);
        }
        Opcode::LoadGlobal => {
            let name = frame.name(arg)?;
            let v = frame
                .globals
                .get(name)
                .ok_or_else(|| Exception::name_error(name))?;
            frame.push(v);
        }
        Opcode::LoadFast => {
            let idx = usize::from(arg);
            match frame.localsplus.get(idx) {
                Some(Some(x)) => {
                    let x = x.clone();
                    frame.push(x);
                }
                Some(None) => {
                    return Err(Exception::unbound_local(&frame.code.varnames[idx]));
                }
                None => return Err(stack_error("local index out of range")),
            }
        }
        Opcode::StoreFast => {
            let v = frame.pop()?;
            let slot = frame
                .localsplus
                .get_mut(usize::from(arg))
                .ok_or_else(|| stack_error("local index out of range"))?;
            *slot = Some(v);
        }
        Opcode::LoadAttr => {
            let obj = frame.pop()?;
            let v = ops::load_attr(obj.borrow(), frame.name(arg)?)?;
            frame.push(v);
        }
        Opcode::LoadMethod => {
            let obj = frame.pop()?;
            let m = ops::load_method(obj.borrow(), frame.name(arg)?)?;
            if m.is_unbound_method() {
                frame.push(m);
                frame.push(obj);
            } else {
                frame.stack.push(None);
                frame.push(m);
            }
        }
        Opcode::CallMethod => {
            let args = frame.pop_n(usize::from(arg))?;
            let second = frame.pop()?;
            let first = frame.pop_opt()?;
            let args = args.iter().map(|x| x.borrow()).collect::<Vec<_>>();
            let res = match first {
                Some(meth) => ops::call_method(second.borrow(), meth.borrow(), &args)?,
                None => ops::call(second.borrow(), &args)?,
            };
            frame.push(res);
        }
        Opcode::CallFunction => {
            let args = frame.pop_n(usize::from(arg))?;
            let f = frame.pop()?;
            let args = args.iter().map(|x| x.borrow()).collect::<Vec<_>>();
            frame.push(ops::call(f.borrow(), &args)?);
        }
        Opcode::BuildList => {
            let items = frame.pop_n(usize::from(arg))?;
            frame.push(Object::list(items));
        }
        Opcode::BuildTuple => {
            let items = frame.pop_n(usize::from(arg))?;
            frame.push(Object::tuple(items));
        }
        Opcode::CompareOp => {
            let r = frame.pop()?;
            let l = frame.pop()?;
            let op = CompareOp::from_repr(arg)
                .ok_or_else(|| stack_error("unknown comparison"))?;
            frame.push(ops::compare(op, l.borrow(), r.borrow())?);
        }
        Opcode::JumpForward | Opcode::JumpAbsolute => {
            return Ok(Step::Jump(instr.jump_target().unwrap_or(instr.next_offset())));
        }
        Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
            let v = frame.pop()?;
            let t = ops::is_truthy(v.borrow())?;
            if t == (instr.opcode == Opcode::PopJumpIfTrue) {
                return Ok(Step::Jump(usize::from(arg)));
            }
        }
        Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
            let t = ops::is_truthy(frame.top()?)?;
            if t == (instr.opcode == Opcode::JumpIfTrueOrPop) {
                return Ok(Step::Jump(usize::from(arg)));
            }
            frame.pop()?;
        }
    }
    Ok(Step::Next)
}
