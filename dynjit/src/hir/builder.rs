//! Translate bytecode into HIR.
//!
//! The translation simulates the interpreter's operand stack with registers. Every interpreter
//! local is given a fixed register (`v0` onwards), so the resulting HIR is not in SSA form. Where
//! control flow merges with values on the stack, each predecessor assigns its stack values into a
//! shared set of fresh registers.

use super::{
    BlockId, Constant, FrameState, Function, GuardKind, Instr, InstrKind, Reg,
};
use crate::{
    compile::CompilationError,
    runtime::{
        code::{BcInstr, CodeObject, CompareOp, Opcode},
        frame::{BlockStackEntry, Globals},
        ops::{BinaryOpKind, UnaryOpKind},
    },
};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    rc::Rc,
};

/// The most arguments a `CALL_FUNCTION` can pass.
pub const MAX_CALL_ARGS: usize = 4;
/// The most arguments a `CALL_METHOD` can pass (excluding the receiver).
pub const MAX_CALL_METHOD_ARGS: usize = 3;

/// The simulated interpreter state inside a block.
#[derive(Clone, Debug, Default)]
struct TranslationState {
    stack: Vec<Reg>,
    block_stack: Vec<BlockStackEntry>,
}

struct HIRBuilder<'a> {
    code: Rc<CodeObject>,
    globals: &'a Globals,
    func: Function,
    instrs: Vec<BcInstr>,
    /// The end offset of each bytecode block, keyed by start offset.
    block_ends: HashMap<usize, usize>,
    num_preds: HashMap<usize, usize>,
    hir_blocks: HashMap<usize, BlockId>,
    entry_states: HashMap<usize, TranslationState>,
    merge_regs: HashMap<usize, Vec<Reg>>,
    locals: Vec<Reg>,
    next_nonce: i32,
}

/// Build HIR for `code`. Globals which exist at compile time are assumed not to change, with a
/// guard deoptimising if they do.
pub fn build(code: Rc<CodeObject>, globals: &Globals) -> Result<Function, CompilationError> {
    let instrs = code
        .instrs()
        .map_err(|e| CompilationError::General(e.to_string()))?;
    if instrs.is_empty() {
        return Err(CompilationError::General("empty code object".into()));
    }
    let mut b = HIRBuilder {
        func: Function::new(Rc::clone(&code)),
        code,
        globals,
        instrs,
        block_ends: HashMap::new(),
        num_preds: HashMap::new(),
        hir_blocks: HashMap::new(),
        entry_states: HashMap::new(),
        merge_regs: HashMap::new(),
        locals: Vec::new(),
        next_nonce: 0,
    };
    b.find_blocks()?;
    b.translate()?;
    Ok(b.func)
}

/// The bytecode successors of the block ending in `last`.
fn bc_successors(last: &BcInstr, end: usize) -> Vec<usize> {
    match last.opcode {
        Opcode::ReturnValue => Vec::new(),
        Opcode::JumpAbsolute | Opcode::JumpForward => last.jump_target().into_iter().collect(),
        Opcode::PopJumpIfFalse
        | Opcode::PopJumpIfTrue
        | Opcode::JumpIfFalseOrPop
        | Opcode::JumpIfTrueOrPop
        | Opcode::ForIter => {
            let mut v = vec![end];
            v.extend(last.jump_target());
            v
        }
        _ => vec![end],
    }
}

fn ends_block(op: Opcode) -> bool {
    op != Opcode::SetupFinally && (op.jump_target(0, 0).is_some() || op == Opcode::ReturnValue)
}

/// Can the interpreter re-execute this instruction without observable effects?
fn is_replay_safe(instr: &BcInstr) -> bool {
    match instr.opcode {
        Opcode::LoadFast
        | Opcode::LoadConst
        | Opcode::StoreFast
        | Opcode::PopTop
        | Opcode::RotTwo
        | Opcode::DupTop
        | Opcode::Nop => true,
        Opcode::CompareOp => matches!(
            CompareOp::from_repr(instr.arg),
            Some(CompareOp::Is | CompareOp::IsNot)
        ),
        _ => false,
    }
}

impl HIRBuilder<'_> {
    fn find_blocks(&mut self) -> Result<(), CompilationError> {
        let code_len = self.code.code.len();
        let mut starts = BTreeSet::from([0]);
        for i in &self.instrs {
            if i.opcode != Opcode::SetupFinally {
                if let Some(t) = i.jump_target() {
                    starts.insert(t);
                }
            }
            if ends_block(i.opcode) && i.next_offset() < code_len {
                starts.insert(i.next_offset());
            }
        }
        let starts = starts.into_iter().collect::<Vec<_>>();
        for (i, s) in starts.iter().enumerate() {
            if *s >= code_len {
                return Err(CompilationError::General(format!(
                    "jump to offset {s} beyond end of code"
                )));
            }
            let end = starts.get(i + 1).copied().unwrap_or(code_len);
            self.block_ends.insert(*s, end);
        }

        // Count the predecessors of every reachable block.
        let mut seen = HashSet::from([0]);
        let mut todo = vec![0];
        while let Some(s) = todo.pop() {
            let end = self.block_ends[&s];
            let last = self.instr_at(end - 2)?;
            for succ in bc_successors(&last, end) {
                if succ >= code_len {
                    return Err(CompilationError::General(format!(
                        "control falls off the end of {}",
                        self.code.fullname()
                    )));
                }
                *self.num_preds.entry(succ).or_insert(0) += 1;
                if seen.insert(succ) {
                    todo.push(succ);
                }
            }
        }
        Ok(())
    }

    fn instr_at(&self, off: usize) -> Result<BcInstr, CompilationError> {
        self.instrs
            .get(off / 2)
            .copied()
            .ok_or_else(|| CompilationError::InternalError(format!("no instruction at {off}")))
    }

    fn translate(&mut self) -> Result<(), CompilationError> {
        let entry = self.func.entry;
        for i in 0..self.code.nlocalsplus() {
            let r = self.func.new_reg();
            let kind = if i < self.code.argcount {
                InstrKind::LoadArg {
                    idx: i,
                    name: self.code.varnames[i].clone(),
                }
            } else {
                InstrKind::LoadConst(Constant::Nullptr)
            };
            self.func.push(entry, Instr::new(kind, Some(r), Vec::new()));
            self.locals.push(r);
        }
        if self.num_preds.contains_key(&0) {
            // Offset 0 is a loop header: it needs a block of its own.
            *self.num_preds.entry(0).or_insert(0) += 1;
            let b0 = self.block_for(0);
            self.func
                .push(entry, Instr::new(InstrKind::Branch(b0), None, Vec::new()));
        } else {
            self.hir_blocks.insert(0, entry);
        }
        self.entry_states.insert(0, TranslationState::default());

        let mut todo = vec![0];
        let mut done = HashSet::new();
        while let Some(start) = todo.pop() {
            if !done.insert(start) {
                continue;
            }
            let state = self.entry_states[&start].clone();
            for succ in self.translate_block(start, state)? {
                if !done.contains(&succ) {
                    todo.push(succ);
                }
            }
        }
        Ok(())
    }

    fn block_for(&mut self, off: usize) -> BlockId {
        if let Some(b) = self.hir_blocks.get(&off) {
            return *b;
        }
        let b = self.func.new_block();
        self.hir_blocks.insert(off, b);
        b
    }

    fn frame_state(&self, state: &TranslationState, next_instr_offset: usize) -> FrameState {
        FrameState {
            next_instr_offset,
            locals: self.locals.iter().map(|r| Some(*r)).collect(),
            stack: state.stack.clone(),
            block_stack: state.block_stack.clone(),
        }
    }

    fn snapshot(&mut self, b: BlockId, state: &TranslationState, next_instr_offset: usize) {
        let fs = self.frame_state(state, next_instr_offset);
        self.func
            .push(b, Instr::new(InstrKind::Snapshot(fs), None, Vec::new()));
    }

    /// Emit a deopt base instruction whose frame state is `state` resuming at `next`.
    fn emit_deopt(
        &mut self,
        b: BlockId,
        kind: InstrKind,
        operands: Vec<Reg>,
        state: &TranslationState,
        next: usize,
    ) -> Reg {
        let out = self.func.new_reg();
        let fs = self.frame_state(state, next);
        self.func
            .push(b, Instr::new(kind, Some(out), operands).with_deopt(fs, -1));
        out
    }

    fn emit(&mut self, b: BlockId, kind: InstrKind, operands: Vec<Reg>) -> Reg {
        let out = self.func.new_reg();
        self.func.push(b, Instr::new(kind, Some(out), operands));
        out
    }

    fn pop(state: &mut TranslationState) -> Result<Reg, CompilationError> {
        state
            .stack
            .pop()
            .ok_or_else(|| CompilationError::General("operand stack underflow".into()))
    }

    fn pop_n(state: &mut TranslationState, n: usize) -> Result<Vec<Reg>, CompilationError> {
        if state.stack.len() < n {
            return Err(CompilationError::General("operand stack underflow".into()));
        }
        Ok(state.stack.split_off(state.stack.len() - n))
    }

    /// Prepare the edge from `from` to the bytecode block at `target` and return the HIR block
    /// to transfer control to. If `conditional`, any assignments needed for a merge are placed in
    /// a new block on the edge, otherwise they are appended to `from`.
    fn edge(
        &mut self,
        from: BlockId,
        target: usize,
        state: &TranslationState,
        conditional: bool,
    ) -> Result<BlockId, CompilationError> {
        let target_block = self.block_for(target);
        let merging = self.num_preds.get(&target).copied().unwrap_or(0) > 1;
        if !merging || state.stack.is_empty() {
            self.record_entry(target, state.clone())?;
            return Ok(target_block);
        }
        let merge = match self.merge_regs.get(&target) {
            Some(m) => m.clone(),
            None => {
                let m = (0..state.stack.len())
                    .map(|_| self.func.new_reg())
                    .collect::<Vec<_>>();
                self.merge_regs.insert(target, m.clone());
                m
            }
        };
        if merge.len() != state.stack.len() {
            return Err(CompilationError::General(format!(
                "inconsistent stack depth at offset {target}"
            )));
        }
        let assigns = merge
            .iter()
            .zip(state.stack.iter())
            .filter(|(m, s)| m != s)
            .map(|(m, s)| Instr::new(InstrKind::Assign, Some(*m), vec![*s]))
            .collect::<Vec<_>>();
        let dest = if conditional && !assigns.is_empty() {
            let eb = self.func.new_block();
            for a in assigns {
                self.func.push(eb, a);
            }
            self.func.push(
                eb,
                Instr::new(InstrKind::Branch(target_block), None, Vec::new()),
            );
            eb
        } else {
            for a in assigns {
                self.func.push(from, a);
            }
            target_block
        };
        self.record_entry(
            target,
            TranslationState {
                stack: merge,
                block_stack: state.block_stack.clone(),
            },
        )?;
        Ok(dest)
    }

    fn record_entry(
        &mut self,
        target: usize,
        state: TranslationState,
    ) -> Result<(), CompilationError> {
        match self.entry_states.get(&target) {
            Some(s) if s.stack.len() != state.stack.len() => Err(CompilationError::General(
                format!("inconsistent stack depth at offset {target}"),
            )),
            Some(_) => Ok(()),
            None => {
                self.entry_states.insert(target, state);
                Ok(())
            }
        }
    }

    /// Before local `idx` is overwritten, give any stack entries referring to it their own
    /// register.
    fn move_overwritten(&mut self, b: BlockId, idx: usize, state: &mut TranslationState) {
        let local = self.locals[idx];
        if !state.stack.contains(&local) {
            return;
        }
        let copy = self.emit(b, InstrKind::Assign, vec![local]);
        for r in state.stack.iter_mut() {
            if *r == local {
                *r = copy;
            }
        }
    }

    /// Translate the bytecode block starting at `start` and return its successors.
    fn translate_block(
        &mut self,
        start: usize,
        mut state: TranslationState,
    ) -> Result<Vec<usize>, CompilationError> {
        let b = self.block_for(start);
        let end = self.block_ends[&start];
        let mut bound = (0..self.code.argcount).collect::<HashSet<_>>();
        self.snapshot(b, &state, start);
        let mut off = start;
        while off < end {
            let instr = self.instr_at(off)?;
            let next = instr.next_offset();
            let arg = usize::from(instr.arg);
            match instr.opcode {
                Opcode::Nop => (),
                Opcode::PopTop => {
                    Self::pop(&mut state)?;
                }
                Opcode::RotTwo => {
                    let a = Self::pop(&mut state)?;
                    let c = Self::pop(&mut state)?;
                    state.stack.push(a);
                    state.stack.push(c);
                }
                Opcode::DupTop => {
                    let a = Self::pop(&mut state)?;
                    state.stack.push(a);
                    state.stack.push(a);
                }
                Opcode::LoadFast => {
                    let local = *self.locals.get(arg).ok_or_else(|| {
                        CompilationError::General(format!("local {arg} out of range"))
                    })?;
                    if bound.contains(&arg) {
                        state.stack.push(local);
                    } else {
                        let kind = InstrKind::CheckVar {
                            idx: arg,
                            name: self.code.varnames[arg].clone(),
                        };
                        let out = self.emit_deopt(b, kind, vec![local], &state, next);
                        bound.insert(arg);
                        state.stack.push(out);
                    }
                }
                Opcode::StoreFast => {
                    let v = Self::pop(&mut state)?;
                    if arg >= self.locals.len() {
                        return Err(CompilationError::General(format!(
                            "local {arg} out of range"
                        )));
                    }
                    let local = self.locals[arg];
                    if v != local {
                        self.move_overwritten(b, arg, &mut state);
                        self.func
                            .push(b, Instr::new(InstrKind::Assign, Some(local), vec![v]));
                    }
                    bound.insert(arg);
                }
                Opcode::LoadConst => {
                    let c = self.code.consts.get(arg).cloned().ok_or_else(|| {
                        CompilationError::General(format!("constant {arg} out of range"))
                    })?;
                    let out = self.emit(b, InstrKind::LoadConst(Constant::Object(c)), Vec::new());
                    state.stack.push(out);
                }
                op @ (Opcode::UnaryNot | Opcode::UnaryNegative | Opcode::UnaryInvert) => {
                    let v = Self::pop(&mut state)?;
                    let kind = UnaryOpKind::from_opcode(op)
                        .ok_or_else(|| CompilationError::InternalError(op.to_string()))?;
                    let out = self.emit_deopt(b, InstrKind::UnaryOp(kind), vec![v], &state, next);
                    state.stack.push(out);
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
                    let r = Self::pop(&mut state)?;
                    let l = Self::pop(&mut state)?;
                    let kind = BinaryOpKind::from_opcode(op)
                        .ok_or_else(|| CompilationError::InternalError(op.to_string()))?;
                    let inplace = matches!(
                        op,
                        Opcode::InplaceAdd
                            | Opcode::InplaceSubtract
                            | Opcode::InplaceMultiply
                            | Opcode::InplaceXor
                    );
                    let kind = if inplace {
                        InstrKind::InPlaceOp(kind)
                    } else {
                        InstrKind::BinaryOp(kind)
                    };
                    let out = self.emit_deopt(b, kind, vec![l, r], &state, next);
                    state.stack.push(out);
                }
                Opcode::StoreSubscr => {
                    let i = Self::pop(&mut state)?;
                    let c = Self::pop(&mut state)?;
                    let v = Self::pop(&mut state)?;
                    let fs = self.frame_state(&state, next);
                    self.func.push(
                        b,
                        Instr::new(InstrKind::StoreSubscr, None, vec![c, i, v]).with_deopt(fs, -1),
                    );
                }
                Opcode::GetIter => {
                    let v = Self::pop(&mut state)?;
                    let out = self.emit_deopt(b, InstrKind::GetIter, vec![v], &state, next);
                    state.stack.push(out);
                }
                Opcode::ForIter => {
                    let it = *state
                        .stack
                        .last()
                        .ok_or_else(|| {
                            CompilationError::General("FOR_ITER on empty stack".into())
                        })?;
                    let item = self.emit(b, InstrKind::InvokeIterNext, vec![it]);
                    let exit = instr.jump_target().unwrap_or(next);
                    let mut body_state = state.clone();
                    body_state.stack.push(item);
                    let mut exit_state = state.clone();
                    exit_state.stack.pop();
                    let t = self.edge(b, next, &body_state, true)?;
                    let f = self.edge(b, exit, &exit_state, true)?;
                    self.func.push(
                        b,
                        Instr::new(InstrKind::CondBranchIterNotDone { t, f }, None, vec![item]),
                    );
                    return Ok(vec![next, exit]);
                }
                Opcode::ReturnValue => {
                    let v = Self::pop(&mut state)?;
                    self.func
                        .push(b, Instr::new(InstrKind::Return, None, vec![v]));
                    return Ok(Vec::new());
                }
                Opcode::PopBlock => {
                    state.block_stack.pop().ok_or_else(|| {
                        CompilationError::General("POP_BLOCK with empty block stack".into())
                    })?;
                }
                Opcode::SetupFinally => {
                    let handler_off = instr.jump_target().unwrap_or(next);
                    state.block_stack.push(BlockStackEntry {
                        opcode: Opcode::SetupFinally as u8,
                        handler_off,
                        level: state.stack.len(),
                    });
                }
                Opcode::LoadGlobal => {
                    let name = self.name(arg)?;
                    let kind = InstrKind::LoadGlobal {
                        name_idx: arg,
                        name: name.clone(),
                    };
                    let out = self.emit_deopt(b, kind, Vec::new(), &state, next);
                    state.stack.push(out);
                    if let Some(v) = self.globals.get(&name) {
                        let fs = self.frame_state(&state, next);
                        let nonce = self.next_nonce;
                        self.next_nonce += 1;
                        let guard = InstrKind::Guard {
                            kind: GuardKind::Is,
                            target: Some(v),
                        };
                        self.func
                            .push(b, Instr::new(guard, None, vec![out]).with_deopt(fs, nonce));
                    }
                }
                Opcode::LoadAttr => {
                    let o = Self::pop(&mut state)?;
                    let name = self.name(arg)?;
                    let kind = InstrKind::LoadAttr {
                        name_idx: arg,
                        name,
                    };
                    let out = self.emit_deopt(b, kind, vec![o], &state, next);
                    state.stack.push(out);
                }
                Opcode::LoadMethod => {
                    let o = *state
                        .stack
                        .last()
                        .ok_or_else(|| {
                            CompilationError::General("operand stack underflow".into())
                        })?;
                    let name = self.name(arg)?;
                    let kind = InstrKind::LoadMethod {
                        name_idx: arg,
                        name,
                    };
                    let out = self.emit_deopt(b, kind, vec![o], &state, next);
                    state.stack.push(out);
                }
                Opcode::CallMethod => {
                    if arg > MAX_CALL_METHOD_ARGS {
                        return Err(CompilationError::LimitExceeded(format!(
                            "CALL_METHOD with {arg} arguments"
                        )));
                    }
                    let args = Self::pop_n(&mut state, arg)?;
                    let callable = Self::pop(&mut state)?;
                    let recv = Self::pop(&mut state)?;
                    let mut ops = vec![recv, callable];
                    ops.extend(args);
                    let out =
                        self.emit_deopt(b, InstrKind::CallMethod { nargs: arg }, ops, &state, next);
                    state.stack.push(out);
                }
                Opcode::CallFunction => {
                    if arg > MAX_CALL_ARGS {
                        return Err(CompilationError::LimitExceeded(format!(
                            "CALL_FUNCTION with {arg} arguments"
                        )));
                    }
                    let args = Self::pop_n(&mut state, arg)?;
                    let f = Self::pop(&mut state)?;
                    let mut ops = vec![f];
                    ops.extend(args);
                    let out =
                        self.emit_deopt(b, InstrKind::VectorCall { nargs: arg }, ops, &state, next);
                    state.stack.push(out);
                }
                Opcode::BuildList | Opcode::BuildTuple => {
                    let is_tuple = instr.opcode == Opcode::BuildTuple;
                    let items = Self::pop_n(&mut state, arg)?;
                    let kind = InstrKind::MakeListTuple { is_tuple, n: arg };
                    let seq = self.emit(b, kind, Vec::new());
                    let mut ops = vec![seq];
                    ops.extend(items);
                    self.func.push(
                        b,
                        Instr::new(InstrKind::InitListTuple { is_tuple, n: arg }, None, ops),
                    );
                    state.stack.push(seq);
                }
                Opcode::CompareOp => {
                    let op = CompareOp::from_repr(instr.arg).ok_or_else(|| {
                        CompilationError::General(format!("unknown comparison {arg}"))
                    })?;
                    let r = Self::pop(&mut state)?;
                    let l = Self::pop(&mut state)?;
                    let out = if matches!(op, CompareOp::Is | CompareOp::IsNot) {
                        self.emit(b, InstrKind::Compare(op), vec![l, r])
                    } else {
                        self.emit_deopt(b, InstrKind::Compare(op), vec![l, r], &state, next)
                    };
                    state.stack.push(out);
                }
                Opcode::JumpForward | Opcode::JumpAbsolute => {
                    let target = instr.jump_target().unwrap_or(next);
                    let tb = self.edge(b, target, &state, false)?;
                    self.func
                        .push(b, Instr::new(InstrKind::Branch(tb), None, Vec::new()));
                    return Ok(vec![target]);
                }
                Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                    let v = Self::pop(&mut state)?;
                    let c = self.emit_deopt(b, InstrKind::IsTruthy, vec![v], &state, next);
                    let target = instr.jump_target().unwrap_or(next);
                    let jb = self.edge(b, target, &state, true)?;
                    let fb = self.edge(b, next, &state, true)?;
                    let (t, f) = if instr.opcode == Opcode::PopJumpIfTrue {
                        (jb, fb)
                    } else {
                        (fb, jb)
                    };
                    self.func
                        .push(b, Instr::new(InstrKind::CondBranch { t, f }, None, vec![c]));
                    return Ok(vec![next, target]);
                }
                Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                    let v = *state
                        .stack
                        .last()
                        .ok_or_else(|| {
                            CompilationError::General("operand stack underflow".into())
                        })?;
                    let c = self.emit_deopt(b, InstrKind::IsTruthy, vec![v], &state, next);
                    let target = instr.jump_target().unwrap_or(next);
                    let mut popped = state.clone();
                    popped.stack.pop();
                    let jb = self.edge(b, target, &state, true)?;
                    let fb = self.edge(b, next, &popped, true)?;
                    let (t, f) = if instr.opcode == Opcode::JumpIfTrueOrPop {
                        (jb, fb)
                    } else {
                        (fb, jb)
                    };
                    self.func
                        .push(b, Instr::new(InstrKind::CondBranch { t, f }, None, vec![c]));
                    return Ok(vec![next, target]);
                }
            }
            if !is_replay_safe(&instr) && next < end {
                self.snapshot(b, &state, next);
            }
            off = next;
        }
        // Fall through into the next block.
        let tb = self.edge(b, end, &state, false)?;
        self.func
            .push(b, Instr::new(InstrKind::Branch(tb), None, Vec::new()));
        Ok(vec![end])
    }

    fn name(&self, idx: usize) -> Result<String, CompilationError> {
        self.code
            .names
            .get(idx)
            .cloned()
            .ok_or_else(|| CompilationError::General(format!("name {idx} out of range")))
    }
}
