//! The high-level IR (HIR).
//!
//! A function is a graph of basic blocks. Instructions live in one arena ([Function::instrs]) and
//! blocks are ordered lists of indices into it, so passes can insert instructions without
//! renumbering. Values are held in numbered registers `vN`. HIR as built from bytecode is not in
//! SSA form: each interpreter local is a fixed register that may be assigned to many times.
//!
//! Every instruction that can hand control back to the interpreter (a "deopt base") owns a
//! [DeoptData] recording the interpreter-visible state at that point.

use crate::{
    deopt::RefKind,
    runtime::{
        code::CompareOp,
        frame::BlockStackEntry,
        object::{ObjRef, Value},
        ops::{BinaryOpKind, UnaryOpKind},
        CodeObject,
    },
};
use std::{collections::HashSet, fmt, rc::Rc};
use strum::{Display, FromRepr};
use typed_index_collections::TiVec;

pub mod builder;
pub mod liveness;
mod printer;
pub mod refcount;
pub mod ty;

pub use ty::Type;

/// A virtual register.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Reg(u32);
index_type!(Reg);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockId(u32);
index_type!(BlockId);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An index into [Function::instrs].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstrIdx(u32);
index_type!(InstrIdx);

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
pub enum GuardKind {
    NotNull,
    NotNegative,
    NotNone,
    AlwaysFail,
    Is,
}

#[derive(Clone, Debug)]
pub enum Constant {
    Object(ObjRef),
    Nullptr,
}

/// The interpreter-visible state at a point in a function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameState {
    /// The offset of the next bytecode instruction the interpreter would execute.
    pub next_instr_offset: usize,
    /// One entry per localsplus slot: `None` means the slot is dead.
    pub locals: Vec<Option<Reg>>,
    pub stack: Vec<Reg>,
    pub block_stack: Vec<BlockStackEntry>,
}

impl FrameState {
    /// Every register this frame state refers to.
    pub fn regs(&self) -> impl Iterator<Item = Reg> + '_ {
        self.locals.iter().flatten().chain(self.stack.iter()).copied()
    }
}

/// A register live at a deopt point, and how its reference is held.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegState {
    pub reg: Reg,
    pub ref_kind: RefKind,
}

#[derive(Clone, Debug)]
pub struct DeoptData {
    pub frame_state: FrameState,
    /// Filled in by refcount insertion.
    pub live_regs: Vec<RegState>,
    /// Identifies this deopt point to tools; -1 if there is none.
    pub nonce: i32,
}

#[derive(Clone, Debug)]
pub enum InstrKind {
    LoadArg { idx: usize, name: String },
    LoadConst(Constant),
    LoadGlobal { name_idx: usize, name: String },
    /// Check that the local `idx` is bound: the output is the operand.
    CheckVar { idx: usize, name: String },
    Assign,
    BinaryOp(BinaryOpKind),
    InPlaceOp(BinaryOpKind),
    UnaryOp(UnaryOpKind),
    Compare(CompareOp),
    /// Convert an object to a C truth value.
    IsTruthy,
    CondBranch { t: BlockId, f: BlockId },
    /// Branch to `t` if the operand is non-null, otherwise to `f`.
    CondBranchIterNotDone { t: BlockId, f: BlockId },
    Branch(BlockId),
    Return,
    /// Operands: the callable, then `nargs` arguments.
    VectorCall { nargs: usize },
    LoadAttr { name_idx: usize, name: String },
    LoadMethod { name_idx: usize, name: String },
    /// Operands: the receiver, the result of a `LoadMethod`, then `nargs` arguments.
    CallMethod { nargs: usize },
    MakeListTuple { is_tuple: bool, n: usize },
    /// Operands: the sequence, then `n` items.
    InitListTuple { is_tuple: bool, n: usize },
    /// Operands: container, index, value.
    StoreSubscr,
    GetIter,
    /// Produces the next item of an iterator, or null when it is exhausted.
    InvokeIterNext,
    Guard { kind: GuardKind, target: Option<ObjRef> },
    Deopt,
    Snapshot(FrameState),
    Incref,
    XIncref,
    Decref,
    XDecref,
}

#[derive(Clone, Debug)]
pub struct Instr {
    pub kind: InstrKind,
    pub output: Option<Reg>,
    pub operands: Vec<Reg>,
    pub deopt: Option<Box<DeoptData>>,
}

impl Instr {
    pub fn new(kind: InstrKind, output: Option<Reg>, operands: Vec<Reg>) -> Self {
        Instr {
            kind,
            output,
            operands,
            deopt: None,
        }
    }

    pub fn with_deopt(mut self, frame_state: FrameState, nonce: i32) -> Self {
        self.deopt = Some(Box::new(DeoptData {
            frame_state,
            live_regs: Vec::new(),
            nonce,
        }));
        self
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::CondBranch { .. }
                | InstrKind::CondBranchIterNotDone { .. }
                | InstrKind::Branch(_)
                | InstrKind::Return
                | InstrKind::Deopt
        )
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self.kind {
            InstrKind::CondBranch { t, f } | InstrKind::CondBranchIterNotDone { t, f } => {
                vec![t, f]
            }
            InstrKind::Branch(b) => vec![b],
            _ => Vec::new(),
        }
    }

    /// Replace successor `from` with `to`.
    fn retarget(&mut self, from: BlockId, to: BlockId) {
        let swap = |b: &mut BlockId| {
            if *b == from {
                *b = to;
            }
        };
        match &mut self.kind {
            InstrKind::CondBranch { t, f } | InstrKind::CondBranchIterNotDone { t, f } => {
                swap(t);
                swap(f);
            }
            InstrKind::Branch(b) => swap(b),
            _ => (),
        }
    }

    /// The type of this instruction's output, given the types of its operands.
    fn output_type(&self, reg_types: &TiVec<Reg, Type>) -> Type {
        match &self.kind {
            InstrKind::LoadConst(Constant::Nullptr) => Type::Nullptr,
            InstrKind::LoadConst(Constant::Object(o)) => match o.value() {
                Value::None => Type::NoneType,
                Value::Bool(_) => Type::Bool,
                Value::Int(_) => Type::LongExact,
                Value::Float(_) => Type::FloatExact,
                Value::Str(_) => Type::UnicodeExact,
                Value::Tuple(_) => Type::TupleExact,
                Value::List(_) => Type::ListExact,
                _ => Type::OtherObject,
            },
            InstrKind::Assign => reg_types[self.operands[0]],
            InstrKind::CheckVar { .. } => reg_types[self.operands[0]] & Type::Object,
            InstrKind::UnaryOp(UnaryOpKind::Not) => Type::Bool,
            InstrKind::Compare(CompareOp::Is | CompareOp::IsNot) => Type::Bool,
            InstrKind::IsTruthy => Type::CInt32,
            InstrKind::MakeListTuple { is_tuple: true, .. } => Type::TupleExact,
            InstrKind::MakeListTuple { is_tuple: false, .. } => Type::ListExact,
            InstrKind::InvokeIterNext => Type::OptObject,
            _ => Type::Object,
        }
    }
}

#[derive(Debug, Default)]
pub struct Block {
    pub instrs: Vec<InstrIdx>,
}

pub struct Function {
    pub code: Rc<CodeObject>,
    pub instrs: TiVec<InstrIdx, Instr>,
    pub blocks: TiVec<BlockId, Block>,
    pub entry: BlockId,
    num_regs: usize,
}

impl Function {
    pub fn new(code: Rc<CodeObject>) -> Self {
        let mut blocks = TiVec::new();
        let entry = blocks.push_and_get_key(Block::default());
        Function {
            code,
            instrs: TiVec::new(),
            blocks,
            entry,
            num_regs: 0,
        }
    }

    pub fn fullname(&self) -> String {
        self.code.fullname()
    }

    pub fn new_reg(&mut self) -> Reg {
        let r = Reg::new(self.num_regs);
        self.num_regs += 1;
        r
    }

    pub fn num_regs(&self) -> usize {
        self.num_regs
    }

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push_and_get_key(Block::default())
    }

    /// Append `instr` to the end of block `b`.
    pub fn push(&mut self, b: BlockId, instr: Instr) -> InstrIdx {
        let idx = self.instrs.push_and_get_key(instr);
        self.blocks[b].instrs.push(idx);
        idx
    }

    /// Insert `instr` at position `pos` in block `b`.
    pub fn insert(&mut self, b: BlockId, pos: usize, instr: Instr) -> InstrIdx {
        let idx = self.instrs.push_and_get_key(instr);
        self.blocks[b].instrs.insert(pos, idx);
        idx
    }

    pub fn instr(&self, idx: InstrIdx) -> &Instr {
        &self.instrs[idx]
    }

    /// The instructions of block `b`, in order.
    pub fn block_instrs(&self, b: BlockId) -> impl Iterator<Item = (InstrIdx, &Instr)> + '_ {
        self.blocks[b]
            .instrs
            .iter()
            .map(move |idx| (*idx, &self.instrs[*idx]))
    }

    pub fn terminator(&self, b: BlockId) -> Option<&Instr> {
        self.blocks[b]
            .instrs
            .last()
            .map(|idx| &self.instrs[*idx])
            .filter(|i| i.is_terminator())
    }

    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        self.terminator(b).map(|t| t.successors()).unwrap_or_default()
    }

    /// The predecessors of every reachable block, in increasing order.
    pub fn predecessors(&self) -> TiVec<BlockId, Vec<BlockId>> {
        let mut preds: TiVec<BlockId, Vec<BlockId>> =
            self.blocks.iter().map(|_| Vec::new()).collect();
        for b in self.rpo() {
            for s in self.successors(b) {
                if !preds[s].contains(&b) {
                    preds[s].push(b);
                }
            }
        }
        for p in preds.iter_mut() {
            p.sort();
        }
        preds
    }

    /// The reachable blocks in reverse post order.
    pub fn rpo(&self) -> Vec<BlockId> {
        let mut seen = HashSet::new();
        let mut post = Vec::with_capacity(self.blocks.len());
        // An explicit stack of (block, next successor to visit).
        let mut stack = vec![(self.entry, 0)];
        seen.insert(self.entry);
        while let Some((b, i)) = stack.pop() {
            let succs = self.successors(b);
            if i < succs.len() {
                stack.push((b, i + 1));
                let s = succs[i];
                if seen.insert(s) {
                    stack.push((s, 0));
                }
            } else {
                post.push(b);
            }
        }
        post.reverse();
        post
    }

    /// Split every edge from a block with multiple successors to a block with multiple
    /// predecessors by inserting an empty block on it.
    pub fn split_critical_edges(&mut self) {
        let preds = self.predecessors();
        for b in self.rpo() {
            let succs = self.successors(b);
            if succs.len() < 2 {
                continue;
            }
            for s in succs {
                if preds[s].len() < 2 {
                    continue;
                }
                let nb = self.new_block();
                self.push(nb, Instr::new(InstrKind::Branch(s), None, Vec::new()));
                let term = *self.blocks[b]
                    .instrs
                    .last()
                    .unwrap_or_else(|| crate::jit_abort!("block {b} has no terminator"));
                self.instrs[term].retarget(s, nb);
            }
        }
    }

    /// The type of every register: the union of the types of all its definitions.
    pub fn reg_types(&self) -> TiVec<Reg, Type> {
        let mut tys: TiVec<Reg, Type> = (0..self.num_regs).map(|_| Type::Bottom).collect();
        let blocks = self.rpo();
        loop {
            let mut changed = false;
            for b in &blocks {
                for (_, instr) in self.block_instrs(*b) {
                    if let Some(out) = instr.output {
                        let t = tys[out] | instr.output_type(&tys);
                        if t != tys[out] {
                            tys[out] = t;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                return tys;
            }
        }
    }

    /// If `reg` has exactly one definition, return it.
    pub fn unique_def(&self, reg: Reg) -> Option<InstrIdx> {
        let mut defs = self
            .rpo()
            .into_iter()
            .flat_map(|b| self.blocks[b].instrs.clone())
            .filter(|idx| self.instrs[*idx].output == Some(reg));
        match (defs.next(), defs.next()) {
            (Some(d), None) => Some(d),
            _ => None,
        }
    }

    /// The instruction that really produces `reg`'s value, looking through `Assign`s and
    /// `CheckVar`s with unique definitions.
    pub fn resolve_def(&self, mut reg: Reg) -> Option<InstrIdx> {
        loop {
            let d = self.unique_def(reg)?;
            match self.instrs[d].kind {
                InstrKind::Assign | InstrKind::CheckVar { .. } => reg = self.instrs[d].operands[0],
                _ => return Some(d),
            }
        }
    }

    /// The `LoadMethod`s whose output is only ever used as the callable of a `CallMethod`.
    pub fn optimizable_load_methods(&self) -> HashSet<InstrIdx> {
        let mut out = HashSet::new();
        for b in self.rpo() {
            for (idx, instr) in self.block_instrs(b) {
                if !matches!(instr.kind, InstrKind::LoadMethod { .. }) {
                    continue;
                }
                let Some(reg) = instr.output else { continue };
                if self.unique_def(reg) != Some(idx) {
                    continue;
                }
                let mut ok = true;
                for b2 in self.rpo() {
                    for (_, user) in self.block_instrs(b2) {
                        for (i, op) in user.operands.iter().enumerate() {
                            if *op != reg {
                                continue;
                            }
                            let is_callable =
                                matches!(user.kind, InstrKind::CallMethod { .. }) && i == 1;
                            let is_refcount = matches!(
                                user.kind,
                                InstrKind::Incref
                                    | InstrKind::XIncref
                                    | InstrKind::Decref
                                    | InstrKind::XDecref
                            );
                            if !is_callable && !is_refcount {
                                ok = false;
                            }
                        }
                    }
                }
                if ok {
                    out.insert(idx);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CodeBuilder;

    fn branchy() -> Function {
        let mut f = Function::new(CodeBuilder::new("f").build());
        let b1 = f.new_block();
        let b2 = f.new_block();
        let b3 = f.new_block();
        let v = f.new_reg();
        let e = f.entry;
        f.push(e, Instr::new(InstrKind::LoadConst(Constant::Nullptr), Some(v), vec![]));
        f.push(e, Instr::new(InstrKind::CondBranch { t: b1, f: b3 }, None, vec![v]));
        f.push(b1, Instr::new(InstrKind::CondBranch { t: b2, f: b3 }, None, vec![v]));
        f.push(b2, Instr::new(InstrKind::Branch(b3), None, vec![]));
        f.push(b3, Instr::new(InstrKind::Return, None, vec![v]));
        f
    }

    #[test]
    fn rpo_and_preds() {
        let f = branchy();
        assert_eq!(f.rpo(), vec![BlockId(0), BlockId(1), BlockId(2), BlockId(3)]);
        let preds = f.predecessors();
        assert_eq!(preds[BlockId(3)], vec![BlockId(0), BlockId(1), BlockId(2)]);
    }

    #[test]
    fn critical_edges() {
        let mut f = branchy();
        f.split_critical_edges();
        let preds = f.predecessors();
        for b in f.rpo() {
            let succs = f.successors(b);
            if succs.len() > 1 {
                for s in succs {
                    assert_eq!(preds[s].len(), 1);
                }
            }
        }
        assert_eq!(preds[BlockId(3)].len(), 3);
        assert_eq!(f.blocks.len(), 6);
    }
}
