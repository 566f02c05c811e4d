//! Lower HIR (with explicit reference counting) to LIR.
//!
//! HIR registers may be assigned more than once; LIR virtual registers may not. Lowering walks
//! the blocks in reverse post order tracking which LIR value each HIR register currently holds.
//! Blocks with several predecessors get a `Phi` for every HIR register live into them, whose
//! inputs are filled in once every block has been lowered.
//!
//! Almost every HIR operation becomes a call to a helper in [crate::runtime::helpers] followed by
//! a `Guard` on its result. A guard's inputs are `[kind, deopt index, value, (target), live
//! values...]`, where the live values are in the order of the deopt point's
//! [DeoptMetadata::live_values].

use super::{BlockId, DataType, Function, InstrId, MemReg, Opcode, Operand};
use crate::{
    codegen::phyloc::PhyLocation,
    deopt::DeoptMetadata,
    hir::{
        self, liveness::Liveness, Constant, GuardKind, InstrIdx, InstrKind, Reg, Type,
    },
    runtime::{
        helpers,
        object::{ObjRef, REFCNT_OFFSET},
        Globals,
    },
};
use std::{
    collections::{HashMap, HashSet},
    rc::Rc,
};
use typed_index_collections::TiVec;

/// The result of lowering: the LIR and the objects whose addresses it embeds.
pub struct Lowered {
    pub func: Function,
    pub keep_alive: Vec<ObjRef>,
}

type Env = HashMap<Reg, Operand>;

struct Lowerer<'a> {
    hir: &'a hir::Function,
    globals: &'a Rc<Globals>,
    lir: Function,
    types: TiVec<Reg, Type>,
    optimizable: HashSet<InstrIdx>,
    blocks: HashMap<hir::BlockId, BlockId>,
    exit_envs: HashMap<hir::BlockId, Env>,
    /// Phis to fill in: (phi, block, HIR register).
    phis: Vec<(InstrId, hir::BlockId, Reg)>,
    args: Option<InstrId>,
    keep_alive: Vec<ObjRef>,
}

pub fn lower(hir: &hir::Function, globals: &Rc<Globals>) -> Lowered {
    let mut l = Lowerer {
        hir,
        globals,
        lir: Function::new(&hir.fullname()),
        types: hir.reg_types(),
        optimizable: hir.optimizable_load_methods(),
        blocks: HashMap::new(),
        exit_envs: HashMap::new(),
        phis: Vec::new(),
        args: None,
        keep_alive: Vec::new(),
    };
    l.lower_function();
    Lowered {
        func: l.lir,
        keep_alive: l.keep_alive,
    }
}

impl Lowerer<'_> {
    fn lower_function(&mut self) {
        let order = self.hir.rpo();
        for b in &order {
            let lb = self.lir.new_block();
            self.blocks.insert(*b, lb);
        }
        let preds = self.hir.predecessors();
        let liveness = Liveness::new(self.hir);

        let entry = self.blocks[&self.hir.entry];
        let args = self.lir.push(
            entry,
            Opcode::Bind,
            Some(DataType::Object),
            vec![Operand::reg(PhyLocation::RDI, DataType::Object)],
        );
        self.args = Some(args);

        for b in order {
            let lb = self.blocks[&b];
            let mut env = match preds[b][..] {
                [] => Env::new(),
                [p] => match self.exit_envs.get(&p) {
                    Some(e) => e.clone(),
                    None => crate::jit_abort!("bb {b}'s only predecessor {p} is not lowered"),
                },
                _ => {
                    let mut env = Env::new();
                    for r in liveness.live_in[b].iter_set_bits(..).map(Reg::new) {
                        let ty = self.data_type(r);
                        let phi = self.lir.push(lb, Opcode::Phi, Some(ty), Vec::new());
                        env.insert(r, Operand::linked(phi, ty));
                        self.phis.push((phi, b, r));
                    }
                    env
                }
            };
            for idx in self.hir.blocks[b].instrs.clone() {
                self.lir.origin = Some(idx);
                self.lower_instr(lb, idx, &mut env);
            }
            self.lir.origin = None;
            self.exit_envs.insert(b, env);
        }

        for (phi, b, r) in std::mem::take(&mut self.phis) {
            for p in &preds[b] {
                let v = self.value(&self.exit_envs[p], r);
                self.lir.add_input(phi, Operand::label(self.blocks[p]));
                self.lir.add_input(phi, v);
            }
        }
    }

    fn data_type(&self, r: Reg) -> DataType {
        let t = self.types[r];
        if t.could_be(Type::Object) || t.le(Type::Nullptr) {
            DataType::Object
        } else {
            DataType::Bits64
        }
    }

    fn value(&self, env: &Env, r: Reg) -> Operand {
        match env.get(&r) {
            Some(v) => *v,
            None => crate::jit_abort!("{r} has no value"),
        }
    }

    fn values(&self, env: &Env, rs: &[Reg]) -> Vec<Operand> {
        rs.iter().map(|r| self.value(env, *r)).collect()
    }

    fn imm(v: u64) -> Operand {
        Operand::imm(v, DataType::Bits64)
    }

    fn code_addr(&self) -> u64 {
        Rc::as_ptr(&self.hir.code) as u64
    }

    /// Emit a call to the helper at `addr`.
    fn call(
        &mut self,
        b: BlockId,
        addr: usize,
        args: Vec<Operand>,
        out: Option<DataType>,
    ) -> Option<InstrId> {
        let mut inputs = vec![Self::imm(addr as u64)];
        inputs.extend(args);
        let id = self.lir.push(b, Opcode::Call, out, inputs);
        out.map(|_| id)
    }

    /// Record the deopt point of `idx`, returning its index.
    fn deopt(&mut self, idx: InstrIdx) -> usize {
        self.lir
            .deopts
            .push(DeoptMetadata::from_instr(self.hir, idx, &self.optimizable));
        self.lir.deopts.len() - 1
    }

    fn guard(
        &mut self,
        b: BlockId,
        idx: InstrIdx,
        env: &Env,
        kind: GuardKind,
        value: Operand,
        target: Option<Operand>,
    ) {
        let deopt_idx = self.deopt(idx);
        let mut inputs = vec![Self::imm(kind as u64), Self::imm(deopt_idx as u64), value];
        inputs.extend(target);
        if let Some(d) = &self.hir.instr(idx).deopt {
            for rs in &d.live_regs {
                inputs.push(self.value(env, rs.reg));
            }
        }
        self.lir.push(b, Opcode::Guard, None, inputs);
    }

    /// Call `addr` and, if `idx` is a deopt base, guard that the result signals success.
    fn call_checked(
        &mut self,
        b: BlockId,
        idx: InstrIdx,
        env: &Env,
        addr: usize,
        args: Vec<Operand>,
        out: DataType,
    ) -> Operand {
        let Some(id) = self.call(b, addr, args, Some(out)) else {
            crate::jit_abort!("call without an output")
        };
        let v = Operand::linked(id, out);
        if self.hir.instr(idx).deopt.is_some() {
            let kind = if out == DataType::Object {
                GuardKind::NotNull
            } else {
                GuardKind::NotNegative
            };
            self.guard(b, idx, env, kind, v, None);
        }
        v
    }

    fn lower_instr(&mut self, b: BlockId, idx: InstrIdx, env: &mut Env) {
        let hir = self.hir;
        let instr = hir.instr(idx);
        let ops = self.values(env, &instr.operands);
        let obj = DataType::Object;
        let result = match &instr.kind {
            InstrKind::LoadArg { idx: i, .. } => {
                let Some(args) = self.args else {
                    crate::jit_abort!("arguments are not bound")
                };
                let src = Operand::ind(MemReg::VReg(args), 8 * (*i as i32), obj);
                let id = self.lir.push(b, Opcode::Move, Some(obj), vec![src]);
                Some(Operand::linked(id, obj))
            }
            InstrKind::LoadConst(c) => {
                let addr = match c {
                    Constant::Object(o) => {
                        self.keep_alive.push(o.clone());
                        o.as_ptr() as u64
                    }
                    Constant::Nullptr => 0,
                };
                let id = self.lir.push(b, Opcode::Move, Some(obj), vec![Operand::imm(addr, obj)]);
                Some(Operand::linked(id, obj))
            }
            InstrKind::LoadGlobal { name_idx, .. } => {
                let args = vec![
                    Self::imm(self.code_addr()),
                    Self::imm(Rc::as_ptr(self.globals) as u64),
                    Self::imm(*name_idx as u64),
                ];
                Some(self.call_checked(b, idx, env, helpers::jit_load_global as usize, args, obj))
            }
            InstrKind::CheckVar { .. } => {
                self.guard(b, idx, env, GuardKind::NotNull, ops[0], None);
                Some(ops[0])
            }
            InstrKind::Assign => Some(ops[0]),
            InstrKind::BinaryOp(k) | InstrKind::InPlaceOp(k) => {
                let args = vec![Self::imm(*k as u64), ops[0], ops[1]];
                Some(self.call_checked(b, idx, env, helpers::jit_binary_op as usize, args, obj))
            }
            InstrKind::UnaryOp(k) => {
                let args = vec![Self::imm(*k as u64), ops[0]];
                Some(self.call_checked(b, idx, env, helpers::jit_unary_op as usize, args, obj))
            }
            InstrKind::Compare(op) => {
                let args = vec![Self::imm(*op as u64), ops[0], ops[1]];
                Some(self.call_checked(b, idx, env, helpers::jit_compare as usize, args, obj))
            }
            InstrKind::IsTruthy => Some(self.call_checked(
                b,
                idx,
                env,
                helpers::jit_is_truthy as usize,
                ops,
                DataType::Bits64,
            )),
            InstrKind::CondBranch { t, f } => {
                let inputs = vec![
                    ops[0],
                    Operand::label(self.blocks[t]),
                    Operand::label(self.blocks[f]),
                ];
                self.lir.push(b, Opcode::CondBranch, None, inputs);
                None
            }
            InstrKind::CondBranchIterNotDone { t, f } => {
                self.lir.push(b, Opcode::Test, None, vec![ops[0], ops[0]]);
                let inputs = vec![Operand::label(self.blocks[t]), Operand::label(self.blocks[f])];
                self.lir.push(b, Opcode::BranchNZ, None, inputs);
                None
            }
            InstrKind::Branch(t) => {
                let target = Operand::label(self.blocks[t]);
                self.lir.push(b, Opcode::Branch, None, vec![target]);
                None
            }
            InstrKind::Return => {
                self.lir.push(b, Opcode::Return, None, ops);
                None
            }
            InstrKind::VectorCall { nargs } => {
                let addr = helpers::call_helper(*nargs);
                Some(self.call_checked(b, idx, env, addr, ops, obj))
            }
            InstrKind::LoadAttr { name_idx, .. } => {
                let args = vec![Self::imm(self.code_addr()), Self::imm(*name_idx as u64), ops[0]];
                Some(self.call_checked(b, idx, env, helpers::jit_load_attr as usize, args, obj))
            }
            InstrKind::LoadMethod { name_idx, .. } => {
                let addr = if self.optimizable.contains(&idx) {
                    helpers::jit_load_method as usize
                } else {
                    helpers::jit_load_attr as usize
                };
                let args = vec![Self::imm(self.code_addr()), Self::imm(*name_idx as u64), ops[0]];
                Some(self.call_checked(b, idx, env, addr, args, obj))
            }
            InstrKind::CallMethod { nargs } => {
                let addr = helpers::call_method_helper(*nargs);
                Some(self.call_checked(b, idx, env, addr, ops, obj))
            }
            InstrKind::MakeListTuple { is_tuple, n } => {
                let addr = if *is_tuple {
                    helpers::jit_make_tuple as usize
                } else {
                    helpers::jit_make_list as usize
                };
                self.call(b, addr, vec![Self::imm(*n as u64)], Some(obj))
                    .map(|id| Operand::linked(id, obj))
            }
            InstrKind::InitListTuple { .. } => {
                for (i, item) in ops[1..].iter().enumerate() {
                    let args = vec![ops[0], Self::imm(i as u64), *item];
                    self.call(b, helpers::jit_list_tuple_set as usize, args, None);
                }
                None
            }
            InstrKind::StoreSubscr => {
                self.call_checked(
                    b,
                    idx,
                    env,
                    helpers::jit_store_subscr as usize,
                    ops,
                    DataType::Bits64,
                );
                None
            }
            InstrKind::GetIter => {
                Some(self.call_checked(b, idx, env, helpers::jit_get_iter as usize, ops, obj))
            }
            InstrKind::InvokeIterNext => self
                .call(b, helpers::jit_iter_next as usize, ops, Some(obj))
                .map(|id| Operand::linked(id, obj)),
            InstrKind::Guard { kind, target } => {
                let target = target.as_ref().map(|o| {
                    self.keep_alive.push(o.clone());
                    Operand::imm(o.as_ptr() as u64, obj)
                });
                self.guard(b, idx, env, *kind, ops[0], target);
                None
            }
            InstrKind::Deopt => {
                self.guard(b, idx, env, GuardKind::AlwaysFail, Self::imm(0), None);
                None
            }
            InstrKind::Snapshot(_) => None,
            InstrKind::Incref => {
                let refcnt = Operand::ind(self.mem_reg(ops[0]), REFCNT_OFFSET, DataType::Bits64);
                self.lir.push(b, Opcode::Inc, None, vec![refcnt]);
                None
            }
            InstrKind::XIncref => {
                self.call(b, helpers::jit_xincref as usize, ops, None);
                None
            }
            InstrKind::Decref => {
                self.call(b, helpers::jit_decref as usize, ops, None);
                None
            }
            InstrKind::XDecref => {
                self.call(b, helpers::jit_xdecref as usize, ops, None);
                None
            }
        };
        if let (Some(out), Some(v)) = (instr.output, result) {
            env.insert(out, v);
        }
    }

    fn mem_reg(&self, o: Operand) -> MemReg {
        match o.def() {
            Some(d) => MemReg::VReg(d),
            None => crate::jit_abort!("{o} is not a virtual register"),
        }
    }
}
