//! Emit x64 machine code for register-allocated LIR.
//!
//! The frame looks like this, with `N` a multiple of 16:
//!
//! ```text
//! [rbp + 8]          return address
//! [rbp]              caller's rbp
//! [rbp - 8 * (i+1)]  callee-saved register i
//! [rbp - 8 * (n+k+1)] spill slot k
//! [rbp - N]          rsp
//! ```
//!
//! Every guard jumps to its own small stub, which records the deopt index and joins a shared
//! sequence that saves all general purpose registers and calls into the deopt runtime. The
//! runtime's return value becomes the function's return value.

use super::{
    moves::{sequentialise, Move, MoveSrc, CYCLE_SCRATCH},
    phyloc::{PhyLocation, ARGUMENT_REGS},
    regalloc::{Allocation, MEM_SCRATCH},
};
use crate::{
    compile::CompilationError,
    hir::GuardKind,
    lir::{
        opcode::FlagEffect, BlockId, Function, Instr, MemReg, MemoryIndirect, Opcode, Operand,
        OperandKind,
    },
    runtime::object,
};
use dynasmrt::{
    dynasm, x64::Assembler, AssemblyOffset, DynamicLabel, DynasmApi, DynasmLabelApi,
    ExecutableBuffer,
};
use std::{collections::BTreeMap, error::Error, ops::Range, slice};
use typed_index_collections::TiVec;

/// The machine code for one function.
pub struct Assembled {
    pub buf: ExecutableBuffer,
    /// Comment lines, keyed by the code offset they precede.
    pub comments: BTreeMap<usize, Vec<String>>,
    /// For each deopt point, the code ranges of its guard and of its stub.
    pub deopt_sites: Vec<(Range<usize>, usize)>,
}

impl Assembled {
    pub fn entry(&self) -> *const u8 {
        self.buf.ptr(AssemblyOffset(0))
    }

    pub fn code(&self) -> &[u8] {
        &self.buf
    }

    /// The deopt index whose guard or stub contains `off`.
    pub fn deopt_at_offset(&self, off: usize) -> Option<usize> {
        self.deopt_sites
            .iter()
            .find(|(r, _)| r.contains(&off))
            .map(|(_, i)| *i)
    }

    pub fn disassemble(&self, with_addrs: bool) -> Result<String, Box<dyn Error>> {
        AsmPrinter::new(&self.buf, &self.comments, with_addrs).to_string()
    }
}

/// A resolved operand.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Val {
    Gp(u8),
    Xmm(u8),
    /// `[rbp + off]`.
    Mem(i32),
    Imm(u64),
}

impl Val {
    fn of_loc(p: PhyLocation) -> Self {
        if p.is_gp_register() {
            Val::Gp(p.code())
        } else if p.is_fp_register() {
            Val::Xmm(p.code())
        } else {
            crate::jit_check!(p.is_memory(), "{p} is not a location");
            Val::Mem(p.loc())
        }
    }
}

/// Hands out the registers used to satisfy register-only operand positions.
struct Scratch {
    used: usize,
}

impl Scratch {
    const REGS: [PhyLocation; 2] = [MEM_SCRATCH, CYCLE_SCRATCH];

    fn new() -> Self {
        Scratch { used: 0 }
    }

    fn take(&mut self, instr: &Instr) -> u8 {
        crate::jit_check!(
            self.used < Self::REGS.len(),
            "{} {} needs more than two scratch registers",
            instr.id,
            instr.opcode
        );
        self.used += 1;
        Self::REGS[self.used - 1].code()
    }
}

fn fits_i32(v: u64) -> bool {
    i32::try_from(v as i64).is_ok()
}

pub fn assemble(
    func: &Function,
    alloc: &Allocation,
    deopt_entry: usize,
    runtime: usize,
) -> Result<Assembled, CompilationError> {
    let mut asm =
        Assembler::new().map_err(|e| CompilationError::ResourceExhausted(Box::new(e)))?;
    let labels = func.blocks.keys().map(|_| asm.new_dynamic_label()).collect();
    let epilogue = asm.new_dynamic_label();
    let mut a = Assemble {
        func,
        alloc,
        labels,
        epilogue,
        asm,
        comments: BTreeMap::new(),
        guards: Vec::new(),
        deopt_sites: Vec::new(),
        flags_valid: false,
    };
    a.emit_prologue();
    a.cg_blocks()?;
    a.emit_epilogue();
    a.emit_deopt_stubs(deopt_entry, runtime);

    a.asm
        .commit()
        .map_err(|e| CompilationError::InternalError(format!("When committing: {e}")))?;
    let Assemble {
        asm,
        comments,
        deopt_sites,
        ..
    } = a;
    let buf = asm
        .finalize()
        .map_err(|_| CompilationError::InternalError("Failed to finalize code".into()))?;
    Ok(Assembled {
        buf,
        comments,
        deopt_sites,
    })
}

struct Assemble<'a> {
    func: &'a Function,
    alloc: &'a Allocation,
    asm: Assembler,
    labels: TiVec<BlockId, DynamicLabel>,
    epilogue: DynamicLabel,
    /// Maps assembly offsets to comments.
    comments: BTreeMap<usize, Vec<String>>,
    /// Guards whose stubs are still to be emitted: (deopt index, stub label, guard code range).
    guards: Vec<(usize, DynamicLabel, Range<usize>)>,
    deopt_sites: Vec<(Range<usize>, usize)>,
    /// Do the CPU flags reflect the most recent flag-setting LIR instruction?
    flags_valid: bool,
}

impl Assemble<'_> {
    fn comment(&mut self, line: String) {
        self.comments
            .entry(self.asm.offset().0)
            .or_default()
            .push(line);
    }

    fn emit_prologue(&mut self) {
        self.comment(format!("prologue for {}", self.func.name));
        let size = self.alloc.frame_size();
        dynasm!(self.asm
            ; push rbp
            ; mov rbp, rsp
        );
        if size > 0 {
            dynasm!(self.asm; sub rsp, size);
        }
        for (i, r) in self.alloc.callee_saved.iter().enumerate() {
            let off = Allocation::callee_saved_slot(i).loc();
            dynasm!(self.asm; mov QWORD [rbp + off], Rq(r.code()));
        }
    }

    fn emit_epilogue(&mut self) {
        self.comment("epilogue".into());
        let epilogue = self.epilogue;
        dynasm!(self.asm; => epilogue);
        for (i, r) in self.alloc.callee_saved.iter().enumerate() {
            let off = Allocation::callee_saved_slot(i).loc();
            dynasm!(self.asm; mov Rq(r.code()), QWORD [rbp + off]);
        }
        dynasm!(self.asm
            ; mov rsp, rbp
            ; pop rbp
            ; ret
        );
    }

    fn cg_blocks(&mut self) -> Result<(), CompilationError> {
        let func = self.func;
        let mut origin = None;
        for b in func.blocks.keys() {
            let label = self.labels[b];
            self.comment(format!("BB {b}"));
            dynasm!(self.asm; => label);
            self.flags_valid = false;
            let instrs = &func.blocks[b].instrs;
            for (i, id) in instrs.iter().enumerate() {
                let instr = func.instr(*id);
                if instr.origin != origin && instr.origin.is_some() {
                    origin = instr.origin;
                    if let Some(o) = origin {
                        self.comment(format!("hir #{}", o.index()));
                    }
                }
                if i + 1 == instrs.len() {
                    self.emit_phi_moves(b)?;
                }
                let text = func.display(Some(&self.alloc.locs)).instr(instr);
                self.comment(text);
                self.cg_instr(b, instr)?;
                match instr.opcode.flag_effect() {
                    FlagEffect::Set => self.flags_valid = true,
                    FlagEffect::Invalidate => self.flags_valid = false,
                    FlagEffect::None => (),
                }
            }
        }
        Ok(())
    }

    fn loc(&self, o: &Operand) -> PhyLocation {
        match o.kind {
            OperandKind::Linked(d) => self.alloc.locs[d],
            OperandKind::Reg(p) | OperandKind::Stack(p) => p,
            _ => crate::jit_abort!("{o} has no location"),
        }
    }

    fn val(&self, o: &Operand) -> Val {
        match o.kind {
            OperandKind::Imm(v) => Val::Imm(v),
            _ => Val::of_loc(self.loc(o)),
        }
    }

    fn move_src(&self, o: &Operand) -> MoveSrc {
        match o.kind {
            OperandKind::Imm(v) => MoveSrc::Imm(v),
            _ => MoveSrc::Loc(self.loc(o)),
        }
    }

    /// Put `v` in a general purpose register, loading it into a scratch register if necessary.
    fn gp(&mut self, instr: &Instr, v: Val, scratch: &mut Scratch) -> u8 {
        match v {
            Val::Gp(r) => r,
            Val::Mem(off) => {
                let s = scratch.take(instr);
                dynasm!(self.asm; mov Rq(s), QWORD [rbp + off]);
                s
            }
            Val::Imm(i) => {
                let s = scratch.take(instr);
                dynasm!(self.asm; mov Rq(s), QWORD i as i64);
                s
            }
            Val::Xmm(x) => {
                let s = scratch.take(instr);
                dynasm!(self.asm; movq Rq(s), Rx(x));
                s
            }
        }
    }

    /// The base register and displacement of a memory operand.
    fn address(&mut self, instr: &Instr, m: MemoryIndirect, scratch: &mut Scratch) -> (u8, i32) {
        crate::jit_check!(m.index.is_none(), "indexed operands are not supported");
        let base = match m.base {
            MemReg::VReg(d) => Val::of_loc(self.alloc.locs[d]),
            MemReg::Phy(p) => Val::of_loc(p),
        };
        (self.gp(instr, base, scratch), m.offset)
    }

    fn emit_move(&mut self, dst: PhyLocation, src: MoveSrc) {
        let src = match src {
            MoveSrc::Loc(p) => Val::of_loc(p),
            MoveSrc::Imm(v) => Val::Imm(v),
        };
        let s = MEM_SCRATCH.code();
        match (Val::of_loc(dst), src) {
            (d, s2) if d == s2 => (),
            (Val::Gp(d), Val::Gp(r)) => dynasm!(self.asm; mov Rq(d), Rq(r)),
            (Val::Gp(d), Val::Mem(off)) => dynasm!(self.asm; mov Rq(d), QWORD [rbp + off]),
            (Val::Gp(d), Val::Imm(v)) => dynasm!(self.asm; mov Rq(d), QWORD v as i64),
            (Val::Gp(d), Val::Xmm(x)) => dynasm!(self.asm; movq Rq(d), Rx(x)),
            (Val::Mem(off), Val::Gp(r)) => dynasm!(self.asm; mov QWORD [rbp + off], Rq(r)),
            (Val::Mem(off), Val::Mem(off2)) => dynasm!(self.asm
                ; mov Rq(s), QWORD [rbp + off2]
                ; mov QWORD [rbp + off], Rq(s)
            ),
            (Val::Mem(off), Val::Imm(v)) if fits_i32(v) => {
                dynasm!(self.asm; mov QWORD [rbp + off], v as i64 as i32)
            }
            (Val::Mem(off), Val::Imm(v)) => dynasm!(self.asm
                ; mov Rq(s), QWORD v as i64
                ; mov QWORD [rbp + off], Rq(s)
            ),
            (Val::Mem(off), Val::Xmm(x)) => dynasm!(self.asm; movsd QWORD [rbp + off], Rx(x)),
            (Val::Xmm(d), Val::Xmm(x)) => dynasm!(self.asm; movsd Rx(d), Rx(x)),
            (Val::Xmm(d), Val::Mem(off)) => dynasm!(self.asm; movsd Rx(d), QWORD [rbp + off]),
            (Val::Xmm(d), Val::Gp(r)) => dynasm!(self.asm; movq Rx(d), Rq(r)),
            (Val::Xmm(d), Val::Imm(v)) => dynasm!(self.asm
                ; mov Rq(s), QWORD v as i64
                ; movq Rx(d), Rq(s)
            ),
            (Val::Imm(_), _) => crate::jit_abort!("cannot move into an immediate"),
        }
    }

    fn emit_moves(&mut self, moves: &[Move]) {
        for m in sequentialise(moves) {
            self.emit_move(m.dst, m.src);
        }
    }

    /// Write the values flowing into `b`'s successors' phis. Called just before `b`'s
    /// terminator.
    fn emit_phi_moves(&mut self, b: BlockId) -> Result<(), CompilationError> {
        let succs = self.func.successors(b);
        let mut moves = Vec::new();
        for s in &succs {
            for phi in self
                .func
                .block_instrs(*s)
                .filter(|i| i.opcode == Opcode::Phi)
            {
                crate::jit_check!(
                    succs.len() == 1,
                    "critical edge from {b} to phi block {s}"
                );
                let Some(src) = phi.operand_by_predecessor(b) else {
                    return Err(CompilationError::InternalError(format!(
                        "phi {} has no input from {b}",
                        phi.id
                    )));
                };
                moves.push(Move::new(self.alloc.locs[phi.id], self.move_src(src)));
            }
        }
        if !moves.is_empty() {
            self.comment(format!("phi moves into {}", succs[0]));
            self.emit_moves(&moves);
        }
        Ok(())
    }

    fn out_loc(&self, instr: &Instr) -> PhyLocation {
        match instr.output {
            Some(_) => self.alloc.locs[instr.id],
            None => crate::jit_abort!("{} has no output", instr.id),
        }
    }

    fn jmp_unless_next(&mut self, b: BlockId, target: BlockId) {
        if target.index() != b.index() + 1 {
            let l = self.labels[target];
            dynasm!(self.asm; jmp => l);
        }
    }

    fn labels_of(&self, instr: &Instr) -> Vec<BlockId> {
        instr.successors()
    }

    fn cg_instr(&mut self, b: BlockId, instr: &Instr) -> Result<(), CompilationError> {
        let mut scratch = Scratch::new();
        match instr.opcode {
            Opcode::Nop | Opcode::Phi => (),
            Opcode::Bind => {
                let src = self.move_src(&instr.inputs[0]);
                self.emit_move(self.out_loc(instr), src);
            }
            Opcode::Move => self.cg_move(instr, &mut scratch)?,
            Opcode::Call | Opcode::VectorCall => self.cg_call(instr)?,
            Opcode::Guard => self.cg_guard(instr, &mut scratch)?,
            Opcode::Inc | Opcode::Dec => {
                let inc = instr.opcode == Opcode::Inc;
                match instr.inputs[0].kind {
                    OperandKind::Ind(m) => {
                        let (base, off) = self.address(instr, m, &mut scratch);
                        if inc {
                            dynasm!(self.asm; inc QWORD [Rq(base) + off]);
                        } else {
                            dynasm!(self.asm; dec QWORD [Rq(base) + off]);
                        }
                    }
                    _ => {
                        let (loc, v) = match instr.output {
                            Some(_) => {
                                let out = self.out_loc(instr);
                                self.emit_move(out, self.move_src(&instr.inputs[0]));
                                (out, Val::of_loc(out))
                            }
                            None => (self.loc(&instr.inputs[0]), self.val(&instr.inputs[0])),
                        };
                        match (v, inc) {
                            (Val::Gp(r), true) => dynasm!(self.asm; inc Rq(r)),
                            (Val::Gp(r), false) => dynasm!(self.asm; dec Rq(r)),
                            (Val::Mem(off), true) => dynasm!(self.asm; inc QWORD [rbp + off]),
                            (Val::Mem(off), false) => dynasm!(self.asm; dec QWORD [rbp + off]),
                            _ => return Err(unsupported(instr, &format!("operand at {loc}"))),
                        }
                    }
                }
            }
            Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor => {
                let lhs = self.val(&instr.inputs[0]);
                let rhs = self.val(&instr.inputs[1]);
                let acc = scratch.take(instr);
                self.emit_move(PhyLocation::new(i32::from(acc)), val_src(lhs));
                let r = self.gp(instr, rhs, &mut scratch);
                match instr.opcode {
                    Opcode::Add => dynasm!(self.asm; add Rq(acc), Rq(r)),
                    Opcode::Sub => dynasm!(self.asm; sub Rq(acc), Rq(r)),
                    Opcode::And => dynasm!(self.asm; and Rq(acc), Rq(r)),
                    Opcode::Or => dynasm!(self.asm; or Rq(acc), Rq(r)),
                    _ => dynasm!(self.asm; xor Rq(acc), Rq(r)),
                }
                self.emit_move(
                    self.out_loc(instr),
                    MoveSrc::Loc(PhyLocation::new(i32::from(acc))),
                );
            }
            Opcode::Negate | Opcode::Invert => {
                let v = self.val(&instr.inputs[0]);
                let acc = scratch.take(instr);
                self.emit_move(PhyLocation::new(i32::from(acc)), val_src(v));
                if instr.opcode == Opcode::Negate {
                    dynasm!(self.asm; neg Rq(acc));
                } else {
                    dynasm!(self.asm; not Rq(acc));
                }
                self.emit_move(
                    self.out_loc(instr),
                    MoveSrc::Loc(PhyLocation::new(i32::from(acc))),
                );
            }
            Opcode::Test => {
                let a = self.val(&instr.inputs[0]);
                let bv = self.val(&instr.inputs[1]);
                let ra = self.gp(instr, a, &mut scratch);
                match bv {
                    _ if bv == a => dynasm!(self.asm; test Rq(ra), Rq(ra)),
                    Val::Imm(i) if fits_i32(i) => {
                        dynasm!(self.asm; test Rq(ra), i as i64 as i32)
                    }
                    _ => {
                        let rb = self.gp(instr, bv, &mut scratch);
                        dynasm!(self.asm; test Rq(ra), Rq(rb));
                    }
                }
            }
            Opcode::Cmp => self.cg_cmp(instr, &mut scratch),
            op if op.is_compare() => {
                self.cg_cmp(instr, &mut scratch);
                let s = MEM_SCRATCH.code();
                match op {
                    Opcode::Equal => dynasm!(self.asm; sete Rb(s)),
                    Opcode::NotEqual => dynasm!(self.asm; setne Rb(s)),
                    Opcode::GreaterThanSigned => dynasm!(self.asm; setg Rb(s)),
                    Opcode::LessThanSigned => dynasm!(self.asm; setl Rb(s)),
                    Opcode::GreaterThanEqualSigned => dynasm!(self.asm; setge Rb(s)),
                    Opcode::LessThanEqualSigned => dynasm!(self.asm; setle Rb(s)),
                    Opcode::GreaterThanUnsigned => dynasm!(self.asm; seta Rb(s)),
                    Opcode::LessThanUnsigned => dynasm!(self.asm; setb Rb(s)),
                    Opcode::GreaterThanEqualUnsigned => dynasm!(self.asm; setae Rb(s)),
                    _ => dynasm!(self.asm; setbe Rb(s)),
                }
                dynasm!(self.asm; movzx Rq(s), Rb(s));
                self.emit_move(self.out_loc(instr), MoveSrc::Loc(MEM_SCRATCH));
            }
            op if op.is_branch_cc() => {
                crate::jit_check!(
                    self.flags_valid,
                    "{} {op} does not follow a flag-setting instruction",
                    instr.id
                );
                let [t, f] = self.labels_of(instr)[..] else {
                    return Err(unsupported(instr, "branch without two targets"));
                };
                let l = self.labels[t];
                match op {
                    Opcode::BranchNZ => dynasm!(self.asm; jnz => l),
                    Opcode::BranchZ => dynasm!(self.asm; jz => l),
                    Opcode::BranchA => dynasm!(self.asm; ja => l),
                    Opcode::BranchB => dynasm!(self.asm; jb => l),
                    Opcode::BranchAE => dynasm!(self.asm; jae => l),
                    Opcode::BranchBE => dynasm!(self.asm; jbe => l),
                    Opcode::BranchG => dynasm!(self.asm; jg => l),
                    Opcode::BranchL => dynasm!(self.asm; jl => l),
                    Opcode::BranchGE => dynasm!(self.asm; jge => l),
                    _ => dynasm!(self.asm; jle => l),
                }
                self.jmp_unless_next(b, f);
            }
            Opcode::CondBranch => {
                let [t, f] = self.labels_of(instr)[..] else {
                    return Err(unsupported(instr, "branch without two targets"));
                };
                match self.val(&instr.inputs[0]) {
                    Val::Gp(r) => dynasm!(self.asm; test Rq(r), Rq(r)),
                    Val::Mem(off) => dynasm!(self.asm; cmp QWORD [rbp + off], 0),
                    v => {
                        let r = self.gp(instr, v, &mut scratch);
                        dynasm!(self.asm; test Rq(r), Rq(r));
                    }
                }
                let l = self.labels[t];
                dynasm!(self.asm; jnz => l);
                self.jmp_unless_next(b, f);
            }
            Opcode::Branch => {
                let [t] = self.labels_of(instr)[..] else {
                    return Err(unsupported(instr, "branch without a target"));
                };
                self.jmp_unless_next(b, t);
            }
            Opcode::Return => {
                if let Some(v) = instr.inputs.first() {
                    let src = self.move_src(v);
                    self.emit_move(PhyLocation::RAX, src);
                }
                let e = self.epilogue;
                dynasm!(self.asm; jmp => e);
            }
            _ => return Err(unsupported(instr, "no code generator")),
        }
        Ok(())
    }

    fn cg_move(&mut self, instr: &Instr, scratch: &mut Scratch) -> Result<(), CompilationError> {
        let out = self.out_loc(instr);
        match instr.inputs[0].kind {
            OperandKind::Ind(m) => {
                let (base, off) = self.address(instr, m, scratch);
                match Val::of_loc(out) {
                    Val::Gp(d) => dynasm!(self.asm; mov Rq(d), QWORD [Rq(base) + off]),
                    _ => {
                        let s = MEM_SCRATCH.code();
                        dynasm!(self.asm; mov Rq(s), QWORD [Rq(base) + off]);
                        self.emit_move(out, MoveSrc::Loc(MEM_SCRATCH));
                    }
                }
            }
            OperandKind::Addr(a) => {
                let s = scratch.take(instr);
                dynasm!(self.asm
                    ; mov Rq(s), QWORD a as i64
                    ; mov Rq(s), QWORD [Rq(s)]
                );
                self.emit_move(out, MoveSrc::Loc(PhyLocation::new(i32::from(s))));
            }
            OperandKind::Label(_) | OperandKind::VReg => {
                return Err(unsupported(instr, "move source"))
            }
            _ => {
                let src = self.move_src(&instr.inputs[0]);
                self.emit_move(out, src);
            }
        }
        Ok(())
    }

    fn cg_cmp(&mut self, instr: &Instr, scratch: &mut Scratch) {
        let a = self.val(&instr.inputs[0]);
        let bv = self.val(&instr.inputs[1]);
        let ra = self.gp(instr, a, scratch);
        match bv {
            Val::Imm(i) if fits_i32(i) => dynasm!(self.asm; cmp Rq(ra), i as i64 as i32),
            Val::Mem(off) => dynasm!(self.asm; cmp Rq(ra), QWORD [rbp + off]),
            _ => {
                let rb = self.gp(instr, bv, scratch);
                dynasm!(self.asm; cmp Rq(ra), Rq(rb));
            }
        }
    }

    fn cg_call(&mut self, instr: &Instr) -> Result<(), CompilationError> {
        let Some((target, args)) = instr.inputs.split_first() else {
            return Err(unsupported(instr, "call without a target"));
        };
        if args.len() > ARGUMENT_REGS.len() {
            return Err(CompilationError::LimitExceeded(format!(
                "{} passes {} arguments",
                instr.id,
                args.len()
            )));
        }
        let mut moves = args
            .iter()
            .zip(ARGUMENT_REGS)
            .map(|(a, r)| Move::new(r, self.move_src(a)))
            .collect::<Vec<_>>();
        if !target.is_imm() {
            moves.push(Move::new(PhyLocation::RAX, self.move_src(target)));
        }
        self.emit_moves(&moves);
        match target.kind {
            OperandKind::Imm(addr) => dynasm!(self.asm
                ; mov rax, QWORD addr as i64
                ; call rax
            ),
            _ => dynasm!(self.asm; call rax),
        }
        if instr.output.is_some() {
            self.emit_move(self.out_loc(instr), MoveSrc::Loc(PhyLocation::RAX));
        }
        Ok(())
    }

    fn cg_guard(&mut self, instr: &Instr, scratch: &mut Scratch) -> Result<(), CompilationError> {
        let (OperandKind::Imm(kind), OperandKind::Imm(idx)) =
            (instr.inputs[0].kind, instr.inputs[1].kind)
        else {
            return Err(unsupported(instr, "guard without kind and deopt index"));
        };
        // Cannot truncate: both were created from small integers.
        let Some(kind) = GuardKind::from_repr(kind as u8) else {
            return Err(unsupported(instr, "guard kind"));
        };
        let idx = idx as usize;
        let stub = self.asm.new_dynamic_label();
        self.comment(format!("guard {kind} -> deopt {idx}"));
        let start = self.asm.offset().0;
        let v = self.val(&instr.inputs[2]);
        match kind {
            GuardKind::AlwaysFail => dynasm!(self.asm; jmp => stub),
            GuardKind::NotNull | GuardKind::NotNegative => {
                match v {
                    Val::Mem(off) => dynasm!(self.asm; cmp QWORD [rbp + off], 0),
                    _ => {
                        let r = self.gp(instr, v, scratch);
                        dynasm!(self.asm; test Rq(r), Rq(r));
                    }
                }
                if kind == GuardKind::NotNull {
                    dynasm!(self.asm; jz => stub);
                } else {
                    dynasm!(self.asm; jl => stub);
                }
            }
            GuardKind::NotNone | GuardKind::Is => {
                let expected = if kind == GuardKind::Is {
                    let Some(t) = instr.inputs.get(3) else {
                        return Err(unsupported(instr, "identity guard without a target"));
                    };
                    self.val(t)
                } else {
                    Val::Imm(object::none().as_ptr() as u64)
                };
                let r = self.gp(instr, v, scratch);
                let e = self.gp(instr, expected, scratch);
                dynasm!(self.asm; cmp Rq(r), Rq(e));
                if kind == GuardKind::Is {
                    dynasm!(self.asm; jne => stub);
                } else {
                    dynasm!(self.asm; je => stub);
                }
            }
        }
        let end = self.asm.offset().0;
        self.guards.push((idx, stub, start..end));
        Ok(())
    }

    fn emit_deopt_stubs(&mut self, deopt_entry: usize, runtime: usize) {
        if self.guards.is_empty() {
            return;
        }
        let shared = self.asm.new_dynamic_label();
        for (idx, stub, guard_range) in std::mem::take(&mut self.guards) {
            self.comment(format!("deopt stub {idx}"));
            let start = self.asm.offset().0;
            // Cannot truncate: there are far fewer deopt points than `i32::MAX`.
            let id = idx as i32;
            dynasm!(self.asm
                ; => stub
                ; push rsi
                ; mov esi, id
                ; jmp => shared
            );
            let end = self.asm.offset().0;
            self.deopt_sites.push((guard_range, idx));
            self.deopt_sites.push((start..end, idx));
        }

        self.comment("save registers and deoptimise".into());
        dynasm!(self.asm; => shared);
        // Push R15 first so that the register array is indexed by register number.
        for (i, reg) in (0..16u8).rev().enumerate() {
            if reg == PhyLocation::RSI.code() {
                // RSI holds the deopt index: its original value was pushed by the stub.
                let off = (i * 8) as i32;
                dynasm!(self.asm; push QWORD [rsp + off]);
            } else {
                dynasm!(self.asm; push Rq(reg));
            }
        }
        dynasm!(self.asm
            ; mov rdi, rsp
            // 17 pushes leave rsp 8 bytes off 16 byte alignment.
            ; sub rsp, 8
            ; mov rdx, QWORD runtime as i64
            ; mov rax, QWORD deopt_entry as i64
            ; call rax
        );
        let e = self.epilogue;
        dynasm!(self.asm; jmp => e);
    }
}

fn val_src(v: Val) -> MoveSrc {
    match v {
        Val::Gp(r) => MoveSrc::Loc(PhyLocation::new(i32::from(r))),
        Val::Xmm(x) => MoveSrc::Loc(PhyLocation::new(i32::from(x) + PhyLocation::XMM0.loc())),
        Val::Mem(off) => MoveSrc::Loc(PhyLocation::new(off)),
        Val::Imm(v) => MoveSrc::Imm(v),
    }
}

fn unsupported(instr: &Instr, what: &str) -> CompilationError {
    CompilationError::General(format!("cannot generate {}: {what}", instr.opcode))
}

/// Disassembles emitted code for testing and debugging purposes.
struct AsmPrinter<'a> {
    buf: &'a ExecutableBuffer,
    comments: &'a BTreeMap<usize, Vec<String>>,
    /// When true, instruction offset and address are included in the output.
    with_addrs: bool,
}

impl<'a> AsmPrinter<'a> {
    fn new(
        buf: &'a ExecutableBuffer,
        comments: &'a BTreeMap<usize, Vec<String>>,
        with_addrs: bool,
    ) -> Self {
        Self {
            buf,
            comments,
            with_addrs,
        }
    }

    fn to_string(&self) -> Result<String, Box<dyn Error>> {
        let mut out = Vec::new();
        let len = self.buf.len();
        let bptr = self.buf.ptr(AssemblyOffset(0));
        let start_ip = bptr as u64;
        // SAFETY: the buffer is `len` bytes long and lives as long as `self`.
        let code = unsafe { slice::from_raw_parts(bptr, len) };
        let fmt = zydis::Formatter::intel();
        let dec = zydis::Decoder::new64();
        for insn_info in dec.decode_all::<zydis::VisibleOperands>(code, start_ip) {
            let (ip, _raw_bytes, insn) = insn_info.map_err(|e| format!("{e:?}"))?;
            let off = usize::try_from(ip - start_ip)?;
            if let Some(lines) = self.comments.get(&off) {
                for line in lines {
                    out.push(format!("; {line}"));
                }
            }
            let istr = fmt.format(Some(ip), &insn).map_err(|e| format!("{e:?}"))?;
            if self.with_addrs {
                out.push(format!("{ip:016x} {off:08x}: {istr}"));
            } else {
                out.push(istr.to_string());
            }
        }
        Ok(out.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codegen::regalloc::allocate,
        lir::{DataType, InstrId},
    };
    use fm::{FMBuilder, FMatcher};
    use regex::Regex;
    use std::sync::LazyLock;

    static PTN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{.+?\}\}").unwrap());
    static TEXT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zA-Z0-9\._]+").unwrap());

    fn fmatcher(ptn: &str) -> FMatcher<'_> {
        FMBuilder::new(ptn)
            .unwrap()
            .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
            .build()
            .unwrap()
    }

    fn match_asm(a: &Assembled, ptn: &str) {
        let dis = a.disassemble(false).unwrap();
        match fmatcher(&ptn.to_lowercase()).matches(&dis.to_lowercase()) {
            Ok(()) => (),
            Err(e) => panic!("{e}"),
        }
    }

    fn codegen(f: &mut Function) -> Assembled {
        let alloc = allocate(f);
        assemble(f, &alloc, 0x1234_5678, 0x8765_4321).unwrap()
    }

    const B64: DataType = DataType::Bits64;

    #[test]
    fn identity() {
        let mut f = Function::new("t");
        let b = f.new_block();
        let args = f.push(
            b,
            Opcode::Bind,
            Some(DataType::Object),
            vec![Operand::reg(PhyLocation::RDI, DataType::Object)],
        );
        let x = f.push(
            b,
            Opcode::Move,
            Some(DataType::Object),
            vec![Operand::ind(MemReg::VReg(args), 0, DataType::Object)],
        );
        f.push(b, Opcode::Inc, None, vec![Operand::ind(MemReg::VReg(x), 0, B64)]);
        f.push(b, Opcode::Return, None, vec![Operand::linked(x, DataType::Object)]);
        let a = codegen(&mut f);
        match_asm(
            &a,
            "
            ; prologue for t
            push rbp
            mov rbp, rsp
            ; BB %0
            ; RAX:Object = Bind RDI
            mov rax, rdi
            ; RAX:Object = Move [RAX]
            mov rax, [rax]
            ; Inc [RAX]
            inc qword ptr [rax]
            ; Return RAX
            jmp {{epilogue}}
            ; epilogue
            mov rsp, rbp
            pop rbp
            ret",
        );
        assert!(a.deopt_sites.is_empty());
    }

    #[test]
    fn call_saves_live_values_and_aligns_frame() {
        let mut f = Function::new("t");
        let b = f.new_block();
        let x = f.push(b, Opcode::Move, Some(B64), vec![Operand::imm(1, B64)]);
        let c = f.push(
            b,
            Opcode::Call,
            Some(B64),
            vec![Operand::imm(0x1000_0000, B64), Operand::imm(2, B64)],
        );
        let s = f.push(
            b,
            Opcode::Add,
            Some(B64),
            vec![Operand::linked(x, B64), Operand::linked(c, B64)],
        );
        f.push(b, Opcode::Return, None, vec![Operand::linked(s, B64)]);
        let a = codegen(&mut f);
        match_asm(
            &a,
            "
            ; prologue for t
            push rbp
            mov rbp, rsp
            sub rsp, 0x10
            mov [rbp-0x08], rbx
            ...
            mov rbx, 0x01
            ; RAX:64 = Call 0x10000000, 2
            mov rdi, 0x02
            mov rax, 0x10000000
            call rax
            ; RAX:64 = Add RBX, RAX
            mov r11, rbx
            add r11, rax
            mov rax, r11
            ...
            ; epilogue
            mov rbx, [rbp-0x08]
            mov rsp, rbp
            pop rbp
            ret",
        );
    }

    #[test]
    fn phis_and_guards() {
        let mut f = Function::new("t");
        let b0 = f.new_block();
        let b1 = f.new_block();
        let b2 = f.new_block();
        let b3 = f.new_block();
        let x = f.push(b0, Opcode::Move, Some(B64), vec![Operand::imm(5, B64)]);
        f.deopts.push(Default::default());
        f.push(
            b0,
            Opcode::Guard,
            None,
            vec![
                Operand::imm(GuardKind::NotNegative as u64, B64),
                Operand::imm(0, B64),
                Operand::linked(x, B64),
            ],
        );
        f.push(
            b0,
            Opcode::CondBranch,
            None,
            vec![Operand::linked(x, B64), Operand::label(b1), Operand::label(b2)],
        );
        f.push(b1, Opcode::Branch, None, vec![Operand::label(b3)]);
        f.push(b2, Opcode::Branch, None, vec![Operand::label(b3)]);
        let p = f.push(b3, Opcode::Phi, Some(B64), Vec::new());
        f.add_input(p, Operand::label(b1));
        f.add_input(p, Operand::linked(x, B64));
        f.add_input(p, Operand::label(b2));
        f.add_input(p, Operand::imm(9, B64));
        f.push(b3, Opcode::Return, None, vec![Operand::linked(p, B64)]);
        let a = codegen(&mut f);
        match_asm(
            &a,
            "
            ...
            ; guard NotNegative -> deopt 0
            test rax, rax
            jl {{stub}}
            ; CondBranch RAX, BB%1, BB%2
            test rax, rax
            jnz {{bb1}}
            jmp {{bb2}}
            ; BB %1
            ; phi moves into %3
            mov rcx, rax
            ; Branch BB%3
            jmp {{bb3}}
            ; BB %2
            ; phi moves into %3
            mov rcx, 0x09
            ; Branch BB%3
            ; BB %3
            ; RCX:64 = Phi BB%1, RAX, BB%2, 9
            ; Return RCX
            mov rax, rcx
            jmp {{epilogue}}
            ; epilogue
            mov rsp, rbp
            pop rbp
            ret
            ; deopt stub 0
            push rsi
            mov esi, 0x00
            jmp {{shared}}
            ; save registers and deoptimise
            push r15
            ...
            push qword ptr [rsp+0x48]
            ...
            push rax
            mov rdi, rsp
            sub rsp, 0x08
            mov rdx, 0x87654321
            mov rax, 0x12345678
            call rax
            jmp {{epilogue}}",
        );
        assert_eq!(a.deopt_sites.len(), 2);
        let (guard, _) = &a.deopt_sites[0];
        assert_eq!(a.deopt_at_offset(guard.start), Some(0));
        assert_eq!(a.deopt_at_offset(a.deopt_sites[1].0.start), Some(0));
        assert_eq!(a.deopt_at_offset(0), None);
    }

    #[test]
    fn branch_cc_needs_flags() {
        let mut f = Function::new("t");
        let b0 = f.new_block();
        let b1 = f.new_block();
        let x = f.push(b0, Opcode::Move, Some(B64), vec![Operand::imm(1, B64)]);
        f.push(b0, Opcode::Test, None, vec![Operand::linked(x, B64); 2]);
        f.push(b0, Opcode::BranchZ, None, vec![Operand::label(b1), Operand::label(b1)]);
        f.push(b1, Opcode::Return, None, vec![Operand::imm(0, B64)]);
        let a = codegen(&mut f);
        match_asm(
            &a,
            "
            ...
            ; Test RAX, RAX
            test rax, rax
            ; BranchZ BB%1, BB%1
            jz {{bb1}}
            ; BB %1
            ...",
        );
    }

    #[test]
    #[should_panic(expected = "does not follow a flag-setting instruction")]
    fn branch_cc_without_flags() {
        let mut f = Function::new("t");
        let b0 = f.new_block();
        let b1 = f.new_block();
        f.push(b0, Opcode::BranchNZ, None, vec![Operand::label(b1), Operand::label(b1)]);
        f.push(b1, Opcode::Return, None, vec![Operand::imm(0, B64)]);
        codegen(&mut f);
    }

    #[test]
    fn unsupported_opcodes_are_errors() {
        let mut f = Function::new("t");
        let b = f.new_block();
        let x = f.push(b, Opcode::Move, Some(DataType::Double), vec![Operand::double(1.0)]);
        let y = f.push(
            b,
            Opcode::Fadd,
            Some(DataType::Double),
            vec![Operand::linked(x, DataType::Double); 2],
        );
        f.push(b, Opcode::Return, None, vec![Operand::linked(y, DataType::Double)]);
        let alloc = allocate(&mut f);
        assert!(alloc.locs[InstrId::new(0)].is_fp_register());
        assert!(matches!(
            assemble(&f, &alloc, 0, 0),
            Err(CompilationError::General(_))
        ));
    }
}
