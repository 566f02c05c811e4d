//! A linear scan register allocator over whole-lifetime intervals.
//!
//! Every virtual register is given exactly one location (a register or a stack slot) for its
//! entire lifetime, so no moves are needed except at phis and calls. Instructions are numbered in
//! block order: instruction `k` reads its inputs at position `2k` and writes its output at
//! `2k + 1`. A virtual register's interval runs from the first to the last position at which it
//! is live.
//!
//! Registers are handed out in a fixed order, spilling the interval which ends furthest away when
//! none are free. Intervals which are live across a call may only be given callee-saved
//! registers. `R10`, `R11`, `XMM14` and `XMM15` are never allocated: code generation uses them as
//! scratch registers.

use super::{
    moves::CYCLE_SCRATCH,
    phyloc::{PhyLocation, PhyRegisterSet, CALLEE_SAVE_REGS},
};
use crate::lir::{BlockId, DataType, Function, InstrId, Opcode, OperandKind};
use std::fmt;
use typed_index_collections::TiVec;
use vob::Vob;

/// The scratch register codegen uses for memory-to-memory moves and for operands which must be
/// in a register but were spilled.
pub const MEM_SCRATCH: PhyLocation = PhyLocation::R11;

/// The order in which general purpose registers are handed out. Caller-saved registers come
/// first so that callee-saved registers, which cost a save and restore, are only used when
/// needed.
const GP_ORDER: [PhyLocation; 12] = [
    PhyLocation::RAX,
    PhyLocation::RCX,
    PhyLocation::RDX,
    PhyLocation::RSI,
    PhyLocation::RDI,
    PhyLocation::R8,
    PhyLocation::R9,
    PhyLocation::RBX,
    PhyLocation::R12,
    PhyLocation::R13,
    PhyLocation::R14,
    PhyLocation::R15,
];

const FP_ORDER: [PhyLocation; 14] = [
    PhyLocation::XMM0,
    PhyLocation::XMM1,
    PhyLocation::XMM2,
    PhyLocation::XMM3,
    PhyLocation::XMM4,
    PhyLocation::XMM5,
    PhyLocation::XMM6,
    PhyLocation::XMM7,
    PhyLocation::XMM8,
    PhyLocation::XMM9,
    PhyLocation::XMM10,
    PhyLocation::XMM11,
    PhyLocation::XMM12,
    PhyLocation::XMM13,
];

/// The result of register allocation.
#[derive(Debug)]
pub struct Allocation {
    /// The location of each virtual register. Instructions without outputs map to
    /// [PhyLocation::REG_INVALID].
    pub locs: TiVec<InstrId, PhyLocation>,
    /// The callee-saved registers the function uses, in increasing order. These are saved
    /// immediately below the frame pointer.
    pub callee_saved: Vec<PhyLocation>,
    /// How many 8-byte spill slots are needed below the callee-saved area.
    pub num_spill_slots: usize,
    /// How many intervals were spilled.
    pub num_spilled: usize,
}

impl Allocation {
    /// The number of bytes the prologue must reserve below `RBP`, keeping `RSP` 16 byte aligned
    /// at calls.
    pub fn frame_size(&self) -> i32 {
        let n = self.callee_saved.len() + self.num_spill_slots;
        // Cannot overflow: both counts are bounded by the number of instructions.
        let bytes = (8 * n) as i32;
        (bytes + 15) & !15
    }

    /// The save slot of the `i`th callee-saved register.
    pub fn callee_saved_slot(i: usize) -> PhyLocation {
        PhyLocation::stack_slot(8 * (i as i32 + 1))
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let saved = self
            .callee_saved
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>();
        write!(
            f,
            "callee-saved: [{}] spill slots: {} frame: {}",
            saved.join(", "),
            self.num_spill_slots,
            self.frame_size()
        )
    }
}

#[derive(Clone, Copy, Debug)]
struct Interval {
    vreg: InstrId,
    start: usize,
    end: usize,
    crosses_call: bool,
    fp: bool,
}

impl Interval {
    fn allowed(&self) -> Vec<PhyLocation> {
        let order: &[PhyLocation] = if self.fp { &FP_ORDER } else { &GP_ORDER };
        order
            .iter()
            .copied()
            .filter(|r| !self.crosses_call || CALLEE_SAVE_REGS.has(*r))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Loc {
    Reg(PhyLocation),
    Slot(usize),
}

/// The position of each instruction in linear block order.
fn number(func: &Function) -> TiVec<InstrId, usize> {
    let mut pos: TiVec<InstrId, usize> = func.instrs.iter().map(|_| usize::MAX).collect();
    let mut k = 0;
    for b in func.blocks.keys() {
        for i in &func.blocks[b].instrs {
            pos[*i] = k;
            k += 1;
        }
    }
    pos
}

/// Backwards dataflow liveness over virtual registers. A phi's inputs are live out of the
/// corresponding predecessor rather than into the phi's block.
fn liveness(func: &Function) -> (TiVec<BlockId, Vob>, TiVec<BlockId, Vob>) {
    let n = func.instrs.len();
    let empty = || -> TiVec<BlockId, Vob> {
        func.blocks.iter().map(|_| Vob::from_elem(false, n)).collect()
    };
    let mut live_in = empty();
    let mut live_out = empty();
    // Values flowing into phis along each edge out of a block.
    let mut phi_uses = empty();
    for b in func.blocks.keys() {
        for instr in func.block_instrs(b).filter(|i| i.opcode == Opcode::Phi) {
            for c in instr.inputs.chunks(2) {
                if let (OperandKind::Label(p), Some(d)) = (c[0].kind, c[1].def()) {
                    phi_uses[p].set(d.index(), true);
                }
            }
        }
    }

    loop {
        let mut changed = false;
        for b in func.blocks.keys().rev() {
            let mut out = phi_uses[b].clone();
            for s in func.successors(b) {
                out.or(&live_in[s]);
            }
            let mut live = out.clone();
            for instr in func.block_instrs(b).collect::<Vec<_>>().into_iter().rev() {
                if instr.defines_vreg() {
                    live.set(instr.id.index(), false);
                }
                if instr.opcode != Opcode::Phi {
                    for d in instr.inputs.iter().flat_map(|o| o.vregs()) {
                        live.set(d.index(), true);
                    }
                }
            }
            live_out[b] = out;
            if live != live_in[b] {
                live_in[b] = live;
                changed = true;
            }
        }
        if !changed {
            return (live_in, live_out);
        }
    }
}

fn build_intervals(func: &Function, pos: &TiVec<InstrId, usize>) -> Vec<Interval> {
    let (live_in, live_out) = liveness(func);
    let n = func.instrs.len();
    let mut start = vec![usize::MAX; n];
    let mut end = vec![0usize; n];
    let mut extend = |v: usize, p: usize| {
        start[v] = start[v].min(p);
        end[v] = end[v].max(p);
    };

    let mut calls = Vec::new();
    for b in func.blocks.keys() {
        let instrs = &func.blocks[b].instrs;
        let (Some(first), Some(last)) = (instrs.first(), instrs.last()) else {
            crate::jit_abort!("block {b} is empty")
        };
        let (first, last) = (pos[*first], pos[*last]);
        for v in live_in[b].iter_set_bits(..) {
            extend(v, 2 * first);
        }
        for v in live_out[b].iter_set_bits(..) {
            extend(v, 2 * last + 1);
        }
        for instr in func.block_instrs(b) {
            let k = pos[instr.id];
            if instr.opcode.is_call() {
                calls.push(k);
            }
            if instr.opcode == Opcode::Phi {
                extend(instr.id.index(), 2 * first + 1);
                for c in instr.inputs.chunks(2) {
                    if let OperandKind::Label(p) = c[0].kind {
                        // The phi is written, and its input read, just before the predecessor's
                        // terminator.
                        let Some(t) = func.blocks[p].instrs.last() else {
                            crate::jit_abort!("block {p} is empty")
                        };
                        extend(instr.id.index(), 2 * pos[*t]);
                        for d in c[1].vregs() {
                            extend(d.index(), 2 * pos[*t]);
                        }
                    }
                }
                continue;
            }
            if instr.defines_vreg() {
                extend(instr.id.index(), 2 * k + 1);
            }
            for d in instr.inputs.iter().flat_map(|o| o.vregs()) {
                extend(d.index(), 2 * k);
            }
        }
    }

    let mut intervals = func
        .instrs
        .iter()
        .filter(|i| i.defines_vreg())
        .map(|i| {
            let v = i.id.index();
            let (s, e) = (start[v], end[v]);
            Interval {
                vreg: i.id,
                start: s,
                end: e,
                crosses_call: calls.iter().any(|k| s < 2 * k && e > 2 * k + 1),
                fp: func.output_type(i.id) == DataType::Double,
            }
        })
        .collect::<Vec<_>>();
    intervals.sort_by_key(|i| (i.start, i.vreg));
    intervals
}

/// Allocate a location for every virtual register in `func`, set the `last_use` flag on every
/// input that is the final read of its virtual register, and record the locations of live values
/// in `func`'s deopt metadata.
pub fn allocate(func: &mut Function) -> Allocation {
    let pos = number(func);
    let intervals = build_intervals(func, &pos);

    let mut assigned: TiVec<InstrId, Option<Loc>> = func.instrs.iter().map(|_| None).collect();
    let mut active: Vec<Interval> = Vec::new();
    // Freed slots, each with the end of the last interval that occupied it.
    let mut free_slots: Vec<(usize, usize)> = Vec::new();
    let mut num_slots = 0;
    let mut num_spilled = 0;
    let mut used = PhyRegisterSet::empty();
    // A slot for an interval starting at `from`. A spilled interval holds its slot for its whole
    // lifetime, so a freed slot may only be reused if its last occupant ended before `from`.
    let mut new_slot = |free_slots: &mut Vec<(usize, usize)>, from: usize| {
        let reusable = free_slots
            .iter()
            .enumerate()
            .filter(|(_, (_, end))| *end < from)
            .min_by_key(|(_, (s, _))| *s)
            .map(|(i, _)| i);
        match reusable {
            Some(i) => free_slots.swap_remove(i).0,
            None => {
                num_slots += 1;
                num_slots - 1
            }
        }
    };

    for cur in &intervals {
        // Expire intervals which ended before this one starts.
        active.retain(|a| {
            if a.end < cur.start {
                if let Some(Loc::Slot(s)) = assigned[a.vreg] {
                    free_slots.push((s, a.end));
                }
                false
            } else {
                true
            }
        });

        let taken = active
            .iter()
            .filter_map(|a| match assigned[a.vreg] {
                Some(Loc::Reg(r)) => Some(r),
                _ => None,
            })
            .collect::<Vec<_>>();
        let allowed = cur.allowed();
        match allowed.iter().find(|r| !taken.contains(r)) {
            Some(r) => assigned[cur.vreg] = Some(Loc::Reg(*r)),
            None => {
                // Spill whichever of `cur` and the conflicting intervals ends furthest away.
                let victim = active
                    .iter()
                    .filter(|a| {
                        matches!(assigned[a.vreg], Some(Loc::Reg(r)) if allowed.contains(&r))
                    })
                    .chain(std::iter::once(cur))
                    .max_by_key(|a| (a.end, a.vreg))
                    .copied()
                    .unwrap_or(*cur);
                num_spilled += 1;
                if victim.vreg != cur.vreg {
                    assigned[cur.vreg] = assigned[victim.vreg];
                }
                assigned[victim.vreg] =
                    Some(Loc::Slot(new_slot(&mut free_slots, victim.start)));
            }
        }
        if let Some(Loc::Reg(r)) = assigned[cur.vreg] {
            used.set(r);
        }
        active.push(*cur);
    }

    let callee_saved = (used & CALLEE_SAVE_REGS).iter().collect::<Vec<_>>();
    let ncallee = callee_saved.len();
    let locs: TiVec<InstrId, PhyLocation> = assigned
        .iter()
        .map(|l| match l {
            Some(Loc::Reg(r)) => *r,
            Some(Loc::Slot(s)) => PhyLocation::stack_slot(8 * ((ncallee + s) as i32 + 1)),
            None => PhyLocation::REG_INVALID,
        })
        .collect();
    crate::jit_dcheck!(
        !locs.iter().any(|l| *l == CYCLE_SCRATCH || *l == MEM_SCRATCH),
        "a scratch register was allocated"
    );

    set_last_uses(func, &pos, &intervals);
    bind_deopt_locations(func, &locs);

    Allocation {
        locs,
        callee_saved,
        num_spill_slots: num_slots,
        num_spilled,
    }
}

fn set_last_uses(func: &mut Function, pos: &TiVec<InstrId, usize>, intervals: &[Interval]) {
    let mut end: TiVec<InstrId, usize> = func.instrs.iter().map(|_| usize::MAX).collect();
    for i in intervals {
        end[i.vreg] = i.end;
    }
    let terminators: TiVec<BlockId, usize> = func
        .blocks
        .iter()
        .map(|b| b.instrs.last().map_or(usize::MAX, |t| pos[*t]))
        .collect();
    for instr in func.instrs.iter_mut() {
        let k = pos[instr.id];
        let is_phi = instr.opcode == Opcode::Phi;
        let mut pred = None;
        for o in instr.inputs.iter_mut() {
            if let OperandKind::Label(p) = o.kind {
                pred = Some(p);
                continue;
            }
            let at = match (is_phi, pred) {
                (true, Some(p)) => terminators[p],
                _ => k,
            };
            o.last_use = o.vregs().iter().any(|d| end[*d] == 2 * at);
        }
    }
}

fn bind_deopt_locations(func: &mut Function, locs: &TiVec<InstrId, PhyLocation>) {
    for instr in func.instrs.iter().filter(|i| i.opcode == Opcode::Guard) {
        let OperandKind::Imm(idx) = instr.inputs[1].kind else {
            crate::jit_abort!("guard {} has no deopt index", instr.id)
        };
        // Cannot truncate: deopt indices come from a `Vec` length.
        let meta = &mut func.deopts[idx as usize];
        let n = meta.live_values.len();
        crate::jit_check!(
            instr.inputs.len() >= 3 + n,
            "guard {} has too few live values",
            instr.id
        );
        let live = &instr.inputs[instr.inputs.len() - n..];
        for (lv, o) in meta.live_values.iter_mut().zip(live) {
            let Some(d) = o.def() else {
                crate::jit_abort!("live value {o} of guard {} is not a vreg", instr.id)
            };
            lv.location = locs[d];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{lower::lower, Operand};

    const B64: DataType = DataType::Bits64;

    fn imm(v: u64) -> Operand {
        Operand::imm(v, B64)
    }

    /// Check that no two virtual registers which are live at the same time share a location.
    fn check_allocation(f: &Function, a: &Allocation) {
        let intervals = build_intervals(f, &number(f));
        for (i, x) in intervals.iter().enumerate() {
            assert_ne!(a.locs[x.vreg], PhyLocation::REG_INVALID, "{}", x.vreg);
            for y in &intervals[i + 1..] {
                if x.start <= y.end && y.start <= x.end {
                    assert_ne!(
                        a.locs[x.vreg], a.locs[y.vreg],
                        "{} and {} are live at the same time",
                        x.vreg, y.vreg
                    );
                }
            }
        }
    }

    fn consume(f: &mut Function, b: BlockId, v: InstrId) {
        f.push(b, Opcode::Test, None, vec![Operand::linked(v, B64); 2]);
    }

    #[test]
    fn straight_line_reuses_registers() {
        let mut f = Function::new("t");
        let b = f.new_block();
        let x = f.push(b, Opcode::Move, Some(B64), vec![imm(1)]);
        let y = f.push(b, Opcode::Add, Some(B64), vec![Operand::linked(x, B64), imm(2)]);
        let z = f.push(b, Opcode::Add, Some(B64), vec![Operand::linked(y, B64), imm(3)]);
        f.push(b, Opcode::Return, None, vec![Operand::linked(z, B64)]);
        let a = allocate(&mut f);
        // Each value dies as the next is defined, so they can all share one register.
        assert_eq!(a.locs[x], PhyLocation::RAX);
        assert_eq!(a.locs[y], PhyLocation::RAX);
        assert_eq!(a.locs[z], PhyLocation::RAX);
        assert!(a.callee_saved.is_empty());
        assert_eq!(a.frame_size(), 0);
        assert!(f.instr(y).inputs[0].last_use);
        assert!(f.instr(InstrId::new(3)).inputs[0].last_use);
    }

    #[test]
    fn values_live_across_calls_are_callee_saved() {
        let mut f = Function::new("t");
        let b = f.new_block();
        let x = f.push(b, Opcode::Move, Some(B64), vec![imm(1)]);
        let y = f.push(b, Opcode::Move, Some(B64), vec![imm(2)]);
        let c = f.push(
            b,
            Opcode::Call,
            Some(B64),
            vec![imm(0x1234_5678), Operand::linked(y, B64)],
        );
        let s = f.push(
            b,
            Opcode::Add,
            Some(B64),
            vec![Operand::linked(x, B64), Operand::linked(c, B64)],
        );
        f.push(b, Opcode::Return, None, vec![Operand::linked(s, B64)]);
        let a = allocate(&mut f);
        assert_eq!(a.locs[x], PhyLocation::RBX);
        // `y` dies at the call, and the call's result is defined after it.
        assert_eq!(a.locs[y], PhyLocation::RAX);
        assert_eq!(a.locs[c], PhyLocation::RAX);
        assert_eq!(a.callee_saved, vec![PhyLocation::RBX]);
        assert_eq!(a.frame_size(), 16);
        assert!(f.instr(c).inputs[1].last_use);
    }

    #[test]
    fn pressure_spills_furthest_end() {
        let mut f = Function::new("t");
        let b = f.new_block();
        let vals = (0..14)
            .map(|i| f.push(b, Opcode::Move, Some(B64), vec![imm(i)]))
            .collect::<Vec<_>>();
        // Use the values in reverse order so that the earliest defined lives longest.
        let mut acc = f.push(b, Opcode::Move, Some(B64), vec![imm(0)]);
        for v in vals.iter().rev() {
            acc = f.push(
                b,
                Opcode::Add,
                Some(B64),
                vec![Operand::linked(acc, B64), Operand::linked(*v, B64)],
            );
        }
        f.push(b, Opcode::Return, None, vec![Operand::linked(acc, B64)]);
        let a = allocate(&mut f);
        let spilled = vals
            .iter()
            .filter(|v| a.locs[**v].is_memory())
            .collect::<Vec<_>>();
        assert_eq!(a.num_spilled, 3);
        assert_eq!(spilled.len(), 3);
        // The longest lived values go to the stack.
        assert!(a.locs[vals[0]].is_memory());
        assert!(a.locs[vals[1]].is_memory());
        // Spill slots follow the callee-saved area.
        let n = a.callee_saved.len() as i32;
        assert_eq!(a.locs[vals[0]], PhyLocation::stack_slot(8 * (n + 1)));
        assert_eq!(a.frame_size() % 16, 0);
        assert!(a
            .locs
            .iter()
            .all(|l| *l != PhyLocation::R10 && *l != PhyLocation::R11));
    }

    #[test]
    fn late_spill_does_not_reuse_an_overlapping_slot() {
        let mut f = Function::new("t");
        let b = f.new_block();
        let fillers = (0..11)
            .map(|i| f.push(b, Opcode::Move, Some(B64), vec![imm(i)]))
            .collect::<Vec<_>>();
        let short = f.push(b, Opcode::Move, Some(B64), vec![imm(11)]);
        // No register is left and `early` outlives every other value, so it is spilled.
        let early = f.push(b, Opcode::Move, Some(B64), vec![imm(12)]);
        // `late` takes `short`'s register while `early` is still in its slot.
        let late = f.push(b, Opcode::Add, Some(B64), vec![Operand::linked(short, B64), imm(1)]);
        for v in &fillers {
            consume(&mut f, b, *v);
        }
        consume(&mut f, b, early);
        // Once `early` has died, fill the registers again so that `late`, which lives longest,
        // is spilled after the fact.
        let more = (0..12)
            .map(|i| f.push(b, Opcode::Move, Some(B64), vec![imm(i)]))
            .collect::<Vec<_>>();
        for v in &more {
            consume(&mut f, b, *v);
        }
        f.push(b, Opcode::Return, None, vec![Operand::linked(late, B64)]);
        let a = allocate(&mut f);
        assert!(a.locs[early].is_memory());
        assert!(a.locs[late].is_memory());
        assert_ne!(a.locs[early], a.locs[late]);
        assert_eq!(a.num_spill_slots, 2);
        check_allocation(&f, &a);
    }

    #[test]
    fn spilled_slots_are_reused_once_free() {
        let mut f = Function::new("t");
        let b = f.new_block();
        // Two rounds of 13 simultaneously live values: each round spills one value, and the
        // second round may reuse the first round's slot.
        for _ in 0..2 {
            let vals = (0..13)
                .map(|i| f.push(b, Opcode::Move, Some(B64), vec![imm(i)]))
                .collect::<Vec<_>>();
            for v in vals.iter().rev() {
                consume(&mut f, b, *v);
            }
        }
        let r = f.push(b, Opcode::Move, Some(B64), vec![imm(0)]);
        f.push(b, Opcode::Return, None, vec![Operand::linked(r, B64)]);
        let a = allocate(&mut f);
        assert_eq!(a.num_spilled, 2);
        assert_eq!(a.num_spill_slots, 1);
        check_allocation(&f, &a);
    }

    #[test]
    fn high_pressure_allocations_are_valid() {
        // Interleaved definitions and uses, some live across calls.
        for (nvals, with_calls) in [(18, false), (24, false), (9, true), (16, true)] {
            let mut f = Function::new("t");
            let b = f.new_block();
            let mut live = Vec::new();
            for i in 0..nvals {
                live.push(f.push(b, Opcode::Move, Some(B64), vec![imm(i)]));
                if with_calls && i % 3 == 0 {
                    let c = f.push(b, Opcode::Call, Some(B64), vec![imm(0x1000)]);
                    live.push(c);
                }
                if i % 4 == 3 {
                    let v = live.remove(live.len() / 2);
                    consume(&mut f, b, v);
                }
            }
            let mut acc = f.push(b, Opcode::Move, Some(B64), vec![imm(0)]);
            for v in live {
                acc = f.push(
                    b,
                    Opcode::Add,
                    Some(B64),
                    vec![Operand::linked(acc, B64), Operand::linked(v, B64)],
                );
            }
            f.push(b, Opcode::Return, None, vec![Operand::linked(acc, B64)]);
            let a = allocate(&mut f);
            assert!(a.num_spilled > 0, "{nvals} {with_calls}");
            check_allocation(&f, &a);
        }
    }

    #[test]
    fn phis_overlap_their_inputs_at_the_edge() {
        let mut f = Function::new("t");
        let b0 = f.new_block();
        let b1 = f.new_block();
        let b2 = f.new_block();
        let x = f.push(b0, Opcode::Move, Some(B64), vec![imm(1)]);
        f.push(b0, Opcode::Test, None, vec![Operand::linked(x, B64); 2]);
        f.push(b0, Opcode::BranchNZ, None, vec![Operand::label(b1), Operand::label(b2)]);
        let y = f.push(b1, Opcode::Move, Some(B64), vec![imm(2)]);
        f.push(b1, Opcode::Branch, None, vec![Operand::label(b2)]);
        let p = f.push(b2, Opcode::Phi, Some(B64), Vec::new());
        let q = f.push(b2, Opcode::Phi, Some(B64), Vec::new());
        f.add_input(p, Operand::label(b0));
        f.add_input(p, Operand::linked(x, B64));
        f.add_input(p, Operand::label(b1));
        f.add_input(p, Operand::linked(y, B64));
        f.add_input(q, Operand::label(b0));
        f.add_input(q, imm(7));
        f.add_input(q, Operand::label(b1));
        f.add_input(q, Operand::linked(x, B64));
        let s = f.push(
            b2,
            Opcode::Add,
            Some(B64),
            vec![Operand::linked(p, B64), Operand::linked(q, B64)],
        );
        f.push(b2, Opcode::Return, None, vec![Operand::linked(s, B64)]);
        let a = allocate(&mut f);
        assert_ne!(a.locs[p], a.locs[q]);
        assert_ne!(a.locs[p], a.locs[x]);
        assert_ne!(a.locs[q], a.locs[x]);
        assert_ne!(a.locs[y], a.locs[x]);
        assert!(f.instr(s).inputs[0].last_use);
        assert!(f.instr(s).inputs[1].last_use);
        assert!(!f.instr(p).inputs[1].last_use);
    }

    #[test]
    fn deopt_live_values_get_locations() {
        use crate::{
            hir::{builder::build, refcount::insert_refcount_ops},
            runtime::{
                code::{CodeBuilder, Opcode as BcOpcode},
                Globals,
            },
        };
        let code = CodeBuilder::new("test")
            .args(&["x", "y"])
            .op(BcOpcode::LoadFast, 0)
            .op(BcOpcode::JumpIfFalseOrPop, 6)
            .op(BcOpcode::LoadFast, 1)
            .op(BcOpcode::ReturnValue, 0)
            .build();
        let globals = Globals::new();
        let mut hir = build(code, &globals).unwrap();
        insert_refcount_ops(&mut hir);
        let mut l = lower(&hir, &globals).func;
        let a = allocate(&mut l);
        let meta = &l.deopts[0];
        assert_eq!(meta.live_values.len(), 2);
        for lv in &meta.live_values {
            assert_ne!(lv.location, PhyLocation::REG_INVALID);
        }
        // Both arguments are live across the truthiness call.
        assert!(meta
            .live_values
            .iter()
            .all(|lv| CALLEE_SAVE_REGS.has(lv.location)));
        assert_ne!(meta.live_values[0].location, meta.live_values[1].location);
        assert!(a.callee_saved.len() >= 2);
    }
}
